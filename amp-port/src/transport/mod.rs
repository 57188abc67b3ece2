//! Physical transport layer for board connections.
//!
//! A transport moves node-addressed transactions over one kind of link:
//! the native FireWire bus ([`firewire`]) or FireWire tunnelled through
//! Ethernet frames or UDP datagrams ([`eth`]). Transports know nothing about
//! boards; mapping boards to nodes and running whole-registry cycles is done
//! once, for all of them, by [`crate::port::Port`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{NodeAddr, NodeId, Quadlet};

pub mod eth;
pub mod firewire;
mod signal;

pub use signal::{TopologyChange, TopologySignal};

/// Kind of link a port runs over.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::FromRepr,
    strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum PortType {
    #[strum(serialize = "Firewire")]
    Firewire = 0,
    #[strum(serialize = "Ethernet-Raw")]
    EthRaw = 1,
    #[strum(serialize = "Ethernet-UDP")]
    EthUdp = 2,
}

impl PortType {
    /// Display name of the port type.
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Display name for a raw port-type value; unknown values are not an error.
pub fn port_type_name(raw: u8) -> &'static str {
    PortType::from_repr(raw).map_or("Unknown", PortType::name)
}

/// Node-level transaction primitives of one link.
///
/// Every call is at-most-once: a failure is returned as-is and never retried
/// here.
#[async_trait]
pub trait Transport: Send {
    fn port_type(&self) -> PortType;

    fn port_num(&self) -> u32;

    /// Whether the link is open and usable.
    fn is_open(&self) -> bool;

    /// Acquire the link. The caller rescans the topology afterwards.
    async fn open(&mut self) -> Result<()>;

    /// Release the link.
    async fn close(&mut self);

    /// Number of nodes reachable on the bus (board nodes are numbered from 0).
    async fn discover_nodes(&mut self) -> Result<usize>;

    /// Current topology epoch as known by this side.
    fn bus_generation(&self) -> u32;

    /// Signal raised when the topology changed under us.
    fn topology_signal(&self) -> &TopologySignal;

    /// Pump link events (e.g. bus reset notifications).
    async fn poll_events(&mut self) -> Result<()>;

    async fn read_quadlet_node(&mut self, node: NodeId, addr: NodeAddr) -> Result<Quadlet>;

    async fn write_quadlet_node(&mut self, node: NodeId, addr: NodeAddr, data: Quadlet)
        -> Result<()>;

    async fn read_block_node(
        &mut self,
        node: NodeId,
        addr: NodeAddr,
        data: &mut [Quadlet],
    ) -> Result<()>;

    async fn write_block_node(&mut self, node: NodeId, addr: NodeAddr, data: &[Quadlet])
        -> Result<()>;

    /// Pause needed before a slow programming-memory (PROM) write.
    fn prom_delay(&self) -> Duration;

    /// Number of processes using the same link, including this one.
    fn user_count(&self) -> u32;
}
