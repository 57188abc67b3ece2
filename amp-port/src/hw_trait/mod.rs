//! Hardware abstraction layer traits.
//!
//! The port layer does not own any operating-system handle itself. The native
//! FireWire transport drives a [`BusDriver`] and the bridged transports drive
//! a [`PacketLink`]; concrete implementations (libraw1394 bindings, pcap or
//! raw sockets, UDP sockets) live outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::transport::TopologySignal;
use crate::types::{NodeAddr, NodeId, Quadlet};

/// Node-level primitives of a native FireWire bus driver.
#[async_trait]
pub trait BusDriver: Send {
    /// Acquire the driver handle for adapter `port_num`.
    fn open(&mut self, port_num: u32) -> Result<()>;

    /// Release the driver handle.
    fn close(&mut self);

    /// Install the reset handler. The driver calls
    /// [`TopologySignal::notify`] with the new generation on every bus reset.
    fn install_reset_handler(&mut self, signal: Arc<TopologySignal>);

    fn remove_reset_handler(&mut self);

    /// Current bus generation.
    fn generation(&self) -> u32;

    /// Nodes on the bus other than the local adapter.
    fn node_count(&mut self) -> Result<usize>;

    /// Process pending driver events without blocking.
    fn poll_events(&mut self) -> Result<()>;

    async fn read_quadlet(&mut self, node: NodeId, addr: NodeAddr) -> Result<Quadlet>;

    async fn write_quadlet(&mut self, node: NodeId, addr: NodeAddr, data: Quadlet) -> Result<()>;

    async fn read_block(&mut self, node: NodeId, addr: NodeAddr, data: &mut [Quadlet])
        -> Result<()>;

    async fn write_block(&mut self, node: NodeId, addr: NodeAddr, data: &[Quadlet]) -> Result<()>;
}

/// Frame-level access to an Ethernet or UDP link to a bridge board.
///
/// The link owns its socket. Frames handed to [`PacketLink::send`] start with
/// the control word; frames returned by [`PacketLink::recv`] start with the
/// FireWire response packet. Any Ethernet or UDP header is added and stripped
/// by the link.
#[async_trait]
pub trait PacketLink: Send {
    fn is_open(&self) -> bool;

    /// Send one frame; `broadcast` selects the multicast destination.
    async fn send(&mut self, frame: &[u8], broadcast: bool) -> Result<()>;

    /// Wait for the next inbound frame.
    async fn recv(&mut self) -> Result<Bytes>;
}
