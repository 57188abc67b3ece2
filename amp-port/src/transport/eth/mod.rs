//! FireWire tunnelled through raw Ethernet frames or UDP datagrams.
//!
//! The host talks to one bridge board, which forwards requests onto the
//! FireWire bus behind it and returns the responses together with FPGA
//! diagnostics. [`EthPort`] builds and validates those frames and tracks the
//! bus generation the bridge reports; the socket itself is a [`PacketLink`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::time::{self, Instant};

use crate::board::{hardware, regs};
use crate::config::PortConfig;
use crate::error::{Error, Result};
use crate::hw_trait::PacketLink;
use crate::tracing::prelude::*;
use crate::transport::{PortType, TopologySignal, Transport};
use crate::types::{NodeAddr, NodeId, Quadlet};

pub mod crc;
pub mod label;
pub mod mac;
pub mod packet;

use label::{EpochCache, TransactionLabels};
use packet::{ControlFlags, ExtraData, FpgaStatus, RequestBuilder, ResponseFrame};

/// Default time a read waits for its response.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(10);

/// Default pause before PROM writes.
pub const DEFAULT_PROM_DELAY: Duration = Duration::from_millis(5);

/// Hook run each time a read starts waiting for its response, with the node
/// the response should come from. Returning `false` abandons the wait.
pub type WaitCallback = Box<dyn FnMut(NodeId) -> bool + Send + Sync>;

/// Bridged transport over a [`PacketLink`].
///
/// The port borrows the link's socket but never closes it: [`Transport::close`]
/// only stops traffic, and the port can be opened again on the same link.
/// Use [`EthPort::into_link`] to take the link back.
pub struct EthPort<L> {
    link: L,
    port_type: PortType,
    port_num: u32,
    open: bool,
    labels: TransactionLabels,
    epoch: EpochCache,
    signal: Arc<TopologySignal>,
    receive_timeout: Duration,
    prom_delay: Duration,
    last_extra: Option<ExtraData>,
    dropped_frames: u64,
    wait_callback: Option<WaitCallback>,
}

impl<L: PacketLink> EthPort<L> {
    fn new(link: L, port_type: PortType, port_num: u32) -> Self {
        Self {
            link,
            port_type,
            port_num,
            open: false,
            labels: TransactionLabels::new(),
            epoch: EpochCache::new(),
            signal: Arc::new(TopologySignal::new()),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            prom_delay: DEFAULT_PROM_DELAY,
            last_extra: None,
            dropped_frames: 0,
            wait_callback: None,
        }
    }

    /// Raw Ethernet port on network interface `port_num`.
    pub fn raw(link: L, port_num: u32) -> Self {
        Self::new(link, PortType::EthRaw, port_num)
    }

    /// UDP port.
    pub fn udp(link: L) -> Self {
        Self::new(link, PortType::EthUdp, 0)
    }

    /// Take timing settings from `config`.
    pub fn with_config(mut self, config: &PortConfig) -> Self {
        self.receive_timeout = config.receive_timeout();
        self.prom_delay = config.prom_delay();
        self
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }

    pub fn set_wait_callback(&mut self, callback: Option<WaitCallback>) {
        self.wait_callback = callback;
    }

    /// Inbound frames discarded because they answered an earlier request.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Diagnostics of the last accepted response.
    pub fn last_extra_data(&self) -> Option<ExtraData> {
        self.last_extra
    }

    /// Time the FPGA spent receiving the last answered request.
    pub fn fpga_receive_time(&self) -> Duration {
        self.last_extra.map_or(Duration::ZERO, |e| e.receive_time())
    }

    /// Time from the start of reception until the FPGA queued its response.
    pub fn fpga_total_time(&self) -> Duration {
        self.last_extra.map_or(Duration::ZERO, |e| e.total_time())
    }

    /// Ethernet status word of the last accepted response.
    pub fn last_fpga_status(&self) -> Option<FpgaStatus> {
        self.last_extra.map(|e| e.fpga_status)
    }

    /// Whether the FPGA reported a FireWire bus reset in progress.
    pub fn bus_reset_active(&self) -> bool {
        self.last_extra.is_some_and(|e| e.bus_reset_active())
    }

    fn builder(&self, flags: ControlFlags) -> RequestBuilder {
        RequestBuilder::new(self.epoch.current()).with_flags(flags)
    }

    fn check_open(&self) -> Result<()> {
        if self.open && self.link.is_open() {
            Ok(())
        } else {
            Err(Error::PortNotOpen)
        }
    }

    async fn send(&mut self, frame: BytesMut, broadcast: bool) -> Result<()> {
        self.check_open()?;
        trace!(len = frame.len(), broadcast, "Sending frame");
        self.link.send(&frame, broadcast).await
    }

    /// Wait for the response carrying label `tl`.
    ///
    /// Intact frames with another label answer requests that already timed
    /// out; they are dropped and the wait goes on until the deadline.
    async fn receive(&mut self, node: NodeId, tl: u8) -> Result<Bytes> {
        let deadline = Instant::now() + self.receive_timeout;
        loop {
            if let Some(callback) = self.wait_callback.as_mut() {
                if !callback(node) {
                    debug!(node = %node, "Wait for response abandoned");
                    return Err(Error::Timeout);
                }
            }
            let frame = match time::timeout_at(deadline, self.link.recv()).await {
                Ok(frame) => frame?,
                Err(_) => {
                    debug!(
                        timeout_ms = self.receive_timeout.as_millis() as u64,
                        "No response from bridge"
                    );
                    return Err(Error::Timeout);
                }
            };
            match ResponseFrame::parse(&frame) {
                Ok(stale) if stale.response.label() != tl => {
                    self.dropped_frames += 1;
                    debug!(
                        expected = tl,
                        label = stale.response.label(),
                        "Dropping response to an earlier request"
                    );
                }
                _ => return Ok(frame),
            }
        }
    }

    /// Record diagnostics of an accepted response and watch for a new epoch.
    fn observe(&mut self, extra: ExtraData) {
        self.last_extra = Some(extra);
        if let Some(epoch) = self.epoch.observe(extra.epoch) {
            if self.signal.notify(epoch as u32) {
                info!(generation = epoch, "Bridge reported a FireWire bus reset");
            }
        }
    }

    /// Observe a response to a request stamped with epoch `sent`. The data of
    /// a response from another epoch may come from a different node.
    fn accept(&mut self, sent: u8, extra: ExtraData) -> Result<()> {
        self.observe(extra);
        if extra.epoch == sent {
            Ok(())
        } else {
            Err(Error::TopologyStale {
                generation: extra.epoch as u32,
            })
        }
    }

    async fn read_quadlet_flags(
        &mut self,
        node: NodeId,
        addr: NodeAddr,
        flags: ControlFlags,
    ) -> Result<(Quadlet, ExtraData)> {
        let tl = self.labels.next_label();
        let frame = self.builder(flags).quadlet_read(node, addr, tl);
        self.send(frame, node.is_broadcast()).await?;
        let response = self.receive(node, tl).await?;
        packet::parse_quadlet_response(&response, node, tl).inspect_err(|e| {
            warn!(node = %node, addr, error = %e, "Rejected quadlet response");
        })
    }
}

#[async_trait]
impl<L: PacketLink> Transport for EthPort<L> {
    fn port_type(&self) -> PortType {
        self.port_type
    }

    fn port_num(&self) -> u32 {
        self.port_num
    }

    fn is_open(&self) -> bool {
        self.open && self.link.is_open()
    }

    async fn open(&mut self) -> Result<()> {
        if !self.link.is_open() {
            error!(port_type = %self.port_type, "Packet link is not open");
            return Err(Error::PortNotOpen);
        }
        self.open = true;
        debug!(port_type = %self.port_type, port = self.port_num, "Bridged port open");
        Ok(())
    }

    /// Stop using the link. The socket stays with the link's owner.
    async fn close(&mut self) {
        if self.open {
            debug!(port_type = %self.port_type, port = self.port_num, "Bridged port closed");
            self.open = false;
        }
    }

    async fn discover_nodes(&mut self) -> Result<usize> {
        let (hw, _) = self
            .read_quadlet_flags(NodeId::BROADCAST, regs::HARDWARE_VERSION, ControlFlags::NOFORWARD)
            .await?;
        if !hardware::is_known(hw) {
            return Err(Error::Protocol(format!(
                "bridge reports unknown hardware version {:#010x}",
                hw
            )));
        }
        let (status, extra) = self
            .read_quadlet_flags(NodeId::BROADCAST, regs::BRIDGE_FW_STATUS, ControlFlags::NOFORWARD)
            .await?;
        self.last_extra = Some(extra);
        let nodes = ((status >> regs::BRIDGE_NODE_COUNT_SHIFT) & regs::BRIDGE_NODE_COUNT_MASK) as usize;
        let generation = (status & regs::BRIDGE_GENERATION_MASK) as u8;

        // Adopt the bridge's generation without flagging a change
        self.epoch.set(generation);
        self.signal.sync(generation as u32);
        info!(
            bridge = hardware::name(hw),
            nodes,
            generation,
            "Found Ethernet bridge"
        );
        Ok(nodes)
    }

    fn bus_generation(&self) -> u32 {
        self.epoch.current() as u32
    }

    fn topology_signal(&self) -> &TopologySignal {
        &self.signal
    }

    async fn poll_events(&mut self) -> Result<()> {
        // Generation changes arrive with responses
        self.check_open()
    }

    async fn read_quadlet_node(&mut self, node: NodeId, addr: NodeAddr) -> Result<Quadlet> {
        let sent = self.epoch.current();
        let (data, extra) = self.read_quadlet_flags(node, addr, ControlFlags::empty()).await?;
        self.accept(sent, extra)?;
        Ok(data)
    }

    async fn write_quadlet_node(&mut self, node: NodeId, addr: NodeAddr, data: Quadlet) -> Result<()> {
        let tl = self.labels.next_label();
        let frame = self.builder(ControlFlags::empty()).quadlet_write(node, addr, data, tl);
        self.send(frame, node.is_broadcast()).await
    }

    async fn read_block_node(
        &mut self,
        node: NodeId,
        addr: NodeAddr,
        data: &mut [Quadlet],
    ) -> Result<()> {
        let nbytes = u16::try_from(data.len() * 4)
            .map_err(|_| Error::Protocol(format!("block of {} quadlets too large", data.len())))?;
        let tl = self.labels.next_label();
        let sent = self.epoch.current();
        let frame = self.builder(ControlFlags::empty()).block_read(node, addr, nbytes, tl);
        self.send(frame, node.is_broadcast()).await?;
        let response = self.receive(node, tl).await?;
        let extra = packet::parse_block_response(&response, node, tl, data).inspect_err(|e| {
            warn!(node = %node, addr, error = %e, "Rejected block response");
        })?;
        self.accept(sent, extra)
    }

    async fn write_block_node(&mut self, node: NodeId, addr: NodeAddr, data: &[Quadlet]) -> Result<()> {
        if data.len() * 4 > u16::MAX as usize {
            return Err(Error::Protocol(format!(
                "block of {} quadlets too large",
                data.len()
            )));
        }
        let tl = self.labels.next_label();
        let frame = self.builder(ControlFlags::empty()).block_write(node, addr, data, tl);
        self.send(frame, node.is_broadcast()).await
    }

    fn prom_delay(&self) -> Duration {
        self.prom_delay
    }

    fn user_count(&self) -> u32 {
        1
    }
}
