//! Transport-independent port.
//!
//! A [`Port`] owns one [`Transport`] and the [`Registry`] of boards attached
//! to it. Board ids are mapped to nodes here, so per-board operations,
//! whole-registry cycles and the broadcast protocols behave the same over
//! every transport.
//!
//! ```text
//!   caller ── read_all_boards ──► Port ── board → node ──► Transport ──► bus
//!                                  │                          │
//!                                  └──── TopologySignal ◄─────┘ (bus reset)
//! ```
//!
//! After a bus reset the node table can no longer be trusted. The port
//! refuses board operations with [`Error::TopologyStale`] until
//! [`Port::poll_events`] (or an explicit [`Port::scan_nodes`]) has rebuilt it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{self, Instant};

use crate::board::{hardware, regs, Board, BoardHandle, PortLink};
use crate::config::PortConfig;
use crate::error::{Direction, Error, Result};
use crate::tracing::prelude::*;
use crate::transport::{PortType, TopologyChange, Transport};
use crate::types::{BoardId, NodeAddr, NodeId, Quadlet, MAX_NODES};

pub mod broadcast;
mod descriptor;
mod mode;
mod registry;

pub use descriptor::PortDescriptor;
pub use mode::ProtocolMode;
pub use registry::Registry;

/// Granularity of the tokio timer; shorter broadcast poll intervals yield
/// to the runtime instead of sleeping.
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// Health counters of whole-registry cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Read cycles in which no board could be read.
    pub none_read: u64,
    /// Write cycles in which no board could be written.
    pub none_written: u64,
    /// Broadcast reads that timed out waiting for the hub.
    pub broadcast_timeouts: u64,
}

pub struct Port<T> {
    transport: T,
    registry: Registry,
    requested_protocol: ProtocolMode,
    broadcast_wait_timeout: Duration,
    broadcast_poll_interval: Duration,
    stale: bool,
    read_sequence: u16,
    stats: CycleStats,
}

impl<T: Transport> Port<T> {
    pub fn new(transport: T, config: &PortConfig) -> Result<Self> {
        config.validate()?;
        let mut registry = Registry::new(PortLink {
            port_type: transport.port_type(),
            port_num: transport.port_num(),
        });
        registry.set_hub(config.hub_board.map(BoardId::new).transpose()?);
        Ok(Self {
            transport,
            registry,
            requested_protocol: config.protocol,
            broadcast_wait_timeout: config.broadcast_wait_timeout(),
            broadcast_poll_interval: config.broadcast_poll_interval(),
            stale: true,
            read_sequence: 0,
            stats: CycleStats::default(),
        })
    }

    /// Open the transport and scan the bus.
    ///
    /// The configured protocol is applied afterwards; if the boards found so
    /// far cannot support it the port stays sequential.
    pub async fn init(&mut self) -> Result<()> {
        self.transport.open().await?;
        let boards = self.scan_nodes().await?;
        info!(
            port_type = %self.transport.port_type(),
            port = self.transport.port_num(),
            nodes = self.registry.num_nodes(),
            boards,
            "Port initialized"
        );
        if self.requested_protocol != self.registry.protocol() {
            if let Err(e) = self.registry.set_protocol(self.requested_protocol) {
                warn!(error = %e, "Keeping sequential protocol");
            }
        }
        Ok(())
    }

    /// Release the transport. Attached boards stay attached but lose their
    /// node mapping.
    pub async fn close(&mut self) {
        self.transport.close().await;
        self.registry.clear_topology();
        self.registry.notify_nodes();
        self.stale = true;
        debug!(port_type = %self.transport.port_type(), "Port closed");
    }

    /// Whether the transport is open and the node table is current.
    pub fn is_ok(&self) -> bool {
        self.transport.is_open() && !self.stale && !self.transport.topology_signal().is_pending()
    }

    pub fn port_type(&self) -> PortType {
        self.transport.port_type()
    }

    pub fn port_type_name(&self) -> &'static str {
        self.transport.port_type().name()
    }

    pub fn port_num(&self) -> u32 {
        self.transport.port_num()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    /// Sequence number of the last broadcast read request.
    pub fn read_sequence(&self) -> u16 {
        self.read_sequence
    }

    pub fn bus_generation(&self) -> u32 {
        self.transport.bus_generation()
    }

    /// Attach a board; it is told its port and current node.
    pub fn add_board<B: Board + 'static>(&mut self, board: &Arc<Mutex<B>>) -> Result<BoardId> {
        let handle: BoardHandle = board.clone();
        self.add_board_handle(&handle)
    }

    pub fn add_board_handle(&mut self, handle: &BoardHandle) -> Result<BoardId> {
        let id = self.registry.add(handle)?;
        debug!(board = %id, node = ?self.registry.node_of(id), "Board added");
        self.registry.revalidate_protocol();
        Ok(id)
    }

    pub fn remove_board(&mut self, board: u8) -> Result<()> {
        let id = self.registry.remove(board)?;
        debug!(board = %id, "Board removed");
        Ok(())
    }

    pub fn protocol(&self) -> ProtocolMode {
        self.registry.protocol()
    }

    pub fn set_protocol(&mut self, mode: ProtocolMode) -> Result<()> {
        self.registry.set_protocol(mode)
    }

    /// Set the protocol from its raw value; unknown values are ignored.
    pub fn set_protocol_value(&mut self, raw: u8) -> Result<()> {
        match ProtocolMode::from_repr(raw) {
            Some(mode) => self.set_protocol(mode),
            None => {
                error!(protocol = raw, "Unknown protocol (ignored)");
                Err(Error::UnknownProtocol(raw))
            }
        }
    }

    /// Designate the board whose hub buffer broadcast reads poll.
    pub fn set_hub_board(&mut self, board: Option<u8>) -> Result<()> {
        let hub = board.map(BoardId::new).transpose()?;
        self.registry.set_hub(hub);
        Ok(())
    }

    pub fn hub_board(&self) -> Option<BoardId> {
        self.registry.hub()
    }

    /// Rebuild the node table from the bus. Returns the number of boards
    /// found.
    pub async fn scan_nodes(&mut self) -> Result<usize> {
        if !self.transport.is_open() {
            return Err(Error::PortNotOpen);
        }
        // Whatever was pending is covered by this scan
        self.transport.topology_signal().take();
        self.registry.clear_topology();
        self.stale = true;

        let result = self.scan_bus().await;
        self.registry.notify_nodes();
        let boards = result?;

        let generation = self.transport.bus_generation();
        if let Some(change) = self.transport.topology_signal().take() {
            warn!(generation = change.generation, "Bus reset during scan");
            return Err(Error::TopologyStale {
                generation: change.generation,
            });
        }
        self.stale = false;
        self.registry.revalidate_protocol();
        debug!(generation, boards, "Topology scan complete");
        Ok(boards)
    }

    async fn scan_bus(&mut self) -> Result<usize> {
        let mut nodes = self.transport.discover_nodes().await?;
        if nodes >= MAX_NODES {
            warn!(nodes, "Too many nodes, ignoring the excess");
            nodes = MAX_NODES - 1;
        }

        let mut boards = 0;
        for n in 0..nodes {
            let node = NodeId::new(n as u8)?;
            match self.probe_node(node).await {
                Ok(Some((id, hw, fw))) => {
                    if self.registry.map(node, id, hw, fw) {
                        boards += 1;
                        info!(
                            board = %id,
                            node = %node,
                            hardware = hardware::name(hw),
                            firmware = fw,
                            "Found board"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(node = %node, error = %e, "Failed to probe node"),
            }
        }
        self.registry.set_num_nodes(nodes);
        Ok(boards)
    }

    /// Identify the board at `node`; `None` if it is not a known board type.
    async fn probe_node(&mut self, node: NodeId) -> Result<Option<(BoardId, u32, u32)>> {
        let hw = self.transport.read_quadlet_node(node, regs::HARDWARE_VERSION).await?;
        if !hardware::is_known(hw) {
            debug!(node = %node, hardware = format_args!("{:#010x}", hw), "Skipping unknown node");
            return Ok(None);
        }
        let status = self.transport.read_quadlet_node(node, regs::STATUS).await?;
        let id = BoardId::new(((status >> regs::STATUS_BOARD_ID_SHIFT) & regs::STATUS_BOARD_ID_MASK) as u8)?;
        let fw = self.transport.read_quadlet_node(node, regs::FIRMWARE_VERSION).await?;
        Ok(Some((id, hw, fw)))
    }

    /// Pump transport events and rescan if the topology changed.
    ///
    /// Returns the change that triggered a rescan, if any.
    pub async fn poll_events(&mut self) -> Result<Option<TopologyChange>> {
        if !self.transport.is_open() {
            return Err(Error::PortNotOpen);
        }
        self.transport.poll_events().await?;
        let change = match self.transport.topology_signal().take() {
            Some(change) => Some(change),
            None if self.stale => Some(TopologyChange {
                generation: self.transport.bus_generation(),
            }),
            None => None,
        };
        if let Some(change) = change {
            info!(generation = change.generation, "Topology changed, rescanning");
            self.stale = true;
            self.scan_nodes().await?;
        }
        Ok(change)
    }

    fn ensure_fresh(&mut self) -> Result<()> {
        if !self.transport.is_open() {
            return Err(Error::PortNotOpen);
        }
        if let Some(change) = self.transport.topology_signal().take() {
            warn!(generation = change.generation, "Topology changed, node table is stale");
            self.stale = true;
        }
        if self.stale {
            return Err(Error::TopologyStale {
                generation: self.transport.bus_generation(),
            });
        }
        Ok(())
    }

    /// Vet the outcome of a transaction made through the node table. A bus
    /// reset seen during the transaction makes its result unusable.
    fn settle<R>(&mut self, result: Result<R>) -> Result<R> {
        let pending = self.transport.topology_signal().is_pending();
        if pending || matches!(result, Err(Error::TopologyStale { .. })) {
            self.stale = true;
            let generation = self.transport.bus_generation();
            warn!(generation, "Topology changed during transaction");
            return Err(Error::TopologyStale { generation });
        }
        result
    }

    fn node_for(&mut self, board: u8) -> Result<NodeId> {
        let id = BoardId::new(board)?;
        self.ensure_fresh()?;
        self.registry.node_of(id).ok_or(Error::BoardNotOnBus(id))
    }

    pub async fn read_quadlet(&mut self, board: u8, addr: NodeAddr) -> Result<Quadlet> {
        let node = self.node_for(board)?;
        let result = self.transport.read_quadlet_node(node, addr).await.inspect_err(|e| {
            debug!(board, node = %node, addr, error = %e, "Quadlet read failed");
        });
        self.settle(result)
    }

    pub async fn write_quadlet(&mut self, board: u8, addr: NodeAddr, data: Quadlet) -> Result<()> {
        let node = self.node_for(board)?;
        let result = self.transport.write_quadlet_node(node, addr, data).await.inspect_err(|e| {
            debug!(board, node = %node, addr, error = %e, "Quadlet write failed");
        });
        self.settle(result)
    }

    pub async fn read_block(&mut self, board: u8, addr: NodeAddr, data: &mut [Quadlet]) -> Result<()> {
        let node = self.node_for(board)?;
        let result = self.transport.read_block_node(node, addr, data).await.inspect_err(|e| {
            debug!(board, node = %node, addr, error = %e, "Block read failed");
        });
        self.settle(result)
    }

    pub async fn write_block(&mut self, board: u8, addr: NodeAddr, data: &[Quadlet]) -> Result<()> {
        let node = self.node_for(board)?;
        let result = self.transport.write_block_node(node, addr, data).await.inspect_err(|e| {
            debug!(board, node = %node, addr, error = %e, "Block write failed");
        });
        self.settle(result)
    }

    /// Attached boards that are still alive, lowest id first.
    fn live_boards(&self) -> Vec<(BoardId, BoardHandle)> {
        self.registry
            .in_use()
            .filter_map(|id| self.registry.board(id).map(|board| (id, board)))
            .collect()
    }

    /// Read the real-time block of every attached board.
    pub async fn read_all_boards(&mut self) -> Result<()> {
        self.ensure_fresh()?;
        if self.registry.protocol().broadcast_read() {
            self.read_all_boards_broadcast().await
        } else {
            self.read_all_boards_sequential().await
        }
    }

    /// Write the real-time block of every attached board.
    pub async fn write_all_boards(&mut self) -> Result<()> {
        self.ensure_fresh()?;
        if self.registry.protocol().broadcast_write() {
            self.write_all_boards_broadcast().await
        } else {
            self.write_all_boards_sequential().await
        }
    }

    async fn read_all_boards_sequential(&mut self) -> Result<()> {
        let boards = self.live_boards();
        let mut failed = 0;
        for (i, (id, board)) in boards.iter().enumerate() {
            let ok = match self.registry.node_of(*id) {
                Some(node) => {
                    let mut data = vec![0; board.lock().read_buffer().len()];
                    let result = self.transport.read_block_node(node, regs::REALTIME_BLOCK, &mut data).await;
                    match self.settle(result) {
                        Ok(()) => {
                            board.lock().read_buffer().copy_from_slice(&data);
                            true
                        }
                        Err(e @ Error::TopologyStale { .. }) => {
                            for (_, unread) in &boards[i..] {
                                unread.lock().set_read_valid(false);
                            }
                            return Err(e);
                        }
                        Err(e) => {
                            debug!(board = %id, node = %node, error = %e, "Read failed");
                            false
                        }
                    }
                }
                None => false,
            };
            board.lock().set_read_valid(ok);
            if !ok {
                failed += 1;
            }
        }
        self.finish_cycle(Direction::Read, failed, boards.len())
    }

    async fn write_all_boards_sequential(&mut self) -> Result<()> {
        let boards = self.live_boards();
        let mut failed = 0;
        for (i, (id, board)) in boards.iter().enumerate() {
            let ok = match self.registry.node_of(*id) {
                Some(node) => {
                    let data = board.lock().write_buffer().to_vec();
                    let result = self.transport.write_block_node(node, regs::REALTIME_BLOCK, &data).await;
                    match self.settle(result) {
                        Ok(()) => true,
                        Err(e @ Error::TopologyStale { .. }) => {
                            for (_, unwritten) in &boards[i..] {
                                unwritten.lock().set_write_valid(false);
                            }
                            return Err(e);
                        }
                        Err(e) => {
                            debug!(board = %id, node = %node, error = %e, "Write failed");
                            false
                        }
                    }
                }
                None => false,
            };
            board.lock().set_write_valid(ok);
            if !ok {
                failed += 1;
            }
        }
        self.finish_cycle(Direction::Write, failed, boards.len())
    }

    async fn write_all_boards_broadcast(&mut self) -> Result<()> {
        let boards = self.live_boards();
        let mut buffers = Vec::with_capacity(boards.len());
        let mut failed = 0;
        for (id, board) in &boards {
            if self.registry.node_of(*id).is_some() {
                buffers.push((*id, board.lock().write_buffer().to_vec()));
            } else {
                board.lock().set_write_valid(false);
                failed += 1;
            }
        }
        if buffers.is_empty() {
            return self.finish_cycle(Direction::Write, failed, boards.len());
        }

        let packed = broadcast::pack_write(buffers.iter().map(|(id, data)| (*id, data.as_slice())));
        let result = self
            .transport
            .write_block_node(NodeId::BROADCAST, broadcast::WRITE_ADDR, &packed)
            .await;
        let ok = match self.settle(result) {
            Ok(()) => true,
            Err(e @ Error::TopologyStale { .. }) => {
                for (_, board) in &boards {
                    board.lock().set_write_valid(false);
                }
                return Err(e);
            }
            Err(e) => {
                debug!(error = %e, "Broadcast write failed");
                failed += buffers.len();
                false
            }
        };
        for (id, board) in &boards {
            if buffers.iter().any(|(written, _)| written == id) {
                board.lock().set_write_valid(ok);
            }
        }
        self.finish_cycle(Direction::Write, failed, boards.len())
    }

    async fn read_all_boards_broadcast(&mut self) -> Result<()> {
        let boards = self.live_boards();
        if boards.is_empty() {
            return Ok(());
        }
        let sequence = self.next_read_sequence();
        let hub = match self.broadcast_read(sequence).await {
            Ok(hub) => hub,
            Err(e) => {
                for (_, board) in &boards {
                    board.lock().set_read_valid(false);
                }
                if !matches!(e, Error::TopologyStale { .. }) {
                    self.stats.none_read += 1;
                }
                return Err(e);
            }
        };

        let mut failed = 0;
        for (id, board) in &boards {
            let mut board = board.lock();
            let buffer = board.read_buffer();
            let ok = match broadcast::section(&hub, *id) {
                Some(section)
                    if broadcast::section_sequence(section) == sequence
                        && buffer.len() <= broadcast::MAX_SECTION_DATA
                        && broadcast::section_len(section) >= buffer.len() =>
                {
                    let len = buffer.len();
                    buffer.copy_from_slice(&section[1..1 + len]);
                    true
                }
                _ => false,
            };
            board.set_read_valid(ok);
            if !ok {
                debug!(board = %id, "No broadcast data");
                failed += 1;
            }
        }
        self.finish_cycle(Direction::Read, failed, boards.len())
    }

    /// Sequence zero is what a hub section holds before any board has
    /// written it, so it is never used.
    fn next_read_sequence(&self) -> u16 {
        match self.read_sequence.wrapping_add(1) {
            0 => 1,
            sequence => sequence,
        }
    }

    /// Request and collect one broadcast read; returns the hub buffer.
    async fn broadcast_read(&mut self, sequence: u16) -> Result<Vec<Quadlet>> {
        self.write_broadcast_read_request(sequence).await?;
        self.wait_broadcast_read(sequence).await
    }

    /// Ask every board to broadcast its real-time block, stamped with
    /// `sequence`.
    pub async fn write_broadcast_read_request(&mut self, sequence: u16) -> Result<()> {
        self.ensure_fresh()?;
        let mask = self.registry.mapped_mask();
        self.read_sequence = sequence;
        trace!(sequence, mask = format_args!("{:#06x}", mask), "Broadcast read request");
        let result = self
            .transport
            .write_quadlet_node(
                NodeId::BROADCAST,
                broadcast::READ_REQUEST_ADDR,
                broadcast::read_request(sequence, mask),
            )
            .await;
        self.settle(result)
    }

    /// Poll the hub until every mapped board has stored its data for
    /// `sequence`, or the broadcast wait timeout expires.
    ///
    /// The hub is polled at most once per poll interval over the timeout,
    /// and always once more at the deadline.
    pub async fn wait_broadcast_read(&mut self, sequence: u16) -> Result<Vec<Quadlet>> {
        let mask = self.registry.mapped_mask();
        let Some((hub_id, hub_node)) = self.registry.effective_hub() else {
            return Err(Error::Protocol("no board on the bus to act as hub".into()));
        };
        let mut hub = vec![0; broadcast::hub_quads(mask)];
        let timeout = self.broadcast_wait_timeout;
        let interval = self.broadcast_poll_interval;
        let budget = poll_budget(timeout, interval);
        let deadline = Instant::now() + timeout;
        let mut polls = 0;
        loop {
            let result = self
                .transport
                .read_block_node(hub_node, broadcast::HUB_BUFFER_ADDR, &mut hub)
                .await;
            self.settle(result)?;
            if broadcast::sections_ready(&hub, mask, sequence) {
                trace!(sequence, polls = polls + 1, "Broadcast read complete");
                return Ok(hub);
            }
            polls += 1;
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if polls >= budget {
                time::sleep_until(deadline).await;
            } else if interval < TIMER_RESOLUTION {
                tokio::task::yield_now().await;
            } else {
                time::sleep(interval.min(deadline - now)).await;
            }
        }
        self.stats.broadcast_timeouts += 1;
        warn!(
            hub = %hub_id,
            sequence,
            polls,
            timeout_us = timeout.as_micros() as u64,
            "Broadcast read timed out"
        );
        Err(Error::Timeout)
    }

    fn finish_cycle(&mut self, direction: Direction, failed: usize, attempted: usize) -> Result<()> {
        if failed == 0 {
            return Ok(());
        }
        if failed == attempted {
            match direction {
                Direction::Read => self.stats.none_read += 1,
                Direction::Write => self.stats.none_written += 1,
            }
            warn!(%direction, boards = attempted, "No boards in cycle");
        }
        Err(Error::Cycle {
            direction,
            failed,
            attempted,
        })
    }

    /// Pause before writing to a board's PROM.
    pub async fn prom_delay(&self) {
        let delay = self.transport.prom_delay();
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
    }

    /// Processes using the same link, including this one.
    pub fn user_count(&self) -> u32 {
        self.transport.user_count()
    }
}

/// Hub polls that fit in `timeout` at one per `interval`, counting the first.
fn poll_budget(timeout: Duration, interval: Duration) -> u32 {
    let polls = timeout.as_micros() / interval.as_micros().max(1);
    u32::try_from(polls).unwrap_or(u32::MAX).saturating_add(1)
}
