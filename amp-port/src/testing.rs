//! Simulated FireWire bus for tests.
//!
//! One [`SimFabric`] holds the nodes. [`SimBus`] drives it like a native bus
//! driver would; [`SimBridge`] acts as the Ethernet bridge and talks to the
//! transport in real frames, decoded and encoded with the library codec.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::board::{hardware, regs};
use crate::error::{Error, Result};
use crate::hw_trait::{BusDriver, PacketLink};
use crate::port::broadcast;
use crate::transport::eth::crc::packet_crc;
use crate::transport::eth::packet::{self, ExtraData, ExtraFlags, FpgaStatus, Request, RequestFrame, RCODE_COMPLETE};
use crate::transport::TopologySignal;
use crate::types::{NodeAddr, NodeId, Quadlet};

/// Node the bridge answers broadcast reads from.
const BRIDGE_NODE: NodeId = NodeId::from_bus_id(0xffc0);

pub struct SimNode {
    board_id: u8,
    memory: BTreeMap<NodeAddr, Quadlet>,
    realtime_write: Vec<Quadlet>,
    responsive: bool,
    frozen_broadcast: bool,
}

impl SimNode {
    pub fn with_hardware(board_id: u8, hardware_version: u32, firmware_version: u32) -> Self {
        let mut memory = BTreeMap::new();
        memory.insert(regs::STATUS, (board_id as u32) << regs::STATUS_BOARD_ID_SHIFT);
        memory.insert(regs::HARDWARE_VERSION, hardware_version);
        memory.insert(regs::FIRMWARE_VERSION, firmware_version);
        Self {
            board_id,
            memory,
            realtime_write: Vec::new(),
            responsive: true,
            frozen_broadcast: false,
        }
    }

    pub fn qla(board_id: u8, firmware_version: u32) -> Self {
        Self::with_hardware(board_id, hardware::QLA1, firmware_version)
    }

    fn read(&self, addr: NodeAddr) -> Quadlet {
        self.memory.get(&addr).copied().unwrap_or(0)
    }
}

struct FabricState {
    nodes: Vec<SimNode>,
    generation: u32,
    reset_active: bool,
    broadcast_lag: u32,
    pending_sections: Option<(u32, Vec<(u8, Vec<Quadlet>)>)>,
}

/// Shared simulated bus.
#[derive(Clone)]
pub struct SimFabric {
    state: Arc<Mutex<FabricState>>,
}

impl SimFabric {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FabricState {
                nodes: Vec::new(),
                generation: 0,
                reset_active: false,
                broadcast_lag: 0,
                pending_sections: None,
            })),
        }
    }

    /// Append a node; returns its node number.
    pub fn add_node(&self, node: SimNode) -> usize {
        let mut state = self.state.lock();
        state.nodes.push(node);
        state.nodes.len() - 1
    }

    pub fn remove_node(&self, index: usize) {
        self.state.lock().nodes.remove(index);
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn generation(&self) -> u32 {
        self.state.lock().generation
    }

    pub fn set_generation(&self, generation: u32) {
        self.state.lock().generation = generation;
    }

    /// Advance the bus generation.
    pub fn bus_reset(&self) {
        self.state.lock().generation += 1;
    }

    pub fn set_reset_active(&self, active: bool) {
        self.state.lock().reset_active = active;
    }

    pub fn set_responsive(&self, index: usize, responsive: bool) {
        self.state.lock().nodes[index].responsive = responsive;
    }

    /// Hub polls that still see the previous sections after a broadcast
    /// read request.
    pub fn set_broadcast_lag(&self, polls: u32) {
        self.state.lock().broadcast_lag = polls;
    }

    /// Stop node `index` from refreshing its hub section.
    pub fn freeze_broadcast(&self, index: usize) {
        self.state.lock().nodes[index].frozen_broadcast = true;
    }

    pub fn poke(&self, index: usize, addr: NodeAddr, data: &[Quadlet]) {
        let mut state = self.state.lock();
        for (i, &q) in data.iter().enumerate() {
            state.nodes[index].memory.insert(addr + i as u64, q);
        }
    }

    pub fn peek(&self, index: usize, addr: NodeAddr, quads: usize) -> Vec<Quadlet> {
        let state = self.state.lock();
        (0..quads).map(|i| state.nodes[index].read(addr + i as u64)).collect()
    }

    /// Last real-time block written to node `index`.
    pub fn realtime_written(&self, index: usize) -> Vec<Quadlet> {
        self.state.lock().nodes[index].realtime_write.clone()
    }

    fn extra(&self) -> ExtraData {
        let state = self.state.lock();
        ExtraData {
            flags: if state.reset_active {
                ExtraFlags::BUS_RESET
            } else {
                ExtraFlags::empty()
            },
            epoch: state.generation as u8,
            fpga_status: FpgaStatus::UDP | FpgaStatus::LINK_ON,
            receive_ticks: 1200,
            total_ticks: 2400,
        }
    }

    fn quadlet_read(&self, node: NodeId, addr: NodeAddr) -> Option<Quadlet> {
        let state = self.state.lock();
        let node = if node.is_broadcast() { BRIDGE_NODE } else { node };
        let target = state.nodes.get(node.index()).filter(|n| n.responsive)?;
        if addr == regs::BRIDGE_FW_STATUS {
            let nodes = state.nodes.len() as u32 & regs::BRIDGE_NODE_COUNT_MASK;
            return Some((nodes << regs::BRIDGE_NODE_COUNT_SHIFT) | (state.generation & regs::BRIDGE_GENERATION_MASK));
        }
        Some(target.read(addr))
    }

    fn quadlet_write(&self, node: NodeId, addr: NodeAddr, data: Quadlet) -> bool {
        let mut state = self.state.lock();
        if node.is_broadcast() {
            if addr == broadcast::READ_REQUEST_ADDR {
                Self::start_broadcast_read(&mut state, data);
            } else {
                for target in state.nodes.iter_mut().filter(|n| n.responsive) {
                    target.memory.insert(addr, data);
                }
            }
            return true;
        }
        match state.nodes.get_mut(node.index()).filter(|n| n.responsive) {
            Some(target) => {
                target.memory.insert(addr, data);
                true
            }
            None => false,
        }
    }

    fn start_broadcast_read(state: &mut FabricState, request: Quadlet) {
        let sequence = (request >> 16) as u16;
        let mask = (request & 0xffff) as u16;
        let sections = state
            .nodes
            .iter()
            .filter(|n| n.responsive && !n.frozen_broadcast && mask & (1 << n.board_id) != 0)
            .map(|n| {
                let mut section = vec![broadcast::section_header(sequence, broadcast::MAX_SECTION_DATA)];
                section.extend((0..broadcast::MAX_SECTION_DATA as u64).map(|i| n.read(regs::REALTIME_BLOCK + i)));
                (n.board_id, section)
            })
            .collect();
        if state.broadcast_lag == 0 {
            Self::store_sections(state, sections);
        } else {
            state.pending_sections = Some((state.broadcast_lag, sections));
        }
    }

    fn store_sections(state: &mut FabricState, sections: Vec<(u8, Vec<Quadlet>)>) {
        for node in &mut state.nodes {
            for (id, section) in &sections {
                let base = broadcast::HUB_BUFFER_ADDR + (*id as usize * broadcast::SECTION_QUADS) as u64;
                for (i, &q) in section.iter().enumerate() {
                    node.memory.insert(base + i as u64, q);
                }
            }
        }
    }

    fn block_read(&self, node: NodeId, addr: NodeAddr, quads: usize) -> Option<Vec<Quadlet>> {
        let mut state = self.state.lock();
        if addr == broadcast::HUB_BUFFER_ADDR {
            match state.pending_sections.take() {
                Some((0, sections)) => Self::store_sections(&mut state, sections),
                Some((polls, sections)) => state.pending_sections = Some((polls - 1, sections)),
                None => {}
            }
        }
        let target = state.nodes.get(node.index()).filter(|n| n.responsive)?;
        Some((0..quads as u64).map(|i| target.read(addr + i)).collect())
    }

    fn block_write(&self, node: NodeId, addr: NodeAddr, data: &[Quadlet]) -> bool {
        let mut state = self.state.lock();
        if node.is_broadcast() && addr == broadcast::WRITE_ADDR {
            for (id, part) in broadcast::unpack_write(data) {
                if let Some(target) = state.nodes.iter_mut().find(|n| n.board_id == id && n.responsive) {
                    target.realtime_write = part.to_vec();
                }
            }
            return true;
        }
        let Some(target) = state.nodes.get_mut(node.index()).filter(|n| n.responsive) else {
            return false;
        };
        if addr == regs::REALTIME_BLOCK {
            target.realtime_write = data.to_vec();
        } else {
            for (i, &q) in data.iter().enumerate() {
                target.memory.insert(addr + i as u64, q);
            }
        }
        true
    }
}

/// Native bus driver over a [`SimFabric`].
pub struct SimBus {
    fabric: SimFabric,
    open: bool,
    fail_open: bool,
    handler: Option<Arc<TopologySignal>>,
    seen_generation: u32,
}

impl SimBus {
    pub fn new(fabric: SimFabric) -> Self {
        Self {
            fabric,
            open: false,
            fail_open: false,
            handler: None,
            seen_generation: 0,
        }
    }

    pub fn fail_open(&mut self, fail: bool) {
        self.fail_open = fail;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn has_reset_handler(&self) -> bool {
        self.handler.is_some()
    }

    fn no_response(node: NodeId) -> Error {
        Error::Transaction(format!("no response from node {}", node))
    }
}

#[async_trait]
impl BusDriver for SimBus {
    fn open(&mut self, port_num: u32) -> Result<()> {
        if self.fail_open {
            return Err(Error::Transaction(format!("cannot open /dev/fw{}", port_num)));
        }
        self.open = true;
        self.seen_generation = self.fabric.generation();
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn install_reset_handler(&mut self, signal: Arc<TopologySignal>) {
        self.handler = Some(signal);
    }

    fn remove_reset_handler(&mut self) {
        self.handler = None;
    }

    fn generation(&self) -> u32 {
        self.fabric.generation()
    }

    fn node_count(&mut self) -> Result<usize> {
        Ok(self.fabric.node_count())
    }

    fn poll_events(&mut self) -> Result<()> {
        let generation = self.fabric.generation();
        if generation != self.seen_generation {
            self.seen_generation = generation;
            if let Some(handler) = &self.handler {
                handler.notify(generation);
            }
        }
        Ok(())
    }

    async fn read_quadlet(&mut self, node: NodeId, addr: NodeAddr) -> Result<Quadlet> {
        self.fabric.quadlet_read(node, addr).ok_or_else(|| Self::no_response(node))
    }

    async fn write_quadlet(&mut self, node: NodeId, addr: NodeAddr, data: Quadlet) -> Result<()> {
        if self.fabric.quadlet_write(node, addr, data) {
            Ok(())
        } else {
            Err(Self::no_response(node))
        }
    }

    async fn read_block(&mut self, node: NodeId, addr: NodeAddr, data: &mut [Quadlet]) -> Result<()> {
        let block = self
            .fabric
            .block_read(node, addr, data.len())
            .ok_or_else(|| Self::no_response(node))?;
        data.copy_from_slice(&block);
        Ok(())
    }

    async fn write_block(&mut self, node: NodeId, addr: NodeAddr, data: &[Quadlet]) -> Result<()> {
        if self.fabric.block_write(node, addr, data) {
            Ok(())
        } else {
            Err(Self::no_response(node))
        }
    }
}

/// One-shot fault applied to the next response of a [`SimBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeFault {
    /// Never answer.
    Drop,
    /// Flip a bit covered by the header CRC.
    CorruptCrc,
    /// Answer with another transaction label.
    WrongLabel,
    /// Answer a block read with one quadlet less.
    ShortBlock,
    /// Hold the response back until the next one is queued.
    Late,
}

/// Ethernet bridge over a [`SimFabric`].
pub struct SimBridge {
    fabric: SimFabric,
    open: bool,
    responses: VecDeque<Bytes>,
    sent: Vec<RequestFrame>,
    broadcast_sends: usize,
    fault: Option<BridgeFault>,
    held: Option<Bytes>,
}

impl SimBridge {
    pub fn new(fabric: SimFabric) -> Self {
        Self {
            fabric,
            open: true,
            responses: VecDeque::new(),
            sent: Vec::new(),
            broadcast_sends: 0,
            fault: None,
            held: None,
        }
    }

    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    pub fn inject_fault(&mut self, fault: BridgeFault) {
        self.fault = Some(fault);
    }

    /// Requests received so far, oldest first.
    pub fn sent_requests(&self) -> Vec<RequestFrame> {
        self.sent.clone()
    }

    /// Frames sent to the multicast address.
    pub fn broadcast_sends(&self) -> usize {
        self.broadcast_sends
    }

    fn respond(&mut self, mut response: BytesMut) {
        let mut late = false;
        match self.fault.take() {
            Some(BridgeFault::Drop) => return,
            Some(BridgeFault::Late) => late = true,
            Some(BridgeFault::CorruptCrc) => response[12] ^= 0x01,
            Some(BridgeFault::WrongLabel) => {
                response[2] ^= 0x04;
                let crc = packet_crc(&response[..16]);
                response[16..20].copy_from_slice(&crc.to_be_bytes());
            }
            Some(fault @ BridgeFault::ShortBlock) => self.fault = Some(fault),
            None => {}
        }
        self.fabric.extra().encode(&mut response);
        if late {
            self.held = Some(response.freeze());
            return;
        }
        if let Some(held) = self.held.take() {
            self.responses.push_back(held);
        }
        self.responses.push_back(response.freeze());
    }
}

#[async_trait]
impl PacketLink for SimBridge {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn send(&mut self, frame: &[u8], broadcast: bool) -> Result<()> {
        if broadcast {
            self.broadcast_sends += 1;
        }
        let request = RequestFrame::parse(frame)?;
        self.sent.push(request.clone());
        match request.request {
            Request::QuadletRead { node, addr, tl } => {
                if let Some(data) = self.fabric.quadlet_read(node, addr) {
                    let src = if node.is_broadcast() { BRIDGE_NODE } else { node };
                    self.respond(packet::quadlet_response(src, tl, data, RCODE_COMPLETE));
                }
            }
            Request::QuadletWrite { node, addr, data, .. } => {
                self.fabric.quadlet_write(node, addr, data);
            }
            Request::BlockRead { node, addr, nbytes, tl } => {
                let mut quads = nbytes as usize / 4;
                if self.fault == Some(BridgeFault::ShortBlock) {
                    self.fault = None;
                    quads -= 1;
                }
                if let Some(data) = self.fabric.block_read(node, addr, quads) {
                    self.respond(packet::block_response(node, tl, &data, RCODE_COMPLETE));
                }
            }
            Request::BlockWrite { node, addr, data, .. } => {
                self.fabric.block_write(node, addr, &data);
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes> {
        match self.responses.pop_front() {
            Some(frame) => Ok(frame),
            None => std::future::pending::<Result<Bytes>>().await,
        }
    }
}
