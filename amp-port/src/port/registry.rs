//! Board registry of a port.
//!
//! Tracks which boards the caller attached, which boards the last topology
//! scan found on the bus, and the board/node mapping between the two. The
//! registry holds weak handles only; boards stay owned by the caller.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::mode::ProtocolMode;
use crate::board::{is_broadcast_capable, Board, BoardHandle, PortLink};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::{BoardId, NodeId, MAX_BOARDS, MAX_NODES};

#[derive(Default)]
struct Slot {
    handle: Option<Weak<Mutex<dyn Board>>>,
    /// Found on the bus by the last scan.
    exists: bool,
    firmware_version: u32,
    hardware_version: u32,
    node: Option<NodeId>,
}

/// Boards attached to a port and their position on the bus.
pub struct Registry {
    slots: [Slot; MAX_BOARDS],
    node_to_board: [Option<BoardId>; MAX_NODES],
    num_nodes: usize,
    board_count: usize,
    in_use_mask: u16,
    protocol: ProtocolMode,
    hub: Option<BoardId>,
    link: PortLink,
}

impl Registry {
    pub(crate) fn new(link: PortLink) -> Self {
        Self {
            slots: Default::default(),
            node_to_board: [None; MAX_NODES],
            num_nodes: 0,
            board_count: 0,
            in_use_mask: 0,
            protocol: ProtocolMode::Sequential,
            hub: None,
            link,
        }
    }

    /// Attach a board in the slot named by its board id.
    ///
    /// A board already in that slot is detached and replaced.
    pub(crate) fn add(&mut self, handle: &BoardHandle) -> Result<BoardId> {
        let raw = handle.lock().board_id();
        let id = BoardId::new(raw).inspect_err(|_| {
            error!(board = raw, "AddBoard: board number out of range");
        })?;

        let slot = &mut self.slots[id.index()];
        let displaced = slot.handle.take().and_then(|weak| weak.upgrade());
        match displaced {
            Some(old) if !Arc::ptr_eq(&old, handle) => old.lock().set_port(None),
            _ => {}
        }
        if self.in_use_mask & (1 << id.get()) == 0 {
            self.board_count += 1;
        }
        slot.handle = Some(Arc::downgrade(handle));
        self.in_use_mask |= 1 << id.get();

        let node = slot.node;
        let mut board = handle.lock();
        board.set_port(Some(self.link));
        board.set_node(node);
        Ok(id)
    }

    /// Detach the board in slot `raw`.
    pub(crate) fn remove(&mut self, raw: u8) -> Result<BoardId> {
        let id = BoardId::new(raw).inspect_err(|_| {
            error!(board = raw, "RemoveBoard: board number out of range");
        })?;
        let slot = &mut self.slots[id.index()];
        let Some(weak) = slot.handle.take() else {
            error!(board = %id, "RemoveBoard: board not found");
            return Err(Error::BoardNotFound(id));
        };
        if let Some(board) = weak.upgrade() {
            let mut board = board.lock();
            board.set_port(None);
            board.set_node(None);
        }
        self.in_use_mask &= !(1 << id.get());
        self.board_count -= 1;
        Ok(id)
    }

    /// Attached board in slot `id`, if it is still alive.
    pub fn board(&self, id: BoardId) -> Option<BoardHandle> {
        self.slots[id.index()].handle.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_in_use(&self, id: BoardId) -> bool {
        self.in_use_mask & (1 << id.get()) != 0
    }

    /// Ids of attached boards, lowest first.
    pub fn in_use(&self) -> impl Iterator<Item = BoardId> + '_ {
        BoardId::all().filter(|&id| self.is_in_use(id))
    }

    pub fn board_count(&self) -> usize {
        self.board_count
    }

    pub fn in_use_mask(&self) -> u16 {
        self.in_use_mask
    }

    /// Attached boards that the last scan mapped to a node.
    pub fn mapped_mask(&self) -> u16 {
        self.in_use()
            .filter(|&id| self.slots[id.index()].node.is_some())
            .fold(0, |mask, id| mask | (1 << id.get()))
    }

    /// Whether the last scan found board `id` on the bus.
    pub fn exists(&self, id: BoardId) -> bool {
        self.slots[id.index()].exists
    }

    pub fn node_of(&self, id: BoardId) -> Option<NodeId> {
        self.slots[id.index()].node
    }

    pub fn board_at(&self, node: NodeId) -> Option<BoardId> {
        self.node_to_board[node.index()]
    }

    /// Firmware version read by the last scan (0 if not found).
    pub fn firmware_version(&self, id: BoardId) -> u32 {
        self.slots[id.index()].firmware_version
    }

    /// Hardware version read by the last scan (0 if not found).
    pub fn hardware_version(&self, id: BoardId) -> u32 {
        self.slots[id.index()].hardware_version
    }

    /// Nodes reported by the last scan.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub(crate) fn set_num_nodes(&mut self, nodes: usize) {
        self.num_nodes = nodes;
    }

    /// Forget the previous scan. Attached boards stay attached.
    pub(crate) fn clear_topology(&mut self) {
        for slot in &mut self.slots {
            slot.exists = false;
            slot.node = None;
            slot.firmware_version = 0;
            slot.hardware_version = 0;
        }
        self.node_to_board = [None; MAX_NODES];
        self.num_nodes = 0;
    }

    /// Record board `id` at `node`. A board id seen on an earlier node keeps
    /// that mapping and the call returns false.
    pub(crate) fn map(&mut self, node: NodeId, id: BoardId, hardware_version: u32, firmware_version: u32) -> bool {
        let slot = &mut self.slots[id.index()];
        if let Some(first) = slot.node {
            warn!(board = %id, node = %node, first = %first, "Duplicate board id on bus, ignoring node");
            return false;
        }
        slot.exists = true;
        slot.node = Some(node);
        slot.hardware_version = hardware_version;
        slot.firmware_version = firmware_version;
        self.node_to_board[node.index()] = Some(id);
        true
    }

    /// Tell every attached board which node it maps to now.
    pub(crate) fn notify_nodes(&self) {
        for id in self.in_use() {
            if let Some(board) = self.board(id) {
                board.lock().set_node(self.slots[id.index()].node);
            }
        }
    }

    /// Firmware version used for capability checks: the scanned value when
    /// the board was found, otherwise what the board reports itself.
    fn effective_firmware(&self, id: BoardId) -> u32 {
        let slot = &self.slots[id.index()];
        if slot.exists {
            return slot.firmware_version;
        }
        self.board(id).map_or(0, |board| board.lock().firmware_version())
    }

    /// Whether at least one board is attached and all of them can broadcast.
    pub fn all_broadcast_capable(&self) -> bool {
        self.board_count > 0
            && self
                .in_use()
                .all(|id| is_broadcast_capable(self.effective_firmware(id)))
    }

    pub fn protocol(&self) -> ProtocolMode {
        self.protocol
    }

    pub(crate) fn set_protocol(&mut self, mode: ProtocolMode) -> Result<()> {
        if mode.needs_broadcast() && !self.all_broadcast_capable() {
            error!(
                requested = %mode,
                "Not all boards support broadcasting, please upgrade your firmware"
            );
            return Err(Error::BroadcastUnsupported);
        }
        self.protocol = mode;
        info!(protocol = %mode, "{}", mode.description());
        Ok(())
    }

    /// Drop back to sequential mode if the current mode is no longer legal.
    pub(crate) fn revalidate_protocol(&mut self) {
        if self.protocol.needs_broadcast() && !self.all_broadcast_capable() {
            warn!(protocol = %self.protocol, "Broadcast no longer supported by all boards");
            self.protocol = ProtocolMode::Sequential;
            info!(protocol = %self.protocol, "{}", self.protocol.description());
        }
    }

    /// Designated hub board, if any.
    pub fn hub(&self) -> Option<BoardId> {
        self.hub
    }

    pub(crate) fn set_hub(&mut self, hub: Option<BoardId>) {
        self.hub = hub;
    }

    /// Board whose broadcast buffer is polled: the designated hub if it is on
    /// the bus, else the lowest attached board that is.
    pub fn effective_hub(&self) -> Option<(BoardId, NodeId)> {
        if let Some(hub) = self.hub {
            if let Some(node) = self.node_of(hub) {
                return Some((hub, node));
            }
        }
        self.in_use()
            .find_map(|id| self.node_of(id).map(|node| (id, node)))
    }

    /// Check the cross-table invariants.
    pub fn is_consistent(&self) -> bool {
        let slots_ok = BoardId::all().all(|id| {
            let slot = &self.slots[id.index()];
            let in_use = self.is_in_use(id) == slot.handle.is_some();
            let mapped = match slot.node {
                Some(node) => self.node_to_board[node.index()] == Some(id) && slot.exists,
                None => !slot.exists,
            };
            in_use && mapped
        });
        let nodes_ok = self.node_to_board.iter().enumerate().all(|(n, board)| match board {
            Some(id) => self.slots[id.index()].node.map(NodeId::index) == Some(n),
            None => true,
        });
        let count_ok = self.in_use_mask.count_ones() as usize == self.board_count;
        slots_ok && nodes_ok && count_ok
    }
}
