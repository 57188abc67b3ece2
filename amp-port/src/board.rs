//! Board collaborator interface.
//!
//! A board is owned by the caller. The port only keeps a weak association to
//! it and moves register data between the bus and the board's buffers. What
//! the registers mean (encoders, motor currents, ...) is the board's business.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::PortType;
use crate::types::{NodeId, Quadlet};

/// Shared handle to a caller-owned board.
pub type BoardHandle = Arc<Mutex<dyn Board>>;

/// Lowest firmware version that answers broadcast queries and writes.
pub const BROADCAST_MIN_FIRMWARE: u32 = 4;

/// Whether a board with this firmware can take part in broadcast cycles.
pub fn is_broadcast_capable(firmware_version: u32) -> bool {
    firmware_version >= BROADCAST_MIN_FIRMWARE
}

/// Register addresses read during topology scans.
pub mod regs {
    use crate::types::NodeAddr;

    /// Status register; the board number sits in bits 27:24.
    pub const STATUS: NodeAddr = 0;
    pub const HARDWARE_VERSION: NodeAddr = 4;
    pub const FIRMWARE_VERSION: NodeAddr = 7;

    /// Base of the real-time read block and of the real-time write block.
    pub const REALTIME_BLOCK: NodeAddr = 0;

    pub const STATUS_BOARD_ID_SHIFT: u32 = 24;
    pub const STATUS_BOARD_ID_MASK: u32 = 0x0f;

    /// FireWire status of an Ethernet bridge board: node count in bits
    /// 13:8, bus generation in bits 7:0.
    pub const BRIDGE_FW_STATUS: NodeAddr = 12;
    pub const BRIDGE_NODE_COUNT_SHIFT: u32 = 8;
    pub const BRIDGE_NODE_COUNT_MASK: u32 = 0x3f;
    pub const BRIDGE_GENERATION_MASK: u32 = 0xff;
}

/// Hardware version words of the boards the port knows how to talk to.
pub mod hardware {
    /// "QLA1"
    pub const QLA1: u32 = 0x514c_4131;
    /// "DQLA"
    pub const DQLA: u32 = 0x4451_4c41;
    /// "dRA1"
    pub const DRA1: u32 = 0x6452_4131;

    pub fn is_known(version: u32) -> bool {
        matches!(version, QLA1 | DQLA | DRA1)
    }

    pub fn name(version: u32) -> &'static str {
        match version {
            QLA1 => "QLA1",
            DQLA => "DQLA",
            DRA1 => "dRA1",
            _ => "unknown",
        }
    }
}

/// Back-reference from a board to the port it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLink {
    pub port_type: PortType,
    pub port_num: u32,
}

/// Interface the port needs from a board.
pub trait Board: Send {
    /// Raw board number; validated by the registry.
    fn board_id(&self) -> u8;

    /// Firmware version as known to the board (0 if unknown).
    fn firmware_version(&self) -> u32;

    /// Buffer filled by read cycles.
    fn read_buffer(&mut self) -> &mut [Quadlet];

    /// Buffer sent by write cycles.
    fn write_buffer(&self) -> &[Quadlet];

    fn set_read_valid(&mut self, valid: bool);

    fn set_write_valid(&mut self, valid: bool);

    /// Called with `Some` when added to a port and `None` when removed.
    fn set_port(&mut self, port: Option<PortLink>);

    /// Called whenever the node the board maps to changes.
    fn set_node(&mut self, _node: Option<NodeId>) {}
}

/// Plain board with fixed-size register buffers.
///
/// Suitable for tools and tests, and as a building block for boards that
/// decode their registers elsewhere.
#[derive(Debug, Clone)]
pub struct BoardIo {
    id: u8,
    firmware_version: u32,
    read_buffer: Vec<Quadlet>,
    write_buffer: Vec<Quadlet>,
    read_valid: bool,
    write_valid: bool,
    port: Option<PortLink>,
    node: Option<NodeId>,
}

impl BoardIo {
    pub fn new(id: u8, firmware_version: u32, read_quads: usize, write_quads: usize) -> Self {
        Self {
            id,
            firmware_version,
            read_buffer: vec![0; read_quads],
            write_buffer: vec![0; write_quads],
            read_valid: false,
            write_valid: false,
            port: None,
            node: None,
        }
    }

    /// Wrap into a handle suitable for [`crate::Port::add_board`].
    pub fn into_handle(self) -> Arc<Mutex<BoardIo>> {
        Arc::new(Mutex::new(self))
    }

    pub fn read_data(&self) -> &[Quadlet] {
        &self.read_buffer
    }

    pub fn write_data_mut(&mut self) -> &mut [Quadlet] {
        &mut self.write_buffer
    }

    pub fn read_valid(&self) -> bool {
        self.read_valid
    }

    pub fn write_valid(&self) -> bool {
        self.write_valid
    }

    pub fn port(&self) -> Option<PortLink> {
        self.port
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }
}

impl Board for BoardIo {
    fn board_id(&self) -> u8 {
        self.id
    }

    fn firmware_version(&self) -> u32 {
        self.firmware_version
    }

    fn read_buffer(&mut self) -> &mut [Quadlet] {
        &mut self.read_buffer
    }

    fn write_buffer(&self) -> &[Quadlet] {
        &self.write_buffer
    }

    fn set_read_valid(&mut self, valid: bool) {
        self.read_valid = valid;
    }

    fn set_write_valid(&mut self, valid: bool) {
        self.write_valid = valid;
    }

    fn set_port(&mut self, port: Option<PortLink>) {
        self.port = port;
    }

    fn set_node(&mut self, node: Option<NodeId>) {
        self.node = node;
    }
}
