//! Bounds-checked board and node identifiers.
//!
//! Board ids index the 16-slot registry and node ids index the 64-entry node
//! table. Both are validated once, at construction, so tables indexed by them
//! never need a second range check.

use std::fmt;

use crate::error::{Error, Result};

/// Number of board slots in a port.
pub const MAX_BOARDS: usize = 16;

/// Number of node ids on the bus (0..=62 addressable, 63 is broadcast).
pub const MAX_NODES: usize = 64;

/// Board number, as set by the rotary switch on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoardId(u8);

impl BoardId {
    /// Validate a raw board number.
    pub fn new(id: u8) -> Result<Self> {
        if (id as usize) < MAX_BOARDS {
            Ok(Self(id))
        } else {
            Err(Error::BoardOutOfRange(id as u32))
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// All board ids in ascending order.
    pub fn all() -> impl Iterator<Item = BoardId> {
        (0..MAX_BOARDS as u8).map(BoardId)
    }
}

impl TryFrom<u32> for BoardId {
    type Error = Error;

    fn try_from(id: u32) -> Result<Self> {
        u8::try_from(id)
            .map_err(|_| Error::BoardOutOfRange(id))
            .and_then(BoardId::new)
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical node number on the (possibly bridged) FireWire bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u8);

impl NodeId {
    /// Node id addressing every node on the bus.
    pub const BROADCAST: NodeId = NodeId(0x3f);

    /// Mask of the node bits within a 16-bit bus/node id.
    pub const MASK: u16 = 0x003f;

    pub fn new(node: u8) -> Result<Self> {
        if (node as usize) < MAX_NODES {
            Ok(Self(node))
        } else {
            Err(Error::NodeOutOfRange(node as u32))
        }
    }

    /// Extract the node from a 16-bit bus/node id.
    pub const fn from_bus_id(bus_id: u16) -> Self {
        Self((bus_id & Self::MASK) as u8)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    /// 16-bit id on the local bus (bus number 0x3ff).
    pub const fn bus_id(self) -> u16 {
        0xffc0 | self.0 as u16
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
