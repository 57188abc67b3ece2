//! Core types shared by the registry, the transports and the codec.

mod ids;

pub use ids::{BoardId, NodeId, MAX_BOARDS, MAX_NODES};

/// A 4-byte register unit, the basic access granularity of the boards.
pub type Quadlet = u32;

/// A 48-bit bus address (the upper 16 bits of the u64 are ignored).
pub type NodeAddr = u64;
