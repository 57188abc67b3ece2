//! Common error types for amp-port.
//!
//! This module provides a centralized Error enum using thiserror. Every
//! fallible port, registry and transport operation returns [`Result`]; a
//! failed operation leaves the prior state of the port intact.

use thiserror::Error;

use crate::types::{BoardId, NodeId};

/// Direction of a whole-registry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
    #[strum(to_string = "read")]
    Read,
    #[strum(to_string = "write")]
    Write,
}

/// Main error type for amp-port operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file errors
    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Board number outside the registry capacity
    #[error("board number out of range: {0}")]
    BoardOutOfRange(u32),

    /// Node number outside the node table
    #[error("node number out of range: {0}")]
    NodeOutOfRange(u32),

    /// No board registered in the slot
    #[error("board not found: {0}")]
    BoardNotFound(BoardId),

    /// Board registered but not found on the bus by the last scan
    #[error("board {0} is not mapped to a node")]
    BoardNotOnBus(BoardId),

    /// Requested protocol needs broadcast support on every board
    #[error("not all boards support broadcasting, please upgrade your firmware")]
    BroadcastUnsupported,

    /// Raw protocol value outside the known set
    #[error("unknown protocol (ignored): {0}")]
    UnknownProtocol(u8),

    /// Port descriptor could not be parsed
    #[error("invalid port descriptor: {0:?}")]
    Descriptor(String),

    /// Transport has not been opened, or has been closed
    #[error("port not open")]
    PortNotOpen,

    /// Topology changed since the node table was built
    #[error("topology changed (generation {generation}), rescan required")]
    TopologyStale { generation: u32 },

    /// No response within the receive timeout
    #[error("receive timeout")]
    Timeout,

    /// Frame shorter than its layout requires
    #[error("short frame: expected at least {expected} bytes, got {actual}")]
    ShortFrame { expected: usize, actual: usize },

    /// Header or data CRC did not match
    #[error("CRC error: computed {computed:#010x}, received {received:#010x}")]
    Crc { computed: u32, received: u32 },

    /// Transaction code of the received frame is not the expected one
    #[error("tcode mismatch: expected {expected}, got {actual}")]
    TcodeMismatch { expected: u8, actual: u8 },

    /// Transaction label of the received frame is not the expected one
    #[error("transaction label mismatch: expected {expected}, got {actual}")]
    LabelMismatch { expected: u8, actual: u8 },

    /// Frame came from (or was addressed to) an unexpected node
    #[error("node mismatch: expected {expected}, got {actual}")]
    NodeMismatch { expected: NodeId, actual: u8 },

    /// Block response carried a different length than requested
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Board answered with a non-complete response code
    #[error("response code {0:#x}")]
    ResponseCode(u8),

    /// Transaction failure reported by a bus driver or packet link
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// Some boards failed during a whole-registry cycle
    #[error("{direction} cycle failed for {failed} of {attempted} boards")]
    Cycle {
        direction: Direction,
        failed: usize,
        attempted: usize,
    },

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
