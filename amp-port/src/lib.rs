//! Port layer for FPGA motor-controller boards.
//!
//! Boards are reached over native FireWire, or over FireWire tunnelled
//! through raw Ethernet frames or UDP datagrams by a bridge board. A
//! [`Port`] gives the same board-addressed operations and whole-registry
//! cycles over all of them.
//!
//! ```no_run
//! # async fn run<D: amp_port::hw_trait::BusDriver>(driver: D) -> amp_port::Result<()> {
//! use amp_port::{BoardIo, FirewirePort, Port, PortConfig};
//!
//! let config = PortConfig::default();
//! let mut port = Port::new(FirewirePort::new(driver, 0), &config)?;
//! port.init().await?;
//!
//! let board = BoardIo::new(0, 7, 8, 4).into_handle();
//! port.add_board(&board)?;
//! port.read_all_boards().await?;
//! # Ok(())
//! # }
//! ```

pub mod board;
pub mod config;
pub mod error;
pub mod hw_trait;
pub mod port;
pub mod tracing;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use board::{Board, BoardHandle, BoardIo, PortLink};
pub use config::PortConfig;
pub use error::{Error, Result};
pub use port::{CycleStats, Port, PortDescriptor, ProtocolMode};
pub use transport::eth::{EthPort, WaitCallback};
pub use transport::firewire::FirewirePort;
pub use transport::{port_type_name, PortType, TopologyChange, TopologySignal, Transport};
pub use types::{BoardId, NodeAddr, NodeId, Quadlet};
