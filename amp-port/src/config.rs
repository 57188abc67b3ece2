//! Configuration of a port.
//!
//! A [`PortConfig`] is loaded from JSON with defaults for every field, then
//! environment overrides are applied on top.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::port::{PortDescriptor, ProtocolMode};
use crate::types::MAX_BOARDS;

/// Overrides the receive timeout of bridged ports, in milliseconds.
pub const ENV_RECEIVE_TIMEOUT_MS: &str = "AMP_PORT_RECEIVE_TIMEOUT_MS";

/// Overrides the port descriptor.
pub const ENV_DESCRIPTOR: &str = "AMP_PORT_DESCRIPTOR";

/// Port configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortConfig {
    /// Port descriptor, e.g. `fw0`, `eth1` or `udp192.168.10.100`
    pub descriptor: String,

    /// Protocol mode requested at init
    pub protocol: ProtocolMode,

    /// Board whose broadcast buffer is polled by broadcast reads
    pub hub_board: Option<u8>,

    /// How long a bridged read waits for its response
    pub receive_timeout_ms: u64,

    /// How long a broadcast read waits for every board's section
    pub broadcast_wait_timeout_us: u64,

    /// Pause between polls of the hub's broadcast buffer
    pub broadcast_poll_interval_us: u64,

    /// Pause before slow PROM writes on bridged ports
    pub prom_delay_ms: u64,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            descriptor: "fw0".to_string(),
            protocol: ProtocolMode::Sequential,
            hub_board: None,
            receive_timeout_ms: 10,
            broadcast_wait_timeout_us: 5_000,
            broadcast_poll_interval_us: 50,
            prom_delay_ms: 5,
        }
    }
}

impl PortConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(ms) = parse_override::<u64>(&lookup, ENV_RECEIVE_TIMEOUT_MS)? {
            self.receive_timeout_ms = ms;
        }
        if let Some(descriptor) = lookup(ENV_DESCRIPTOR) {
            self.descriptor = descriptor;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(hub) = self.hub_board {
            if hub as usize >= MAX_BOARDS {
                return Err(Error::Config(format!("hub board {} out of range", hub)));
            }
        }
        if self.receive_timeout_ms == 0 {
            return Err(Error::Config("receive timeout must be positive".into()));
        }
        if self.broadcast_poll_interval_us == 0 {
            return Err(Error::Config("broadcast poll interval must be positive".into()));
        }
        Ok(())
    }

    /// Parsed form of [`PortConfig::descriptor`].
    pub fn port_descriptor(&self) -> Result<PortDescriptor> {
        PortDescriptor::parse(&self.descriptor)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn broadcast_wait_timeout(&self) -> Duration {
        Duration::from_micros(self.broadcast_wait_timeout_us)
    }

    pub fn broadcast_poll_interval(&self) -> Duration {
        Duration::from_micros(self.broadcast_poll_interval_us)
    }

    pub fn prom_delay(&self) -> Duration {
        Duration::from_millis(self.prom_delay_ms)
    }
}

fn parse_override<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", name, value))),
    }
}
