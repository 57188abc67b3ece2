//! Native FireWire transport.
//!
//! Node transactions go straight to a [`BusDriver`]. The driver reports bus
//! resets through the [`TopologySignal`] installed at open; it does so from
//! [`Transport::poll_events`], which the control loop calls periodically.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::hw_trait::BusDriver;
use crate::tracing::prelude::*;
use crate::transport::{PortType, TopologySignal, Transport};
use crate::types::{NodeAddr, NodeId, Quadlet};

/// Lifecycle of the driver handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PortState {
    Uninitialized,
    Open,
    Closed,
}

pub struct FirewirePort<D: BusDriver> {
    driver: D,
    port_num: u32,
    state: PortState,
    signal: Arc<TopologySignal>,
    proc_root: PathBuf,
}

impl<D: BusDriver> FirewirePort<D> {
    pub fn new(driver: D, port_num: u32) -> Self {
        Self {
            driver,
            port_num,
            state: PortState::Uninitialized,
            signal: Arc::new(TopologySignal::new()),
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Count users under `root` instead of `/proc`.
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Device node of this adapter.
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/fw{}", self.port_num))
    }

    fn check_open(&self) -> Result<()> {
        if self.state == PortState::Open {
            Ok(())
        } else {
            Err(Error::PortNotOpen)
        }
    }
}

impl<D: BusDriver> Drop for FirewirePort<D> {
    fn drop(&mut self) {
        if self.state == PortState::Open {
            self.driver.remove_reset_handler();
            self.driver.close();
        }
    }
}

#[async_trait]
impl<D: BusDriver> Transport for FirewirePort<D> {
    fn port_type(&self) -> PortType {
        PortType::Firewire
    }

    fn port_num(&self) -> u32 {
        self.port_num
    }

    fn is_open(&self) -> bool {
        self.state == PortState::Open
    }

    async fn open(&mut self) -> Result<()> {
        if self.state == PortState::Open {
            return Ok(());
        }
        self.driver.open(self.port_num).inspect_err(|e| {
            error!(port = self.port_num, error = %e, "Failed to open FireWire port");
        })?;
        self.driver.install_reset_handler(Arc::clone(&self.signal));
        self.signal.sync(self.driver.generation());
        self.state = PortState::Open;
        debug!(port = self.port_num, generation = self.driver.generation(), "FireWire port open");
        Ok(())
    }

    async fn close(&mut self) {
        if self.state == PortState::Open {
            self.driver.remove_reset_handler();
            self.driver.close();
            self.state = PortState::Closed;
        }
    }

    async fn discover_nodes(&mut self) -> Result<usize> {
        self.check_open()?;
        self.driver.node_count()
    }

    fn bus_generation(&self) -> u32 {
        self.driver.generation()
    }

    fn topology_signal(&self) -> &TopologySignal {
        &self.signal
    }

    async fn poll_events(&mut self) -> Result<()> {
        self.check_open()?;
        self.driver.poll_events()
    }

    async fn read_quadlet_node(&mut self, node: NodeId, addr: NodeAddr) -> Result<Quadlet> {
        self.check_open()?;
        self.driver.read_quadlet(node, addr).await
    }

    async fn write_quadlet_node(&mut self, node: NodeId, addr: NodeAddr, data: Quadlet) -> Result<()> {
        self.check_open()?;
        self.driver.write_quadlet(node, addr, data).await
    }

    async fn read_block_node(
        &mut self,
        node: NodeId,
        addr: NodeAddr,
        data: &mut [Quadlet],
    ) -> Result<()> {
        self.check_open()?;
        self.driver.read_block(node, addr, data).await
    }

    async fn write_block_node(&mut self, node: NodeId, addr: NodeAddr, data: &[Quadlet]) -> Result<()> {
        self.check_open()?;
        self.driver.write_block(node, addr, data).await
    }

    fn prom_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn user_count(&self) -> u32 {
        count_users(&self.proc_root, &self.device_path())
    }
}

/// Count processes under `proc_root` with an open descriptor on `device`.
fn count_users(proc_root: &Path, device: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(proc_root) else {
        warn!(root = %proc_root.display(), "Cannot list processes");
        return 0;
    };
    let mut users = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let is_pid = name
            .to_str()
            .is_some_and(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }
        // Other users' descriptors are unreadable without privileges
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let holds_device = fds
            .flatten()
            .any(|fd| fs::read_link(fd.path()).is_ok_and(|target| target == device));
        if holds_device {
            users += 1;
        }
    }
    users
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimBus, SimFabric, SimNode};
    use std::os::unix::fs::symlink;

    fn fabric() -> SimFabric {
        let fabric = SimFabric::new();
        fabric.add_node(SimNode::qla(0, 7));
        fabric.add_node(SimNode::qla(1, 7));
        fabric
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let fabric = fabric();
        let mut port = FirewirePort::new(SimBus::new(fabric.clone()), 0);
        assert_eq!(port.state(), PortState::Uninitialized);
        assert!(matches!(port.discover_nodes().await, Err(Error::PortNotOpen)));

        port.open().await.unwrap();
        assert_eq!(port.state(), PortState::Open);
        assert!(port.driver().has_reset_handler());
        assert_eq!(port.discover_nodes().await.unwrap(), 2);

        port.close().await;
        assert_eq!(port.state(), PortState::Closed);
        assert!(!port.driver().has_reset_handler());
        assert!(!port.driver().is_open());
        assert!(matches!(
            port.read_quadlet_node(NodeId::new(0).unwrap(), 0).await,
            Err(Error::PortNotOpen)
        ));

        // Reopening is allowed
        port.open().await.unwrap();
        assert!(port.is_open());
    }

    #[tokio::test]
    async fn test_open_failure() {
        let fabric = fabric();
        let mut bus = SimBus::new(fabric);
        bus.fail_open(true);
        let mut port = FirewirePort::new(bus, 3);
        assert!(port.open().await.is_err());
        assert_eq!(port.state(), PortState::Uninitialized);
    }

    #[tokio::test]
    async fn test_reset_reported_through_poll() {
        let fabric = fabric();
        let mut port = FirewirePort::new(SimBus::new(fabric.clone()), 0);
        port.open().await.unwrap();
        assert!(port.topology_signal().take().is_none());

        fabric.bus_reset();
        // Not seen until the driver is polled
        assert!(!port.topology_signal().is_pending());
        port.poll_events().await.unwrap();
        assert_eq!(port.topology_signal().take().map(|c| c.generation), Some(1));
        assert_eq!(port.bus_generation(), 1);
    }

    #[tokio::test]
    async fn test_node_transactions() {
        let fabric = fabric();
        let mut port = FirewirePort::new(SimBus::new(fabric.clone()), 0);
        port.open().await.unwrap();
        let node = NodeId::new(1).unwrap();

        port.write_block_node(node, 0x40, &[5, 6]).await.unwrap();
        let mut data = [0; 2];
        port.read_block_node(node, 0x40, &mut data).await.unwrap();
        assert_eq!(data, [5, 6]);

        fabric.set_responsive(1, false);
        assert!(matches!(
            port.read_quadlet_node(node, 0).await,
            Err(Error::Transaction(_))
        ));
    }

    #[test]
    fn test_prom_delay_is_immediate() {
        let port = FirewirePort::new(SimBus::new(SimFabric::new()), 0);
        assert_eq!(port.prom_delay(), Duration::ZERO);
    }

    #[test]
    fn test_user_count_scans_proc() {
        let root = std::env::temp_dir().join(format!("amp-port-proc-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        for (pid, targets) in [
            ("100", vec!["/dev/fw0", "/dev/null"]),
            ("200", vec!["/dev/fw0", "/dev/fw0"]),
            ("300", vec!["/dev/fw1"]),
            ("self", vec!["/dev/fw0"]),
        ] {
            let fd_dir = root.join(pid).join("fd");
            fs::create_dir_all(&fd_dir).unwrap();
            for (fd, target) in targets.iter().enumerate() {
                symlink(target, fd_dir.join(fd.to_string())).unwrap();
            }
        }

        let port = FirewirePort::new(SimBus::new(SimFabric::new()), 0).with_proc_root(&root);
        assert_eq!(port.user_count(), 2);
        let port = FirewirePort::new(SimBus::new(SimFabric::new()), 1).with_proc_root(&root);
        assert_eq!(port.user_count(), 1);
        let port = FirewirePort::new(SimBus::new(SimFabric::new()), 2).with_proc_root(&root);
        assert_eq!(port.user_count(), 0);

        fs::remove_dir_all(&root).unwrap();
    }
}
