//! NetIf manager
//!
//! Owns the shared frame pool, the table of active link drivers keyed by
//! interface index, and the per-manager services (serial numbers, packet
//! factory). No ambient globals: every component reaches the manager through
//! an explicit handle.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::LinkConfig;
use crate::device::DeviceState;
use crate::driver::LinkDriver;
use crate::error::Result;
use crate::factory::PacketFactory;
use crate::pool::FramePool;
use crate::serial::SerialNumbers;
use crate::wire;

pub struct NetIfManager {
    shell_id: String,
    node_adrs: AtomicU16,
    config: LinkConfig,
    pool: Arc<FramePool>,
    netifs: DashMap<u8, Arc<LinkDriver>>,
    factory: PacketFactory,
    serials: SerialNumbers,
}

impl NetIfManager {
    pub fn new(shell_id: impl Into<String>, master_sn: &str, config: LinkConfig) -> Arc<Self> {
        let shell_id = shell_id.into();
        let pool = Arc::new(FramePool::new(config.pool_capacity));
        Arc::new(Self {
            serials: SerialNumbers::new(&shell_id, master_sn),
            factory: PacketFactory::new(pool.clone()),
            node_adrs: AtomicU16::new(wire::ADRS_LOCAL),
            netifs: DashMap::new(),
            pool,
            config,
            shell_id,
        })
    }

    pub fn shell_id(&self) -> &str {
        &self.shell_id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn pool_handle(&self) -> Arc<FramePool> {
        self.pool.clone()
    }

    pub fn factory(&self) -> &PacketFactory {
        &self.factory
    }

    pub fn serials(&self) -> &SerialNumbers {
        &self.serials
    }

    pub fn node_adrs(&self) -> u16 {
        self.node_adrs.load(Ordering::Relaxed)
    }

    pub fn set_node_adrs(&self, adrs: u16) {
        self.node_adrs.store(adrs, Ordering::Relaxed);
    }

    /// Install a driver, suspending any previous occupant of its index.
    pub fn add_driver(self: &Arc<Self>, link: Arc<LinkDriver>) {
        let index = link.netif_index();
        if let Some(previous) = self.netifs.insert(index, link) {
            previous.suspend();
        }
        self.serials.netif_serial_setup(self, index);
        debug!(netif = index, "driver attached");
    }

    /// Detach and close the driver on an interface.
    pub fn remove_driver(&self, netif_index: u8) {
        if let Some((_, link)) = self.netifs.remove(&netif_index) {
            link.suspend();
            link.stop_link_driver();
            link.close();
            info!(netif = netif_index, "driver detached");
        }
    }

    pub fn get_link_driver(&self, netif_index: u8) -> Option<Arc<LinkDriver>> {
        self.netifs.get(&netif_index).map(|e| e.value().clone())
    }

    /// Find a driver by its device's component id.
    pub fn get_link_driver_by_id(&self, component_id: &str) -> Option<Arc<LinkDriver>> {
        self.netifs
            .iter()
            .find(|e| e.value().component_id() == component_id)
            .map(|e| e.value().clone())
    }

    fn drivers(&self) -> Vec<Arc<LinkDriver>> {
        self.netifs.iter().map(|e| e.value().clone()).collect()
    }

    /// Full protocol reset of one link, announced to the peer.
    pub fn reset_driver(&self, netif_index: u8) {
        if let Some(link) = self.get_link_driver(netif_index) {
            link.reset_link_driver();
            link.monitor.send_link_handshake(
                &link,
                wire::PID_PING,
                wire::ADRS_LOCAL,
                wire::PID_ARG_RESET,
            );
        }
    }

    /// Drive every non-threaded link through one poll cycle.
    pub fn poll_links(&self) {
        for link in self.drivers() {
            if !link.is_threaded() {
                link.poll_link_driver();
            }
        }
    }

    pub fn start(&self) {
        for link in self.drivers() {
            link.start_link_driver();
        }
    }

    pub fn stop(&self) {
        for link in self.drivers() {
            link.stop_link_driver();
        }
    }

    pub fn close(&self) {
        self.stop();
        for link in self.drivers() {
            link.close();
        }
        self.netifs.clear();
    }

    pub fn ping_netif(&self, netif_index: u8) {
        if let Some(link) = self.get_link_driver(netif_index) {
            link.link_ping();
        }
    }

    pub fn component_state(&self, netif_index: u8) -> DeviceState {
        self.get_link_driver(netif_index)
            .map(|link| link.component_state())
            .unwrap_or(DeviceState::Problem)
    }

    pub fn component_id(&self, netif_index: u8) -> Option<String> {
        self.get_link_driver(netif_index)
            .map(|link| link.component_id())
    }

    pub fn session_id(&self, netif_index: u8) -> u32 {
        self.get_link_driver(netif_index)
            .map(|link| link.session_id())
            .unwrap_or(0)
    }

    pub fn write_queue_size(&self, netif_index: u8) -> Option<usize> {
        self.get_link_driver(netif_index)
            .map(|link| link.write_queue_size())
    }

    pub fn write_queue_capacity(&self, netif_index: u8) -> usize {
        self.get_link_driver(netif_index)
            .map(|link| link.write_queue.capacity().saturating_sub(1))
            .unwrap_or(0)
    }

    /// Capture the attachment layout for later reconstruction.
    pub fn snapshot(&self) -> RoutingSnapshot {
        let mut entries: Vec<NetIfEntry> = self
            .netifs
            .iter()
            .map(|e| {
                let link = e.value();
                NetIfEntry {
                    netif_index: link.netif_index(),
                    component_id: link.component_id(),
                    mapping_enabled: link.mapping_enabled(),
                    threaded: link.is_threaded(),
                    does_io: link.does_io(),
                    has_tasks: link.has_tasks(),
                }
            })
            .collect();
        entries.sort_by_key(|e| e.netif_index);
        RoutingSnapshot {
            node_adrs: self.node_adrs(),
            entries,
        }
    }
}

/// One routing-table entry: enough to re-create the attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIfEntry {
    pub netif_index: u8,
    pub component_id: String,
    pub mapping_enabled: bool,
    pub threaded: bool,
    pub does_io: bool,
    pub has_tasks: bool,
}

/// Persistable shape of a manager's routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub node_adrs: u16,
    pub entries: Vec<NetIfEntry>,
}

impl RoutingSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PipeDevice;
    use crate::driver::{LinkOptions, NoHooks};

    #[test]
    fn test_attach_detach() {
        let mgr = NetIfManager::new("0", "BBL-0001-0", LinkConfig::default());
        let (near, _far) = PipeDevice::pair("dev-a", "dev-b");
        let link = LinkDriver::new(
            &mgr,
            Arc::new(near),
            wire::NETIF_USER_BASE,
            LinkOptions::polled_link(),
            Box::new(NoHooks),
        );
        mgr.add_driver(link);
        assert!(mgr.get_link_driver(wire::NETIF_USER_BASE).is_some());
        assert!(mgr.get_link_driver_by_id("dev-a").is_some());
        assert_eq!(mgr.component_state(wire::NETIF_C_PORT), DeviceState::Problem);
        mgr.remove_driver(wire::NETIF_USER_BASE);
        assert!(mgr.get_link_driver(wire::NETIF_USER_BASE).is_none());
        mgr.close();
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mgr = NetIfManager::new("0", "BBL-0001-0", LinkConfig::default());
        mgr.set_node_adrs(0x0042);
        let (near, _far) = PipeDevice::pair("dev-a", "dev-b");
        let link = LinkDriver::new(
            &mgr,
            Arc::new(near),
            wire::NETIF_USER_BASE,
            LinkOptions::polled_link(),
            Box::new(NoHooks),
        );
        mgr.add_driver(link);
        let snap = mgr.snapshot();
        let restored = RoutingSnapshot::from_bytes(&snap.to_bytes().unwrap()).unwrap();
        assert_eq!(snap, restored);
        assert_eq!(restored.node_adrs, 0x0042);
        assert_eq!(restored.entries.len(), 1);
        assert_eq!(restored.entries[0].component_id, "dev-a");
        mgr.close();
    }
}
