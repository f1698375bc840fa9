//! Periodic discovery loop feeding the Device Directory

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use sensorfleet_core::{DeviceId, Directory};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arp::{get_neighbor_table, is_in_subnet, ping_sweep, subnet_hosts, NeighborEntry};

/// Sweeping wider subnets than this is refused
const MIN_SWEEP_PREFIX: u8 = 16;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No IPv4 address found on interface {0}")]
    NoLocalAddress(String),
    #[error("Failed to list network interfaces: {0}")]
    Interfaces(String),
    #[error("Failed to read neighbour table: {0}")]
    NeighborTable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Interface whose IPv4 address defines the scanned subnet
    pub interface: String,
    /// Fixed local address, overrides the interface lookup
    pub public_ip: Option<Ipv4Addr>,
    pub prefix_len: u8,
    pub scan_interval_secs: u64,
    /// Ping every subnet host before reading the neighbour table
    pub ping_sweep: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            public_ip: None,
            prefix_len: 24,
            scan_interval_secs: 30,
            ping_sweep: true,
        }
    }
}

/// Discovers devices and upserts them into the directory
pub struct DiscoveryScanner {
    config: ScannerConfig,
    directory: Directory,
}

impl DiscoveryScanner {
    pub fn new(config: ScannerConfig, directory: Directory) -> Self {
        Self { config, directory }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Local IPv4 address: the configured override, else the interface's first IPv4
    pub fn local_address(&self) -> Result<Ipv4Addr, DiscoveryError> {
        if let Some(ip) = self.config.public_ip {
            return Ok(ip);
        }

        let interfaces =
            NetworkInterface::show().map_err(|e| DiscoveryError::Interfaces(e.to_string()))?;

        interfaces
            .iter()
            .filter(|iface| iface.name == self.config.interface)
            .flat_map(|iface| iface.addr.iter())
            .find_map(|addr| match addr {
                Addr::V4(v4) => Some(v4.ip),
                Addr::V6(_) => None,
            })
            .ok_or_else(|| DiscoveryError::NoLocalAddress(self.config.interface.clone()))
    }

    /// Run one discovery pass and return the (identity, address) pairs seen
    pub async fn scan_once(&self) -> Result<Vec<(DeviceId, Ipv4Addr)>, DiscoveryError> {
        let local = self.local_address()?;
        let prefix_len = self.config.prefix_len;

        info!(local = %local, prefix = prefix_len, "Starting discovery scan");

        if self.config.ping_sweep {
            if prefix_len >= MIN_SWEEP_PREFIX {
                let answered = ping_sweep(&subnet_hosts(local, prefix_len)).await;
                debug!(answered = answered.len(), "Ping sweep complete");
            } else {
                warn!(prefix = prefix_len, "Subnet too large for a ping sweep, reading neighbour table only");
            }
        }

        let entries = get_neighbor_table().await?;
        let found = self.record_neighbors(&entries, local).await;

        info!(found = found.len(), "Scan complete");
        Ok(found)
    }

    /// Upsert every resolved in-subnet neighbour other than ourselves
    pub async fn record_neighbors(
        &self,
        entries: &[NeighborEntry],
        local: Ipv4Addr,
    ) -> Vec<(DeviceId, Ipv4Addr)> {
        let mut found = Vec::new();

        for entry in entries {
            if !entry.is_resolved()
                || entry.ip == local
                || !is_in_subnet(entry.ip, local, self.config.prefix_len)
            {
                continue;
            }
            debug!(mac = %entry.mac, ip = %entry.ip, "Neighbour seen");

            let id = DeviceId::from_mac(&entry.mac);
            self.directory.upsert(id.clone(), IpAddr::V4(entry.ip)).await;
            found.push((id, entry.ip));
        }

        found
    }

    /// Scan every `scan_interval_secs` until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.config.scan_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = self.config.scan_interval_secs, "Discovery loop starting");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.scan_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Network scan failed");
                    }
                }
            }
        }

        info!("Discovery loop stopped");
    }
}
