//! Configuration loading and validation

use anyhow::{Context, Result};
use sensorfleet_core::Credential;
use sensorfleet_discovery::ScannerConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::AgentConfig;
use crate::bridge::BridgeConfig;
use crate::supervisor::SupervisorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Candidate logins, tried in order during credential discovery
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Interface whose subnet is scanned
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Fixed local address, skips the interface lookup
    #[serde(default)]
    pub public_ip: Option<Ipv4Addr>,
    #[serde(default = "default_prefix")]
    pub prefix_len: u8,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_true")]
    pub ping_sweep: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            public_ip: None,
            prefix_len: default_prefix(),
            scan_interval_secs: default_scan_interval(),
            ping_sweep: true,
        }
    }
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_prefix() -> u8 {
    24
}

fn default_scan_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Supervisor reconciliation interval
    #[serde(default = "default_device_check_interval")]
    pub device_check_interval_secs: u64,
    /// Every N reconciliations, invalid devices get an agent again
    #[serde(default = "default_invalid_check_cycles")]
    pub invalid_check_every_n_cycles: u32,
    /// Sleep between agent iterations
    #[serde(default = "default_agent_interval")]
    pub agent_interval_secs: u64,
    /// Failures above this invalidate the device
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            device_check_interval_secs: default_device_check_interval(),
            invalid_check_every_n_cycles: default_invalid_check_cycles(),
            agent_interval_secs: default_agent_interval(),
            failure_threshold: default_failure_threshold(),
            session_ttl_secs: default_session_ttl(),
        }
    }
}

fn default_device_check_interval() -> u64 {
    10
}

fn default_invalid_check_cycles() -> u32 {
    360 // one hour at the default check interval
}

fn default_agent_interval() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_session_ttl() -> u64 {
    20 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_url")]
    pub url: String,
    /// Durable stream capturing every device subject
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            stream: default_stream(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

fn default_bus_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_stream() -> String {
    "device_stream".to_string()
}

fn default_subject_prefix() -> String {
    "device".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_devices_path")]
    pub devices_path: PathBuf,
    /// Field metadata used to enrich published readings
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            devices_path: default_devices_path(),
            metadata_path: default_metadata_path(),
        }
    }
}

fn default_devices_path() -> PathBuf {
    PathBuf::from("./data/devices.json")
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("./data/field_metadata.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub username: String,
    pub password: String,
}

impl Config {
    pub fn to_scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            interface: self.discovery.interface.clone(),
            public_ip: self.discovery.public_ip,
            prefix_len: self.discovery.prefix_len,
            scan_interval_secs: self.discovery.scan_interval_secs,
            ping_sweep: self.discovery.ping_sweep,
        }
    }

    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            check_interval: Duration::from_secs(self.fleet.device_check_interval_secs.max(1)),
            invalid_check_every_n_cycles: self.fleet.invalid_check_every_n_cycles.max(1),
        }
    }

    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig {
            interval: Duration::from_secs(self.fleet.agent_interval_secs.max(1)),
            failure_threshold: self.fleet.failure_threshold,
            session_ttl: Duration::from_secs(self.fleet.session_ttl_secs),
        }
    }

    pub fn to_bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            stream: self.bus.stream.clone(),
            subject_prefix: self.bus.subject_prefix.clone(),
        }
    }

    pub fn credentials(&self) -> Vec<Credential> {
        self.credentials
            .iter()
            .map(|c| Credential::new(&c.username, &c.password))
            .collect()
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Config::default()
    };

    if config.credentials.is_empty() {
        warn!("No credentials configured, new devices cannot be authenticated");
    }

    Ok(config)
}

/// Render an example configuration as TOML
pub fn default_config_toml() -> Result<String> {
    let config = Config {
        credentials: vec![CredentialConfig {
            username: "root".to_string(),
            password: "00000000".to_string(),
        }],
        ..Config::default()
    };
    Ok(toml::to_string_pretty(&config)?)
}
