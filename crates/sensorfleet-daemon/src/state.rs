//! Application state and task wiring

use anyhow::{Context, Result};
use sensorfleet_core::{AuthRegistry, CredentialProber, Directory, JsonFileStore, ScrapeRegistry};
use sensorfleet_discovery::DiscoveryScanner;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::agent::AgentContext;
use crate::bridge::PublishBridge;
use crate::bus::NatsBus;
use crate::config::Config;
use crate::supervisor::FleetSupervisor;

/// Everything the daemon runs
pub struct AppState {
    /// Shared device table
    pub directory: Directory,
    /// Neighbor table scanner feeding the directory
    pub scanner: Arc<DiscoveryScanner>,
    pub supervisor: FleetSupervisor,
    pub bridge: PublishBridge,
}

impl AppState {
    /// Open the store, connect to the bus, and build the fleet components
    pub async fn new(config: &Config) -> Result<Self> {
        let store = Arc::new(
            JsonFileStore::open(&config.store.devices_path, &config.store.metadata_path)
                .await
                .context("Failed to open device store")?,
        );
        let directory = Directory::load(store.clone()).await;
        info!(devices = directory.len().await, "Device directory loaded");

        let mut auth = AuthRegistry::new();
        let mut scrape = ScrapeRegistry::new();
        sensorfleet_vendor::register_defaults(&mut auth, &mut scrape)
            .context("Failed to register device strategies")?;
        info!(
            auth = ?auth.names(),
            scrape = ?scrape.names(),
            "Registered device strategies"
        );
        let auth = Arc::new(auth);
        let scrape = Arc::new(scrape);

        let ctx = Arc::new(AgentContext {
            prober: Arc::new(CredentialProber::new(
                auth.clone(),
                scrape.clone(),
                config.credentials(),
            )),
            auth,
            scrape,
            metadata: store,
            config: config.to_agent_config(),
        });

        let bus = NatsBus::connect(&config.bus.url).await?;
        let bridge = PublishBridge::start(Arc::new(bus), config.to_bridge_config()).await;

        let scanner = Arc::new(DiscoveryScanner::new(
            config.to_scanner_config(),
            directory.clone(),
        ));
        let supervisor = FleetSupervisor::new(
            config.to_supervisor_config(),
            directory.clone(),
            bridge.handle(),
            ctx,
        );

        Ok(Self {
            directory,
            scanner,
            supervisor,
            bridge,
        })
    }

    /// Run discovery and supervision until `cancel` fires, then stop every
    /// agent and drain the publish queue
    pub async fn run(self, cancel: CancellationToken) {
        let scanner = self.scanner.clone();
        let discovery_cancel = cancel.clone();
        let discovery = tokio::spawn(async move { scanner.run(discovery_cancel).await });
        let supervision = tokio::spawn(self.supervisor.run(cancel.clone()));

        if let Err(e) = discovery.await {
            error!(error = %e, "Discovery task failed");
        }
        if let Err(e) = supervision.await {
            error!(error = %e, "Supervisor task failed");
        }

        self.bridge.shutdown().await;
        info!(devices = self.directory.len().await, "Fleet stopped");
    }
}
