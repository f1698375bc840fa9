//! Fleet Supervisor
//!
//! Reconciles running agents against a directory snapshot on a fixed
//! interval. Valid devices get an agent, invalid ones lose theirs. Every
//! `invalid_check_every_n_cycles` ticks, invalid devices get an agent too
//! so they are periodically retried.

use sensorfleet_core::{DeviceId, Directory};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentContext, AgentHandle, DeviceAgent};
use crate::bridge::BridgeHandle;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub check_interval: Duration,
    pub invalid_check_every_n_cycles: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            invalid_check_every_n_cycles: 360,
        }
    }
}

pub struct FleetSupervisor {
    config: SupervisorConfig,
    directory: Directory,
    bridge: BridgeHandle,
    ctx: Arc<AgentContext>,
    agents: HashMap<DeviceId, AgentHandle>,
    countdown: u32,
    recheck_invalid: bool,
    started_total: usize,
}

impl FleetSupervisor {
    pub fn new(
        config: SupervisorConfig,
        directory: Directory,
        bridge: BridgeHandle,
        ctx: Arc<AgentContext>,
    ) -> Self {
        let countdown = config.invalid_check_every_n_cycles.max(1);
        Self {
            config,
            directory,
            bridge,
            ctx,
            agents: HashMap::new(),
            countdown,
            recheck_invalid: false,
            started_total: 0,
        }
    }

    /// Devices that currently have an agent
    pub fn running(&self) -> Vec<DeviceId> {
        self.agents.keys().cloned().collect()
    }

    pub fn is_running(&self, id: &DeviceId) -> bool {
        self.agents.contains_key(id)
    }

    /// Agents started since construction
    pub fn started_total(&self) -> usize {
        self.started_total
    }

    fn update_recheck_flag(&mut self) {
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown == 0 {
            self.recheck_invalid = true;
            self.countdown = self.config.invalid_check_every_n_cycles.max(1);
            info!("Rechecking invalid devices this cycle");
        }
    }

    /// One reconciliation tick
    pub async fn reconcile(&mut self) {
        self.update_recheck_flag();

        let mut stopping = Vec::new();
        for record in self.directory.snapshot().await {
            let id = record.id.clone();

            // An agent whose task died is replaced
            if self.agents.get(&id).is_some_and(AgentHandle::is_finished) {
                warn!(device = %id, "Device agent exited unexpectedly");
                if let Some(handle) = self.agents.remove(&id) {
                    stopping.push((id.clone(), handle));
                }
            }

            if record.valid || self.recheck_invalid {
                if !self.agents.contains_key(&id) {
                    let agent = DeviceAgent::new(
                        record,
                        self.directory.handle(id.clone()),
                        self.bridge.device_publisher(&id),
                        self.ctx.clone(),
                    );
                    self.agents.insert(id, AgentHandle::spawn(agent));
                    self.started_total += 1;
                }
            } else if let Some(handle) = self.agents.remove(&id) {
                info!(device = %id, "Stopping agent for invalid device");
                handle.signal();
                stopping.push((id, handle));
            }
        }

        self.recheck_invalid = false;
        join_agents(stopping).await;
        debug!(running = self.agents.len(), "Reconciliation complete");
    }

    /// Reconcile every `check_interval` until cancelled, then stop all agents
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval = ?self.config.check_interval,
            recheck_cycles = self.config.invalid_check_every_n_cycles,
            "Fleet supervisor starting"
        );

        while !cancel.is_cancelled() {
            self.reconcile().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
        }

        self.stop_all().await;
        info!("Fleet supervisor stopped");
    }

    /// Signal every agent, then wait for all of them
    pub async fn stop_all(&mut self) {
        let agents: Vec<(DeviceId, AgentHandle)> = self.agents.drain().collect();
        for (_, handle) in &agents {
            handle.signal();
        }
        join_agents(agents).await;
    }
}

async fn join_agents(agents: Vec<(DeviceId, AgentHandle)>) {
    for (id, handle) in agents {
        handle.stop().await;
        debug!(device = %id, "Agent joined");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::bridge::{BridgeConfig, PublishBridge};
    use crate::test_support::{FlakyMetadata, GatedAuth, RecordingBus};
    use sensorfleet_core::{
        AuthRegistry, Credential, CredentialProber, MemoryStore, ScrapeRegistry,
    };
    use std::net::{IpAddr, Ipv4Addr};

    fn context(auth: AuthRegistry, credentials: Vec<Credential>, interval: Duration) -> Arc<AgentContext> {
        let auth = Arc::new(auth);
        let scrape = Arc::new(ScrapeRegistry::new());
        Arc::new(AgentContext {
            prober: Arc::new(CredentialProber::new(auth.clone(), scrape.clone(), credentials)),
            auth,
            scrape,
            metadata: Arc::new(FlakyMetadata {
                known: Vec::new(),
                failing_index: None,
            }),
            config: AgentConfig {
                interval,
                ..AgentConfig::default()
            },
        })
    }

    async fn setup(recheck_cycles: u32) -> (FleetSupervisor, Directory, PublishBridge) {
        let ctx = context(AuthRegistry::new(), Vec::new(), Duration::from_secs(3600));
        setup_with(recheck_cycles, ctx).await
    }

    async fn setup_with(
        recheck_cycles: u32,
        ctx: Arc<AgentContext>,
    ) -> (FleetSupervisor, Directory, PublishBridge) {
        let directory = Directory::load(Arc::new(MemoryStore::new())).await;
        let bridge = PublishBridge::start(
            Arc::new(RecordingBus::default()),
            BridgeConfig {
                stream: "device_stream".into(),
                subject_prefix: "device".into(),
            },
        )
        .await;

        let supervisor = FleetSupervisor::new(
            SupervisorConfig {
                check_interval: Duration::from_millis(10),
                invalid_check_every_n_cycles: recheck_cycles,
            },
            directory.clone(),
            bridge.handle(),
            ctx,
        );
        (supervisor, directory, bridge)
    }

    fn device(n: u8) -> (DeviceId, IpAddr) {
        (
            DeviceId::from_mac(&format!("00:11:22:33:44:{:02x}", n)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)),
        )
    }

    #[tokio::test]
    async fn test_one_agent_per_device_across_ticks() {
        let (mut supervisor, directory, bridge) = setup(360).await;
        for n in 1..=3 {
            let (id, ip) = device(n);
            directory.upsert(id, ip).await;
        }

        for _ in 0..5 {
            supervisor.reconcile().await;
            assert_eq!(supervisor.running().len(), 3);
        }
        assert_eq!(supervisor.started_total(), 3);

        supervisor.stop_all().await;
        assert!(supervisor.running().is_empty());
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalidated_device_stopped_on_next_tick() {
        let (mut supervisor, directory, bridge) = setup(360).await;
        let (id, ip) = device(7);
        directory.upsert(id.clone(), ip).await;

        supervisor.reconcile().await;
        assert!(supervisor.is_running(&id));

        // The agent marks its own device invalid between ticks
        directory.handle(id.clone()).invalidate().await;
        assert!(supervisor.is_running(&id));

        supervisor.reconcile().await;
        assert!(!supervisor.is_running(&id));

        supervisor.reconcile().await;
        assert!(!supervisor.is_running(&id));
        assert_eq!(supervisor.started_total(), 1);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_devices_rechecked_periodically() {
        let (mut supervisor, directory, bridge) = setup(3).await;
        let (id, ip) = device(9);
        directory.upsert(id.clone(), ip).await;
        directory.handle(id.clone()).invalidate().await;

        supervisor.reconcile().await;
        supervisor.reconcile().await;
        assert!(!supervisor.is_running(&id));

        // Third tick is a recheck sweep
        supervisor.reconcile().await;
        assert!(supervisor.is_running(&id));

        // Still invalid on the following tick
        supervisor.reconcile().await;
        assert!(!supervisor.is_running(&id));

        supervisor.reconcile().await;
        supervisor.reconcile().await;
        assert!(supervisor.is_running(&id));
        assert_eq!(supervisor.started_total(), 2);

        supervisor.stop_all().await;
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_stops_agents_on_cancel() {
        let (supervisor, directory, bridge) = setup(360).await;
        let (id, ip) = device(3);
        directory.upsert(id, ip).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_agents_signalled_before_join() {
        let gate = Arc::new(GatedAuth::new());
        let mut auth = AuthRegistry::new();
        auth.register("gated", gate.clone());
        let ctx = context(
            auth,
            vec![Credential::new("root", "pw")],
            Duration::from_millis(1),
        );
        let (mut supervisor, directory, bridge) = setup_with(360, ctx).await;

        let (a, ip_a) = device(1);
        let (b, ip_b) = device(2);
        directory.upsert(a.clone(), ip_a).await;
        directory.upsert(b.clone(), ip_b).await;
        supervisor.reconcile().await;

        // Both agents are parked inside their first auth attempt
        tokio::time::timeout(Duration::from_secs(5), async {
            while gate.calls() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        directory.handle(a.clone()).invalidate().await;
        directory.handle(b.clone()).invalidate().await;

        let tick = tokio::spawn(async move {
            supervisor.reconcile().await;
            supervisor
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Enough for exactly one more attempt per agent. An agent left
        // unsignalled would start another iteration and block on the gate.
        gate.release(2);

        let supervisor = tokio::time::timeout(Duration::from_secs(5), tick)
            .await
            .unwrap()
            .unwrap();
        assert!(!supervisor.is_running(&a));
        assert!(!supervisor.is_running(&b));
        assert_eq!(gate.calls(), 2);
        bridge.shutdown().await;
    }
}
