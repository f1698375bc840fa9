//! Device Agent: the per-device control loop
//!
//! Each iteration:
//! 1. invalidate the device once its failure count passes the threshold
//! 2. refresh an expired session with the recorded auth strategy
//! 3. with a live session, scrape and publish one message per reading
//! 4. without one, run credential discovery and commit the result
//!
//! Errors increment the failure count and never end the loop. Only the
//! supervisor stops an agent.

use sensorfleet_core::{
    unix_now, AuthRegistry, CredentialProber, DeviceHandle, DeviceRecord, DeviceUpdate,
    MetadataLookup, ProbeError, ScrapeRegistry, SessionUpdate, StrategyError, TelemetryMessage,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::DevicePublisher;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("Device has no scrape strategy")]
    NoScrapeStrategy,
    #[error("Failed to encode telemetry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Pause between iterations
    pub interval: Duration,
    /// Failures above this mark the device invalid
    pub failure_threshold: u32,
    /// Lifetime given to a fresh session
    pub session_ttl: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            failure_threshold: 5,
            session_ttl: Duration::from_secs(20 * 60),
        }
    }
}

/// Collaborators shared by every agent
pub struct AgentContext {
    pub prober: Arc<CredentialProber>,
    pub auth: Arc<AuthRegistry>,
    pub scrape: Arc<ScrapeRegistry>,
    pub metadata: Arc<dyn MetadataLookup>,
    pub config: AgentConfig,
}

/// Where an iteration ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Readings were scraped and handed to the bridge
    Published(usize),
    /// A working combination was found and committed
    Discovered,
    Failed,
}

pub struct DeviceAgent {
    /// Private working copy; shared state changes only through `handle`
    record: DeviceRecord,
    handle: DeviceHandle,
    publisher: DevicePublisher,
    ctx: Arc<AgentContext>,
}

impl DeviceAgent {
    pub fn new(
        record: DeviceRecord,
        handle: DeviceHandle,
        publisher: DevicePublisher,
        ctx: Arc<AgentContext>,
    ) -> Self {
        Self {
            record,
            handle,
            publisher,
            ctx,
        }
    }

    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    /// Run one pass of the control loop
    pub async fn iterate(&mut self) -> Outcome {
        if self.record.failures > self.ctx.config.failure_threshold {
            warn!(device = %self.record.id, failures = self.record.failures, "Too many failures, invalidating device");
            self.handle.invalidate().await;
        }

        match self.step().await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record.failures += 1;
                warn!(device = %self.record.id, failures = self.record.failures, error = %e, "Device iteration failed");
                self.handle
                    .update_fields(DeviceUpdate::failures(self.record.failures))
                    .await;
                Outcome::Failed
            }
        }
    }

    async fn step(&mut self) -> Result<Outcome, AgentError> {
        let now = unix_now();
        if self.record.session_expired(now) {
            self.refresh_session(now).await;
        }

        if self.record.session_token.is_some() {
            let published = self.scrape_and_publish().await?;
            Ok(Outcome::Published(published))
        } else {
            self.discover().await?;
            Ok(Outcome::Discovered)
        }
    }

    fn session_expiry(&self, now: i64) -> i64 {
        now + self.ctx.config.session_ttl.as_secs() as i64
    }

    /// Re-authenticate with the recorded strategy and credentials. On failure
    /// the session is dropped so the same iteration falls back to discovery.
    async fn refresh_session(&mut self, now: i64) {
        let (Some(auth_strategy), Some(credential)) =
            (self.record.auth_strategy.clone(), self.record.credential())
        else {
            self.record.session_token = None;
            return;
        };

        debug!(device = %self.record.id, auth = %auth_strategy, "Refreshing session");
        match self
            .ctx
            .auth
            .authenticate(&auth_strategy, self.record.address, &credential)
            .await
        {
            Ok(token) => {
                let update =
                    DeviceUpdate::session(&auth_strategy, Some(token), self.session_expiry(now));
                self.record.apply(&update);
                self.handle.update_fields(update).await;
                info!(device = %self.record.id, "Session refreshed");
            }
            Err(e) => {
                warn!(device = %self.record.id, auth = %auth_strategy, error = %e, "Session refresh failed, falling back to discovery");
                self.record.session_token = None;
            }
        }
    }

    async fn scrape_and_publish(&mut self) -> Result<usize, AgentError> {
        let scrape_strategy = self
            .record
            .scrape_strategy
            .clone()
            .ok_or(AgentError::NoScrapeStrategy)?;
        let token = self.record.session_token.clone().unwrap_or_default();

        let readings = self
            .ctx
            .scrape
            .scrape(&scrape_strategy, self.record.address, &token)
            .await?;

        let timestamp = unix_now();
        let mac = self.record.id.as_str();
        let ip = self.record.address.to_string();

        for (index, value) in readings.iter().enumerate() {
            let index = index as u32;
            let message = TelemetryMessage::reading(timestamp, mac, &ip, index, *value);
            let message = match self.ctx.metadata.lookup(&self.record.id, index).await {
                Ok(Some(metadata)) => message.enrich(&metadata),
                Ok(None) => message,
                Err(e) => {
                    warn!(device = %self.record.id, index, error = %e, "Metadata lookup failed, publishing bare reading");
                    message
                }
            };
            self.publisher.publish(&message)?;
        }

        debug!(device = %self.record.id, fields = readings.len(), "Published readings");

        let update = DeviceUpdate {
            last_data: Some(serde_json::to_string(&readings)?),
            last_seen: Some(timestamp),
            ..DeviceUpdate::default()
        };
        self.record.apply(&update);
        self.handle.update_fields(update).await;
        self.mark_healthy().await;

        Ok(readings.len())
    }

    /// A successful scrape ends any failure streak. A device brought back by a
    /// recheck sweep on its stored session becomes valid again.
    async fn mark_healthy(&mut self) {
        if !self.record.valid {
            self.record.valid = true;
            self.record.failures = 0;
            self.handle.validate().await;
            info!(device = %self.record.id, "Device recovered");
        } else if self.record.failures > 0 {
            self.record.failures = 0;
            self.handle.update_fields(DeviceUpdate::failures(0)).await;
        }
    }

    /// Brute-force a working combination and commit it
    async fn discover(&mut self) -> Result<(), AgentError> {
        let outcome = self.ctx.prober.probe(&self.record).await?;
        let expires_at = self.session_expiry(unix_now());

        let update = DeviceUpdate {
            credential: Some(outcome.credential),
            scrape_strategy: Some(outcome.scrape_strategy),
            session: Some(SessionUpdate {
                auth_strategy: outcome.auth_strategy,
                token: Some(outcome.token),
                expires_at,
            }),
            ..DeviceUpdate::default()
        };

        self.record.apply(&update);
        self.record.valid = true;
        self.record.failures = 0;

        self.handle.validate().await;
        self.handle.update_fields(update).await;

        info!(device = %self.record.id, "Device session established");
        Ok(())
    }

    /// Loop until `cancel` fires. Cancellation is checked between
    /// iterations, never inside one.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(device = %self.record.id, address = %self.record.address, "Starting device agent");

        while !cancel.is_cancelled() {
            self.iterate().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.config.interval) => {}
            }
        }

        info!(device = %self.record.id, "Device agent stopped");
    }
}

/// A spawned agent task
pub struct AgentHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn spawn(agent: DeviceAgent) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(agent.run(cancel.clone()));
        Self { cancel, task }
    }

    /// Ask the agent to stop at its next loop check
    pub fn signal(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal and wait for the task to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Device agent task failed");
        }
    }
}
