//! Message bus client

use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("Failed to create stream {name}: {reason}")]
    Stream { name: String, reason: String },
    #[error("Publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("Flush failed: {0}")]
    Flush(String),
}

/// Outcome of an idempotent stream creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Created,
    Existing,
}

/// Publish side of a durable message bus
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Create the stream unless it already exists
    async fn ensure_stream(&self, name: &str, subjects: &[String]) -> Result<StreamStatus, BusError>;
    /// Publish one message and wait for the bus to accept it
    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), BusError>;
    /// Push out anything still buffered in the connection
    async fn flush(&self) -> Result<(), BusError>;
}

/// NATS JetStream client
pub struct NatsBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsBus {
    /// Connect to `url`. Reconnects happen in the background, so an
    /// unreachable server surfaces later as per-message publish failures.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .connect(url)
            .await
            .map_err(|e| BusError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        info!(url = %url, "Message bus client started");
        let jetstream = jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }
}

#[async_trait]
impl BusClient for NatsBus {
    async fn ensure_stream(&self, name: &str, subjects: &[String]) -> Result<StreamStatus, BusError> {
        let config = stream::Config {
            name: name.to_string(),
            subjects: subjects.to_vec(),
            ..Default::default()
        };

        match self.jetstream.create_stream(config).await {
            Ok(_) => Ok(StreamStatus::Created),
            Err(create_err) => match self.jetstream.get_stream(name).await {
                Ok(_) => Ok(StreamStatus::Existing),
                Err(_) => Err(BusError::Stream {
                    name: name.to_string(),
                    reason: create_err.to_string(),
                }),
            },
        }
    }

    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), BusError> {
        let publish_error = |subject: &str, e: &dyn std::fmt::Display| BusError::Publish {
            subject: subject.to_string(),
            reason: e.to_string(),
        };

        let ack = self
            .jetstream
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| publish_error(&subject, &e))?;
        ack.await.map_err(|e| publish_error(&subject, &e))?;

        debug!(subject = %subject, "Published message");
        Ok(())
    }

    async fn flush(&self) -> Result<(), BusError> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Flush(e.to_string()))
    }
}
