//! Publish Bridge
//!
//! Agents hand messages to a `BridgeHandle`, which queues them without
//! blocking. A single consumer task forwards the queue to the bus in FIFO
//! order. Failed publishes are logged and dropped.

use bytes::Bytes;
use sensorfleet_core::{DeviceId, TelemetryMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, StreamStatus};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub stream: String,
    pub subject_prefix: String,
}

/// One queued bus message
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Cloneable producer side of the bridge
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    subject_prefix: Arc<str>,
}

impl BridgeHandle {
    /// Queue a message and return immediately
    pub fn publish(&self, subject: String, payload: Bytes) {
        if let Err(e) = self.tx.send(OutboundMessage { subject, payload }) {
            warn!(subject = %e.0.subject, "Publish bridge is closed, dropping message");
        }
    }

    /// Bus subject for a device: `<prefix>.<normalized identity>`
    pub fn subject_for(&self, id: &DeviceId) -> String {
        format!("{}.{}", self.subject_prefix, id.normalized())
    }

    /// Publisher bound to one device's subject
    pub fn device_publisher(&self, id: &DeviceId) -> DevicePublisher {
        DevicePublisher {
            subject: self.subject_for(id),
            bridge: self.clone(),
        }
    }
}

/// Publish capability for a single device
#[derive(Clone)]
pub struct DevicePublisher {
    subject: String,
    bridge: BridgeHandle,
}

impl DevicePublisher {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn publish(&self, message: &TelemetryMessage) -> Result<(), serde_json::Error> {
        let payload = message.to_bytes()?;
        self.bridge.publish(self.subject.clone(), Bytes::from(payload));
        Ok(())
    }
}

/// Running bridge: the consumer task plus its stop signal
pub struct PublishBridge {
    handle: BridgeHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PublishBridge {
    /// Ensure the durable stream exists, then start the consumer task.
    /// Stream errors are logged and do not prevent startup.
    pub async fn start(bus: Arc<dyn BusClient>, config: BridgeConfig) -> Self {
        let subjects = vec![format!("{}.>", config.subject_prefix)];
        match bus.ensure_stream(&config.stream, &subjects).await {
            Ok(StreamStatus::Created) => info!(stream = %config.stream, "Created message stream"),
            Ok(StreamStatus::Existing) => info!(stream = %config.stream, "Message stream already exists"),
            Err(e) => warn!(stream = %config.stream, error = %e, "Failed to create message stream"),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(bus, rx, cancel.clone()));

        Self {
            handle: BridgeHandle {
                tx,
                subject_prefix: Arc::from(config.subject_prefix.as_str()),
            },
            cancel,
            task,
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Stop accepting messages, drain the queue, and flush the bus
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Publish bridge task failed");
        }
    }
}

async fn forward(
    bus: Arc<dyn BusClient>,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    cancel: CancellationToken,
) {
    debug!("Publish bridge running");

    loop {
        tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(message) => send(bus.as_ref(), message).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                rx.close();
                let mut drained = 0usize;
                while let Some(message) = rx.recv().await {
                    send(bus.as_ref(), message).await;
                    drained += 1;
                }
                debug!(drained, "Drained publish queue");
                break;
            }
        }
    }

    if let Err(e) = bus.flush().await {
        warn!(error = %e, "Failed to flush message bus");
    }
    info!("Publish bridge stopped");
}

async fn send(bus: &dyn BusClient, message: OutboundMessage) {
    if let Err(e) = bus.publish(message.subject, message.payload).await {
        warn!(error = %e, "Publish failed, message dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingBus;

    fn config() -> BridgeConfig {
        BridgeConfig {
            stream: "device_stream".to_string(),
            subject_prefix: "device".to_string(),
        }
    }

    #[tokio::test]
    async fn test_stream_created_with_wildcard_subject() {
        let bus = Arc::new(RecordingBus::default());
        let bridge = PublishBridge::start(bus.clone(), config()).await;
        bridge.shutdown().await;

        let streams = bus.streams();
        assert_eq!(streams, vec![("device_stream".to_string(), vec!["device.>".to_string()])]);
        assert!(bus.flushed());
    }

    #[tokio::test]
    async fn test_stream_error_does_not_block_startup() {
        let bus = Arc::new(RecordingBus::with_stream_error());
        let bridge = PublishBridge::start(bus.clone(), config()).await;
        bridge.handle().publish("device.x".into(), Bytes::from_static(b"1"));
        bridge.shutdown().await;
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_device_subject_is_normalized() {
        let bus = Arc::new(RecordingBus::default());
        let bridge = PublishBridge::start(bus, config()).await;
        let publisher = bridge
            .handle()
            .device_publisher(&DeviceId::from_mac("AA:BB:CC:DD:EE:FF"));
        assert_eq!(publisher.subject(), "device.aabbccddeeff");
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_fifo_and_drain_on_shutdown() {
        let bus = Arc::new(RecordingBus::default());
        let bridge = PublishBridge::start(bus.clone(), config()).await;
        let handle = bridge.handle();

        for i in 0..50u8 {
            handle.publish("device.a".into(), Bytes::from(vec![i]));
        }
        bridge.shutdown().await;

        let published = bus.published();
        assert_eq!(published.len(), 50);
        for (i, message) in published.iter().enumerate() {
            assert_eq!(message.payload.as_ref(), &[i as u8]);
        }

        // Queue is closed now; publishing is a logged no-op
        handle.publish("device.a".into(), Bytes::from_static(b"late"));
        assert_eq!(bus.published().len(), 50);
    }

    #[tokio::test]
    async fn test_publish_failure_drops_message_and_continues() {
        let bus = Arc::new(RecordingBus::failing_subject("device.bad"));
        let bridge = PublishBridge::start(bus.clone(), config()).await;
        let handle = bridge.handle();

        handle.publish("device.bad".into(), Bytes::from_static(b"x"));
        handle.publish("device.good".into(), Bytes::from_static(b"y"));
        bridge.shutdown().await;

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "device.good");
    }
}
