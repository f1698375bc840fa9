//! Hand-written fakes shared by the daemon tests

use async_trait::async_trait;
use bytes::Bytes;
use sensorfleet_core::{
    AuthStrategy, Credential, DeviceId, FieldMetadata, MetadataLookup, ScrapeStrategy,
    StoreError, StrategyError,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

use crate::bridge::OutboundMessage;
use crate::bus::{BusClient, BusError, StreamStatus};

/// Bus that records everything it is asked to do
#[derive(Default)]
pub struct RecordingBus {
    streams: Mutex<Vec<(String, Vec<String>)>>,
    published: Mutex<Vec<OutboundMessage>>,
    flushed: AtomicBool,
    stream_error: bool,
    failing_subject: Option<String>,
}

impl RecordingBus {
    pub fn with_stream_error() -> Self {
        Self {
            stream_error: true,
            ..Self::default()
        }
    }

    pub fn failing_subject(subject: &str) -> Self {
        Self {
            failing_subject: Some(subject.to_string()),
            ..Self::default()
        }
    }

    pub fn streams(&self) -> Vec<(String, Vec<String>)> {
        self.streams.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusClient for RecordingBus {
    async fn ensure_stream(&self, name: &str, subjects: &[String]) -> Result<StreamStatus, BusError> {
        if self.stream_error {
            return Err(BusError::Stream {
                name: name.to_string(),
                reason: "jetstream not enabled".to_string(),
            });
        }
        self.streams
            .lock()
            .unwrap()
            .push((name.to_string(), subjects.to_vec()));
        Ok(StreamStatus::Created)
    }

    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), BusError> {
        if self.failing_subject.as_deref() == Some(subject.as_str()) {
            return Err(BusError::Publish {
                subject,
                reason: "no responders".to_string(),
            });
        }
        self.published
            .lock()
            .unwrap()
            .push(OutboundMessage { subject, payload });
        Ok(())
    }

    async fn flush(&self) -> Result<(), BusError> {
        self.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Auth strategy that accepts one password and hands out numbered tokens
pub struct CountingAuth {
    password: String,
    token_prefix: String,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl CountingAuth {
    pub fn new(password: &str, token_prefix: &str) -> Self {
        Self {
            password: password.to_string(),
            token_prefix: token_prefix.to_string(),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every later call fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthStrategy for CountingAuth {
    async fn authenticate(
        &self,
        _address: IpAddr,
        credential: &Credential,
    ) -> Result<String, StrategyError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) || credential.password != self.password {
            return Err(StrategyError::Request("401 Unauthorized".to_string()));
        }
        if call == 1 {
            Ok(self.token_prefix.clone())
        } else {
            Ok(format!("{}-{}", self.token_prefix, call))
        }
    }
}

/// Scrape strategy returning fixed readings for any token it accepts
pub struct FixedScrape {
    accepts_prefix: String,
    readings: Vec<i64>,
    tokens_seen: Mutex<Vec<String>>,
}

impl FixedScrape {
    pub fn new(accepts_prefix: &str, readings: Vec<i64>) -> Self {
        Self {
            accepts_prefix: accepts_prefix.to_string(),
            readings,
            tokens_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScrapeStrategy for FixedScrape {
    async fn scrape(&self, _address: IpAddr, token: &str) -> Result<Vec<i64>, StrategyError> {
        self.tokens_seen.lock().unwrap().push(token.to_string());
        if token.starts_with(&self.accepts_prefix) {
            Ok(self.readings.clone())
        } else {
            Err(StrategyError::InvalidResponse("session rejected".to_string()))
        }
    }
}

/// Metadata lookup with one known entry and one index that errors
pub struct FlakyMetadata {
    pub known: Vec<FieldMetadata>,
    pub failing_index: Option<u32>,
}

#[async_trait]
impl MetadataLookup for FlakyMetadata {
    async fn lookup(&self, id: &DeviceId, index: u32) -> Result<Option<FieldMetadata>, StoreError> {
        if self.failing_index == Some(index) {
            return Err(StoreError::Unavailable("metadata table locked".to_string()));
        }
        Ok(self
            .known
            .iter()
            .find(|m| &m.device == id && m.data_field_index == index)
            .cloned())
    }
}

/// Auth strategy that blocks every attempt until the test releases it
pub struct GatedAuth {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedAuth {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Let `attempts` blocked or future attempts through
    pub fn release(&self, attempts: usize) {
        self.gate.add_permits(attempts);
    }
}

#[async_trait]
impl AuthStrategy for GatedAuth {
    async fn authenticate(
        &self,
        _address: IpAddr,
        _credential: &Credential,
    ) -> Result<String, StrategyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| StrategyError::Request(e.to_string()))?;
        permit.forget();
        Err(StrategyError::Request("401 Unauthorized".to_string()))
    }
}
