//! Sensorfleet Core - device directory, strategies, and credential discovery
//!
//! This crate provides the foundational pieces of the fleet engine:
//! - Device records and the telemetry wire message
//! - Named auth/scrape strategy contracts and their ordered registries
//! - The brute-force credential prober
//! - Persistence contracts with in-memory and JSON-file stores
//! - The shared Device Directory and per-device handles

pub mod device;
pub mod directory;
pub mod prober;
pub mod store;
pub mod strategy;
pub mod telemetry;

pub use device::{unix_now, Credential, DeviceId, DeviceRecord, DeviceUpdate, SessionUpdate};
pub use directory::{DeviceHandle, Directory};
pub use prober::{CredentialProber, ProbeError, ProbeOutcome};
pub use store::{DeviceStore, JsonFileStore, MemoryStore, MetadataLookup, StoreError};
pub use strategy::{
    AuthRegistry, AuthStrategy, ScrapeRegistry, ScrapeStrategy, StrategyError, StrategyRegistry,
};
pub use telemetry::{
    EventType, FieldMetadata, Machine, MachineStage, Product, TelemetryMessage, Zone,
};
