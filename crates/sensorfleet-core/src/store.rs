//! Persistence contracts consumed by the directory and the agents
//!
//! The in-memory directory is authoritative at runtime; a store only makes
//! device records durable across restarts and serves field metadata. Two
//! implementations are provided:
//! - `MemoryStore`, volatile, for tests and one-shot runs
//! - `JsonFileStore`, a devices file plus a metadata file on disk

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::device::{DeviceId, DeviceRecord, DeviceUpdate};
use crate::telemetry::FieldMetadata;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Device not found: {0}")]
    NotFound(DeviceId),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage of device records
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError>;
    async fn insert(&self, record: &DeviceRecord) -> Result<(), StoreError>;
    async fn update_fields(&self, id: &DeviceId, update: &DeviceUpdate) -> Result<(), StoreError>;
}

/// Resolves enrichment for a (device, field index) pair
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn lookup(&self, id: &DeviceId, index: u32) -> Result<Option<FieldMetadata>, StoreError>;
}

fn find_metadata(entries: &[FieldMetadata], id: &DeviceId, index: u32) -> Option<FieldMetadata> {
    entries
        .iter()
        .find(|m| &m.device == id && m.data_field_index == index)
        .cloned()
}

/// Volatile store
#[derive(Default)]
pub struct MemoryStore {
    devices: Mutex<BTreeMap<DeviceId, DeviceRecord>>,
    metadata: Vec<FieldMetadata>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<DeviceRecord>) -> Self {
        Self {
            devices: Mutex::new(devices.into_iter().map(|d| (d.id.clone(), d)).collect()),
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Vec<FieldMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Current persisted copy of one record
    pub async fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.devices.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.devices.lock().await.values().cloned().collect())
    }

    async fn insert(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        self.devices
            .lock()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_fields(&self, id: &DeviceId, update: &DeviceUpdate) -> Result<(), StoreError> {
        let mut devices = self.devices.lock().await;
        let record = devices
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        record.apply(update);
        Ok(())
    }
}

#[async_trait]
impl MetadataLookup for MemoryStore {
    async fn lookup(&self, id: &DeviceId, index: u32) -> Result<Option<FieldMetadata>, StoreError> {
        Ok(find_metadata(&self.metadata, id, index))
    }
}

/// On-disk layout of the devices file
#[derive(Debug, Default, Serialize, Deserialize)]
struct DevicesFile {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    devices: BTreeMap<DeviceId, DeviceRecord>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// JSON files on disk. Each mutation rewrites the devices file through a
/// temporary file and a rename.
pub struct JsonFileStore {
    devices_path: PathBuf,
    metadata: Vec<FieldMetadata>,
    file_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store. A missing metadata file means no enrichment.
    pub async fn open(devices_path: &Path, metadata_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = devices_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let metadata = if tokio::fs::try_exists(metadata_path).await? {
            let content = tokio::fs::read_to_string(metadata_path).await?;
            let entries: Vec<FieldMetadata> = serde_json::from_str(&content)?;
            info!(path = %metadata_path.display(), count = entries.len(), "Loaded field metadata");
            entries
        } else {
            info!(path = %metadata_path.display(), "Field metadata file not found, publishing bare readings");
            Vec::new()
        };

        Ok(Self {
            devices_path: devices_path.to_path_buf(),
            metadata,
            file_lock: Mutex::new(()),
        })
    }

    async fn read_devices(&self) -> Result<DevicesFile, StoreError> {
        if !tokio::fs::try_exists(&self.devices_path).await? {
            return Ok(DevicesFile {
                version: default_version(),
                devices: BTreeMap::new(),
            });
        }
        let content = tokio::fs::read_to_string(&self.devices_path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_devices(&self, file: &DevicesFile) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(file)?;
        let tmp = self.devices_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.devices_path).await?;
        debug!(path = %self.devices_path.display(), devices = file.devices.len(), "Wrote devices file");
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let _guard = self.file_lock.lock().await;
        Ok(self.read_devices().await?.devices.into_values().collect())
    }

    async fn insert(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        let _guard = self.file_lock.lock().await;
        let mut file = self.read_devices().await?;
        file.devices.insert(record.id.clone(), record.clone());
        self.write_devices(&file).await
    }

    async fn update_fields(&self, id: &DeviceId, update: &DeviceUpdate) -> Result<(), StoreError> {
        let _guard = self.file_lock.lock().await;
        let mut file = self.read_devices().await?;
        let record = file
            .devices
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        record.apply(update);
        self.write_devices(&file).await
    }
}

#[async_trait]
impl MetadataLookup for JsonFileStore {
    async fn lookup(&self, id: &DeviceId, index: u32) -> Result<Option<FieldMetadata>, StoreError> {
        Ok(find_metadata(&self.metadata, id, index))
    }
}
