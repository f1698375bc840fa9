//! Device Directory
//!
//! The in-memory table of every known device, shared by discovery, the
//! supervisor and all agents. All reads and writes go through one lock that
//! is held for a single record mutation or one snapshot copy, never across a
//! persistence call. Persistence is best effort: failures are logged and the
//! in-memory change stands.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::device::{DeviceId, DeviceRecord, DeviceUpdate};
use crate::store::DeviceStore;

struct Inner {
    devices: Mutex<HashMap<DeviceId, DeviceRecord>>,
    store: Arc<dyn DeviceStore>,
}

/// Shared, cheaply cloneable reference to the directory
#[derive(Clone)]
pub struct Directory {
    inner: Arc<Inner>,
}

impl Directory {
    /// Seed the table from `store`. A failed load yields an empty directory.
    pub async fn load(store: Arc<dyn DeviceStore>) -> Self {
        let devices = match store.load_all().await {
            Ok(records) => {
                info!(count = records.len(), "Loaded devices from store");
                records.into_iter().map(|r| (r.id.clone(), r)).collect()
            }
            Err(e) => {
                warn!(error = %e, "Failed to load devices, starting with an empty directory");
                HashMap::new()
            }
        };

        Self {
            inner: Arc::new(Inner {
                devices: Mutex::new(devices),
                store,
            }),
        }
    }

    /// Insert an unseen device or move a known one to `address`
    pub async fn upsert(&self, id: DeviceId, address: IpAddr) {
        let inserted = {
            let mut devices = self.inner.devices.lock().await;
            match devices.get_mut(&id) {
                Some(record) => {
                    if record.address == address {
                        return;
                    }
                    debug!(device = %id, old = %record.address, new = %address, "Device address changed");
                    record.address = address;
                    None
                }
                None => {
                    let record = DeviceRecord::new(id.clone(), address);
                    devices.insert(id.clone(), record.clone());
                    Some(record)
                }
            }
        };

        match inserted {
            Some(record) => {
                info!(device = %id, %address, "Discovered new device");
                if let Err(e) = self.inner.store.insert(&record).await {
                    warn!(device = %id, error = %e, "Failed to persist new device");
                }
            }
            None => {
                let update = DeviceUpdate {
                    address: Some(address),
                    ..DeviceUpdate::default()
                };
                self.persist(&id, &update).await;
            }
        }
    }

    /// Point-in-time copy of every record
    pub async fn snapshot(&self) -> Vec<DeviceRecord> {
        self.inner.devices.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.inner.devices.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.devices.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop a device from the in-memory table. The store keeps its copy.
    pub async fn remove(&self, id: &DeviceId) -> Option<DeviceRecord> {
        let removed = self.inner.devices.lock().await.remove(id);
        if removed.is_some() {
            info!(device = %id, "Removed device from directory");
        }
        removed
    }

    /// Mutation capability bound to one device
    pub fn handle(&self, id: DeviceId) -> DeviceHandle {
        DeviceHandle {
            id,
            directory: self.clone(),
        }
    }

    async fn mutate(&self, id: &DeviceId, update: &DeviceUpdate) -> bool {
        let mut devices = self.inner.devices.lock().await;
        match devices.get_mut(id) {
            Some(record) => {
                record.apply(update);
                true
            }
            None => false,
        }
    }

    async fn persist(&self, id: &DeviceId, update: &DeviceUpdate) {
        if let Err(e) = self.inner.store.update_fields(id, update).await {
            warn!(device = %id, error = %e, "Failed to persist device update");
        }
    }
}

/// Per-device view of the directory handed to an agent.
///
/// Each call locks the table, changes only this device's record, releases the
/// lock and then persists the same change.
#[derive(Clone)]
pub struct DeviceHandle {
    id: DeviceId,
    directory: Directory,
}

impl DeviceHandle {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Mark the device serviceable and clear its failure count
    pub async fn validate(&self) {
        let update = DeviceUpdate {
            valid: Some(true),
            failures: Some(0),
            ..DeviceUpdate::default()
        };
        self.update_fields(update).await;
    }

    /// Mark the device unserviceable; the supervisor stops its agent on a later tick
    pub async fn invalidate(&self) {
        let update = DeviceUpdate {
            valid: Some(false),
            ..DeviceUpdate::default()
        };
        self.update_fields(update).await;
    }

    pub async fn update_fields(&self, update: DeviceUpdate) {
        if update.is_empty() {
            return;
        }
        if !self.directory.mutate(&self.id, &update).await {
            warn!(device = %self.id, "Update for device missing from directory");
            return;
        }
        self.directory.persist(&self.id, &update).await;
    }
}
