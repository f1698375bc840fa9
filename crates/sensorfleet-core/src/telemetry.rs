//! Telemetry messages published to the bus, one per scraped field

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// Product handled at the measuring point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Product {
    #[serde(rename = "accomodation sheet")]
    AccomodationSheet,
    #[serde(rename = "towel")]
    Towel,
    #[serde(rename = "hospital sheet")]
    HospitalSheet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Sorting,
    Washing,
    Finishing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Machine {
    #[serde(rename = "Ironer 1")]
    Ironer1,
    #[serde(rename = "Ironer 2")]
    Ironer2,
    #[serde(rename = "Ironer 3")]
    Ironer3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStage {
    Feeder,
    Folder,
    Stacker,
}

/// What a counter increment means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    ProcessedPiece,
    DroppedLoad,
    BatchWasherFullRotation,
    BagIdentified,
    ConveyorTravel,
    PressLoading,
    PressUnloading,
    DryerLoading,
    DryerUnloading,
}

/// Enrichment for one (device, field index) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub device: DeviceId,
    pub data_field_index: u32,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub zone: Option<Zone>,
    #[serde(default)]
    pub machine: Option<Machine>,
    #[serde(default)]
    pub machine_stage: Option<MachineStage>,
    #[serde(default)]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub units: Option<String>,
}

/// Wire format of one field reading. Absent optional fields serialize as null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    /// Unix seconds, shared by every field of one scrape
    pub timestamp: i64,
    pub source_mac: String,
    pub source_ip: String,
    pub source_name: Option<String>,
    pub product: Option<Product>,
    pub zone: Option<Zone>,
    pub machine: Option<Machine>,
    pub machine_stage: Option<MachineStage>,
    pub event_type: Option<EventType>,
    pub units: Option<String>,
    pub value: i64,
    pub data_field_index: u32,
    pub pieces: Option<i64>,
    pub estimated_pieces: Option<i64>,
    pub rfid: Option<String>,
    pub dry_time_seconds: Option<i64>,
}

impl TelemetryMessage {
    /// Bare reading with no enrichment
    pub fn reading(
        timestamp: i64,
        source_mac: &str,
        source_ip: &str,
        data_field_index: u32,
        value: i64,
    ) -> Self {
        Self {
            timestamp,
            source_mac: source_mac.to_string(),
            source_ip: source_ip.to_string(),
            source_name: None,
            product: None,
            zone: None,
            machine: None,
            machine_stage: None,
            event_type: None,
            units: None,
            value,
            data_field_index,
            pieces: None,
            estimated_pieces: None,
            rfid: None,
            dry_time_seconds: None,
        }
    }

    /// Copy the enrichment fields of `metadata` onto this message
    pub fn enrich(mut self, metadata: &FieldMetadata) -> Self {
        self.source_name = metadata.source_name.clone();
        self.zone = metadata.zone;
        self.machine = metadata.machine;
        self.machine_stage = metadata.machine_stage;
        self.event_type = metadata.event_type;
        self.units = metadata.units.clone();
        self
    }

    /// Encode as compact JSON
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
