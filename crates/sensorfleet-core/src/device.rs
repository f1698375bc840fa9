//! Device records tracked by the fleet directory

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Unique identifier for a device, derived from its hardware (MAC) address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a new DeviceId from a MAC address string, kept verbatim
    pub fn from_mac(mac: &str) -> Self {
        Self(mac.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-cased identity with separators removed ("AA:BB:..." -> "aabb...")
    pub fn normalized(&self) -> String {
        self.0
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .flat_map(char::to_lowercase)
            .collect()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A username/password pair tried against a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// A device in the fleet directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Hardware identity (primary key, never reused)
    pub id: DeviceId,
    /// Last known network address
    pub address: IpAddr,
    /// Whether the device is currently serviced by an agent
    pub valid: bool,
    /// Consecutive failed agent iterations
    pub failures: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Name of the auth strategy that produced `session_token`
    pub auth_strategy: Option<String>,
    /// Name of the scrape strategy known to work with this device
    pub scrape_strategy: Option<String>,
    pub session_token: Option<String>,
    /// Unix seconds after which the session must be refreshed
    pub session_expires: i64,
    /// Last scraped readings, as a JSON array
    pub last_data: Option<String>,
    /// Unix seconds of the last successful scrape
    pub last_seen: Option<i64>,
}

impl DeviceRecord {
    /// Create a blank record for a newly discovered device
    pub fn new(id: DeviceId, address: IpAddr) -> Self {
        Self {
            id,
            address,
            valid: true,
            failures: 0,
            username: None,
            password: None,
            auth_strategy: None,
            scrape_strategy: None,
            session_token: None,
            session_expires: 0,
            last_data: None,
            last_seen: None,
        }
    }

    /// Stored credentials, if both halves are known
    pub fn credential(&self) -> Option<Credential> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credential::new(username, password)),
            _ => None,
        }
    }

    /// True when there is no usable token or its expiry has passed
    pub fn session_expired(&self, now: i64) -> bool {
        self.session_token.is_none() || self.session_expires < now
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: &DeviceUpdate) {
        if let Some(address) = update.address {
            self.address = address;
        }
        if let Some(valid) = update.valid {
            self.valid = valid;
        }
        if let Some(failures) = update.failures {
            self.failures = failures;
        }
        if let Some(credential) = &update.credential {
            self.username = Some(credential.username.clone());
            self.password = Some(credential.password.clone());
        }
        if let Some(scrape_strategy) = &update.scrape_strategy {
            self.scrape_strategy = Some(scrape_strategy.clone());
        }
        if let Some(session) = &update.session {
            self.auth_strategy = Some(session.auth_strategy.clone());
            self.session_token = session.token.clone();
            self.session_expires = session.expires_at;
        }
        if let Some(last_data) = &update.last_data {
            self.last_data = Some(last_data.clone());
        }
        if let Some(last_seen) = update.last_seen {
            self.last_seen = Some(last_seen);
        }
    }
}

/// Session material. The token and the strategy that issued it travel together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub auth_strategy: String,
    pub token: Option<String>,
    pub expires_at: i64,
}

/// Partial update of one device record; `None` leaves the field untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub address: Option<IpAddr>,
    pub valid: Option<bool>,
    pub failures: Option<u32>,
    pub credential: Option<Credential>,
    pub scrape_strategy: Option<String>,
    pub session: Option<SessionUpdate>,
    pub last_data: Option<String>,
    pub last_seen: Option<i64>,
}

impl DeviceUpdate {
    pub fn failures(failures: u32) -> Self {
        Self {
            failures: Some(failures),
            ..Self::default()
        }
    }

    pub fn session(auth_strategy: &str, token: Option<String>, expires_at: i64) -> Self {
        Self {
            session: Some(SessionUpdate {
                auth_strategy: auth_strategy.to_string(),
                token,
                expires_at,
            }),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Current wall-clock time in unix seconds
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn record() -> DeviceRecord {
        DeviceRecord::new(
            DeviceId::from_mac("AA:BB:CC:DD:EE:FF"),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40)),
        )
    }

    #[test]
    fn test_normalized_identity() {
        let id = DeviceId::from_mac("AA:BB:CC:DD:EE:FF");
        assert_eq!(id.normalized(), "aabbccddeeff");
        assert_eq!(id.as_str(), "AA:BB:CC:DD:EE:FF");

        let dashed = DeviceId::from_mac("00-1A-2b-3C-4d-5E");
        assert_eq!(dashed.normalized(), "001a2b3c4d5e");
    }

    #[test]
    fn test_new_record_is_blank() {
        let device = record();
        assert!(device.valid);
        assert_eq!(device.failures, 0);
        assert!(device.credential().is_none());
        assert!(device.session_expired(0));
    }

    #[test]
    fn test_session_expiry() {
        let mut device = record();
        device.apply(&DeviceUpdate::session("spindle_device", Some("tok".into()), 1_000));
        assert!(!device.session_expired(999));
        assert!(!device.session_expired(1_000));
        assert!(device.session_expired(1_001));
    }

    #[test]
    fn test_apply_keeps_untouched_fields() {
        let mut device = record();
        device.apply(&DeviceUpdate {
            credential: Some(Credential::new("root", "secret")),
            scrape_strategy: Some("json".into()),
            ..DeviceUpdate::default()
        });
        device.apply(&DeviceUpdate::failures(3));

        assert_eq!(device.failures, 3);
        assert_eq!(device.credential(), Some(Credential::new("root", "secret")));
        assert_eq!(device.scrape_strategy.as_deref(), Some("json"));
        assert!(device.auth_strategy.is_none());
    }

    #[test]
    fn test_session_update_sets_token_and_strategy_together() {
        let mut device = record();
        device.apply(&DeviceUpdate::session("a", Some("t1".into()), 10));
        device.apply(&DeviceUpdate::session("b", None, 0));
        assert_eq!(device.auth_strategy.as_deref(), Some("b"));
        assert!(device.session_token.is_none());
    }

    #[test]
    fn test_record_json_roundtrip() {
        let device = record();
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"id\":\"AA:BB:CC:DD:EE:FF\""));
        let back: DeviceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, device);
    }
}
