//! Device types for tracking people, registered hardware and scan results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a string is not a usable hardware id
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareIdError {
    #[error("hardware id is empty")]
    Empty,
    #[error("'{0}' is not a hardware id (expected six hex octets, e.g. aa:bb:cc:dd:ee:ff)")]
    Malformed(String),
}

/// Link-layer address used as the device join key.
///
/// Always held in normalized form: lowercase, colon-separated octets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct HardwareId(String);

impl HardwareId {
    /// Normalize a raw hardware id string.
    ///
    /// Accepts `aa:bb:cc:dd:ee:ff`, `AA-BB-CC-DD-EE-FF`, `aabb.ccdd.eeff` and
    /// bare hex. Values that do not contain exactly twelve hex digits are only
    /// trimmed and lowercased. Idempotent.
    pub fn normalize(raw: &str) -> String {
        let trimmed = raw.trim();
        let digits: String = trimmed
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();

        if digits.len() == 12 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
            let lower = digits.to_ascii_lowercase();
            let octets: Vec<&str> = (0..6).map(|i| &lower[i * 2..i * 2 + 2]).collect();
            octets.join(":")
        } else {
            trimmed.to_lowercase()
        }
    }

    /// Parse and validate a hardware id typed by a person
    pub fn parse(raw: &str) -> Result<Self, HardwareIdError> {
        if raw.trim().is_empty() {
            return Err(HardwareIdError::Empty);
        }
        let normalized = Self::normalize(raw);
        if is_octet_form(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(HardwareIdError::Malformed(raw.trim().to_string()))
        }
    }

    /// Build a hardware id from whatever a scan backend reported.
    ///
    /// Never fails: detections are recorded even when the backend reports
    /// an unusual address format.
    pub fn from_detection(raw: &str) -> Self {
        Self(Self::normalize(raw))
    }

    /// True if this id has the canonical six-octet form
    pub fn is_canonical(&self) -> bool {
        is_octet_form(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_octet_form(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

impl From<String> for HardwareId {
    fn from(raw: String) -> Self {
        Self::from_detection(&raw)
    }
}

impl From<HardwareId> for String {
    fn from(id: HardwareId) -> Self {
        id.0
    }
}

impl std::fmt::Display for HardwareId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for HardwareId {
    type Err = HardwareIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A human owner of devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: u64,
    pub name: String,
}

/// A registered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Store-assigned identifier
    pub id: u64,
    /// Unique hardware id (join key against scan results)
    pub hardware_id: HardwareId,
    /// Human-readable name
    pub name: Option<String>,
    /// Owning person id
    pub owner: Option<u64>,
}

impl Device {
    /// Name for display, falling back to the hardware id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.hardware_id.as_str())
    }
}

/// Device fields supplied when registering or updating
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDevice {
    pub hardware_id: HardwareId,
    pub name: Option<String>,
    pub owner: Option<u64>,
}

/// One scan-cycle observation as reported by a scan backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    /// Raw hardware id, not yet normalized
    pub hardware_id: String,
    /// Network (IP) address the device answered from
    pub network_address: String,
}

impl Detection {
    pub fn new(hardware_id: impl Into<String>, network_address: impl Into<String>) -> Self {
        Self {
            hardware_id: hardware_id.into(),
            network_address: network_address.into(),
        }
    }
}

/// Persisted record of one detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub timestamp: DateTime<Utc>,
    pub hardware_id: HardwareId,
    pub network_address: String,
    /// Device resolved from the registry at scan time
    pub device: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_dash_and_colon_forms_match() {
        assert_eq!(
            HardwareId::normalize("AA-BB-CC-DD-EE-FF"),
            HardwareId::normalize("aa:bb:cc:dd:ee:ff")
        );
        assert_eq!(HardwareId::normalize("AA-BB-CC-DD-EE-FF"), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in [
            "AA-BB-CC-DD-EE-FF",
            "aabb.ccdd.eeff",
            "AABBCCDDEEFF",
            " 0A:1b:2C:3d:4E:5f ",
            "not-a-mac",
            "",
        ] {
            let once = HardwareId::normalize(raw);
            assert_eq!(HardwareId::normalize(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn test_normalize_other_forms() {
        assert_eq!(HardwareId::normalize("aabb.ccdd.eeff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(HardwareId::normalize("AABBCCDDEEFF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(HardwareId::normalize(" Weird "), "weird");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(HardwareId::parse("  "), Err(HardwareIdError::Empty));
        assert!(matches!(
            HardwareId::parse("aa:bb:cc"),
            Err(HardwareIdError::Malformed(_))
        ));
        assert!(matches!(
            HardwareId::parse("gg:bb:cc:dd:ee:ff"),
            Err(HardwareIdError::Malformed(_))
        ));
        let id = HardwareId::parse("AA-BB-CC-DD-EE-FF").unwrap();
        assert_eq!(id.as_str(), "aa:bb:cc:dd:ee:ff");
        assert!(id.is_canonical());
    }

    #[test]
    fn test_from_detection_keeps_odd_values() {
        let id = HardwareId::from_detection("INCOMPLETE");
        assert_eq!(id.as_str(), "incomplete");
        assert!(!id.is_canonical());
    }

    #[test]
    fn test_serde_normalizes_on_read() {
        let id: HardwareId = serde_json::from_str("\"AA-BB-CC-DD-EE-FF\"").unwrap();
        assert_eq!(id.as_str(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"aa:bb:cc:dd:ee:ff\"");
    }

    #[test]
    fn test_device_display_name() {
        let mut device = Device {
            id: 1,
            hardware_id: HardwareId::from_detection("aa:bb:cc:dd:ee:ff"),
            name: None,
            owner: None,
        };
        assert_eq!(device.display_name(), "aa:bb:cc:dd:ee:ff");
        device.name = Some("Laptop".to_string());
        assert_eq!(device.display_name(), "Laptop");
    }
}
