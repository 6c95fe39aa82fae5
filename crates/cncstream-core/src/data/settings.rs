//! Firmware settings as reported by the controller
//!
//! Settings live on the device. The store here is only the last known copy,
//! refreshed from setting lines as they arrive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One persisted firmware configuration entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareSetting {
    /// Setting key, e.g. `$13`
    pub key: String,
    /// Current value as sent by the firmware
    pub value: String,
    /// Unit of the value, empty if none
    pub units: String,
    /// Long description
    pub description: String,
    /// Short name
    pub short_description: String,
}

impl FirmwareSetting {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            units: String::new(),
            description: String::new(),
            short_description: String::new(),
        }
    }

    /// Attach descriptive metadata
    pub fn with_description(
        mut self,
        short_description: impl Into<String>,
        description: impl Into<String>,
        units: impl Into<String>,
    ) -> Self {
        self.short_description = short_description.into();
        self.description = description.into();
        self.units = units.into();
        self
    }

    /// Numeric value, if the value parses as a number
    pub fn as_f64(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }

    /// Integer value, if the value parses as an integer
    pub fn as_i64(&self) -> Option<i64> {
        self.value.trim().parse().ok()
    }

    /// Boolean value; `1`/`true` are true, `0`/`false` are false
    pub fn as_bool(&self) -> Option<bool> {
        match self.value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }
}

/// Last known firmware settings, keyed by setting key
#[derive(Debug, Clone, Default)]
pub struct FirmwareSettingsStore {
    settings: BTreeMap<String, FirmwareSetting>,
}

impl FirmwareSettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a setting. Returns true when the stored value changed.
    pub fn update(&mut self, setting: FirmwareSetting) -> bool {
        match self.settings.get(&setting.key) {
            Some(existing) if *existing == setting => false,
            _ => {
                self.settings.insert(setting.key.clone(), setting);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&FirmwareSetting> {
        self.settings.get(key)
    }

    pub fn all(&self) -> Vec<FirmwareSetting> {
        self.settings.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    pub fn clear(&mut self) {
        self.settings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_reports_changes() {
        let mut store = FirmwareSettingsStore::new();
        assert!(store.update(FirmwareSetting::new("$13", "0")));
        assert!(!store.update(FirmwareSetting::new("$13", "0")));
        assert!(store.update(FirmwareSetting::new("$13", "1")));
        assert_eq!(store.get("$13").and_then(|s| s.as_bool()), Some(true));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_typed_values() {
        let s = FirmwareSetting::new("$100", "250.000");
        assert_eq!(s.as_f64(), Some(250.0));
        assert_eq!(s.as_i64(), None);
        assert_eq!(FirmwareSetting::new("$3", "5").as_i64(), Some(5));
        assert_eq!(FirmwareSetting::new("$3", "x").as_bool(), None);
    }
}
