//! GRBL settings
//!
//! Descriptions for the numbered `$n` settings and typed accessors for the
//! ones the engine relies on. Values are read from the settings store the
//! controller fills from `$$` output.

use cncstream_core::{Axis, FirmwareSetting, FirmwareSettingsStore, Units};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Reporting units: 0 = mm, 1 = inch
pub const REPORT_INCHES: &str = "$13";
pub const SOFT_LIMITS: &str = "$20";
pub const HARD_LIMITS: &str = "$21";
pub const HOMING_CYCLE: &str = "$22";
/// Direction invert mask
pub const DIRECTION_INVERT: &str = "$3";

/// (key, short name, unit)
const SETTING_DESCRIPTIONS: &[(&str, &str, &str)] = &[
    ("$0", "Step pulse time", "microseconds"),
    ("$1", "Step idle delay", "milliseconds"),
    ("$2", "Step pulse invert", "mask"),
    ("$3", "Step direction invert", "mask"),
    ("$4", "Invert step enable pin", "boolean"),
    ("$5", "Invert limit pins", "boolean"),
    ("$6", "Invert probe pin", "boolean"),
    ("$10", "Status report options", "mask"),
    ("$11", "Junction deviation", "millimeters"),
    ("$12", "Arc tolerance", "millimeters"),
    ("$13", "Report in inches", "boolean"),
    ("$20", "Soft limits enable", "boolean"),
    ("$21", "Hard limits enable", "boolean"),
    ("$22", "Homing cycle enable", "boolean"),
    ("$23", "Homing direction invert", "mask"),
    ("$24", "Homing locate feed rate", "mm/min"),
    ("$25", "Homing search seek rate", "mm/min"),
    ("$26", "Homing switch debounce delay", "milliseconds"),
    ("$27", "Homing switch pull-off distance", "millimeters"),
    ("$30", "Maximum spindle speed", "RPM"),
    ("$31", "Minimum spindle speed", "RPM"),
    ("$32", "Laser-mode enable", "boolean"),
    ("$100", "X-axis travel resolution", "step/mm"),
    ("$101", "Y-axis travel resolution", "step/mm"),
    ("$102", "Z-axis travel resolution", "step/mm"),
    ("$110", "X-axis maximum rate", "mm/min"),
    ("$111", "Y-axis maximum rate", "mm/min"),
    ("$112", "Z-axis maximum rate", "mm/min"),
    ("$120", "X-axis acceleration", "mm/sec^2"),
    ("$121", "Y-axis acceleration", "mm/sec^2"),
    ("$122", "Z-axis acceleration", "mm/sec^2"),
    ("$130", "X-axis maximum travel", "millimeters"),
    ("$131", "Y-axis maximum travel", "millimeters"),
    ("$132", "Z-axis maximum travel", "millimeters"),
];

fn description_table() -> &'static HashMap<&'static str, (&'static str, &'static str)> {
    static TABLE: OnceLock<HashMap<&'static str, (&'static str, &'static str)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        SETTING_DESCRIPTIONS
            .iter()
            .map(|(key, name, unit)| (*key, (*name, *unit)))
            .collect()
    })
}

/// Build a setting with its description attached when known
pub fn describe_setting(key: &str, value: &str) -> FirmwareSetting {
    let setting = FirmwareSetting::new(key, value);
    match description_table().get(key) {
        Some((name, unit)) => setting.with_description(*name, *name, *unit),
        None => setting,
    }
}

/// Assignment command for a setting
pub fn setting_command(key: &str, value: &str) -> String {
    let key = key.trim();
    if key.starts_with('$') {
        format!("{}={}", key, value.trim())
    } else {
        format!("${}={}", key, value.trim())
    }
}

/// Key of an axis setting in the `base` group (100, 110, 130)
fn axis_key(base: u32, axis: Axis) -> Option<String> {
    let offset = match axis {
        Axis::X => 0,
        Axis::Y => 1,
        Axis::Z => 2,
        _ => return None,
    };
    Some(format!("${}", base + offset))
}

/// Typed view of GRBL settings
pub struct GrblSettings<'a> {
    store: &'a FirmwareSettingsStore,
}

impl<'a> GrblSettings<'a> {
    pub fn new(store: &'a FirmwareSettingsStore) -> Self {
        Self { store }
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.store.get(key).and_then(|s| s.as_bool())
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.store.get(key).and_then(|s| s.as_f64())
    }

    /// Units positions are reported in, millimeters unless `$13=1`
    pub fn reporting_units(&self) -> Units {
        match self.flag(REPORT_INCHES) {
            Some(true) => Units::INCH,
            _ => Units::MM,
        }
    }

    pub fn soft_limits_enabled(&self) -> Option<bool> {
        self.flag(SOFT_LIMITS)
    }

    pub fn hard_limits_enabled(&self) -> Option<bool> {
        self.flag(HARD_LIMITS)
    }

    pub fn homing_enabled(&self) -> Option<bool> {
        self.flag(HOMING_CYCLE)
    }

    /// Steps per millimeter ($100-$102)
    pub fn steps_per_mm(&self, axis: Axis) -> Option<f64> {
        self.number(&axis_key(100, axis)?)
    }

    /// Maximum rate in mm/min ($110-$112)
    pub fn max_rate(&self, axis: Axis) -> Option<f64> {
        self.number(&axis_key(110, axis)?)
    }

    /// Maximum travel in mm ($130-$132)
    pub fn max_travel(&self, axis: Axis) -> Option<f64> {
        self.number(&axis_key(130, axis)?)
    }

    /// Direction of the axis is inverted ($3 mask, bit 0 = X)
    pub fn direction_inverted(&self, axis: Axis) -> Option<bool> {
        let bit = match axis {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            _ => return None,
        };
        let mask = self.store.get(DIRECTION_INVERT)?.as_i64()?;
        Some(mask & (1 << bit) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(values: &[(&str, &str)]) -> FirmwareSettingsStore {
        let mut store = FirmwareSettingsStore::new();
        for (key, value) in values {
            store.update(describe_setting(key, value));
        }
        store
    }

    #[test]
    fn test_describe_setting() {
        let s = describe_setting("$110", "500.000");
        assert_eq!(s.short_description, "X-axis maximum rate");
        assert_eq!(s.units, "mm/min");
        let s = describe_setting("$999", "1");
        assert!(s.description.is_empty());
    }

    #[test]
    fn test_setting_command() {
        assert_eq!(setting_command("$13", "1"), "$13=1");
        assert_eq!(setting_command("110", " 750 "), "$110=750");
    }

    #[test]
    fn test_typed_accessors() {
        let store = store(&[
            ("$13", "1"),
            ("$20", "0"),
            ("$22", "1"),
            ("$3", "5"),
            ("$101", "80.000"),
            ("$112", "500.000"),
            ("$130", "200.000"),
        ]);
        let grbl = GrblSettings::new(&store);
        assert_eq!(grbl.reporting_units(), Units::INCH);
        assert_eq!(grbl.soft_limits_enabled(), Some(false));
        assert_eq!(grbl.hard_limits_enabled(), None);
        assert_eq!(grbl.homing_enabled(), Some(true));
        assert_eq!(grbl.steps_per_mm(Axis::Y), Some(80.0));
        assert_eq!(grbl.max_rate(Axis::Z), Some(500.0));
        assert_eq!(grbl.max_travel(Axis::X), Some(200.0));
        assert_eq!(grbl.steps_per_mm(Axis::A), None);
        assert_eq!(grbl.direction_inverted(Axis::X), Some(true));
        assert_eq!(grbl.direction_inverted(Axis::Y), Some(false));
        assert_eq!(grbl.direction_inverted(Axis::Z), Some(true));
    }

    #[test]
    fn test_default_units() {
        let store = FirmwareSettingsStore::new();
        assert_eq!(GrblSettings::new(&store).reporting_units(), Units::MM);
    }
}
