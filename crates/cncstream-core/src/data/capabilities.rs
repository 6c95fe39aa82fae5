//! Controller capabilities
//!
//! A capability set is built once per connection from the firmware family's
//! base set plus anything learned while the firmware boots.

use super::Axis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capability flags for controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Relative jogging with ordinary G-code
    Jogging,
    /// Continuous jogging that can be cancelled mid-move
    ContinuousJogging,
    /// A dedicated jog command (`$J=` on GRBL 1.1)
    HardwareJogging,
    /// Homing cycle
    Homing,
    /// Hard limit switches
    HardLimits,
    /// Soft limits
    SoftLimits,
    /// Feed/rapid/spindle override commands
    Overrides,
    /// Real-time single byte commands
    RealTime,
    /// `|` separated status reports
    V1Format,
    /// Check (dry run) mode
    CheckMode,
    /// Firmware settings can be read and written
    FirmwareSettings,
    /// Setup wizard support
    SetupWizard,
    /// Return to work zero
    ReturnToZero,
    /// X axis present
    XAxis,
    /// Y axis present
    YAxis,
    /// Z axis present
    ZAxis,
    /// A axis present
    AAxis,
    /// B axis present
    BAxis,
    /// C axis present
    CAxis,
}

impl Capability {
    /// The presence capability for an axis
    pub fn for_axis(axis: Axis) -> Capability {
        match axis {
            Axis::X => Capability::XAxis,
            Axis::Y => Capability::YAxis,
            Axis::Z => Capability::ZAxis,
            Axis::A => Capability::AAxis,
            Axis::B => Capability::BAxis,
            Axis::C => Capability::CAxis,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jogging => write!(f, "Jogging"),
            Self::ContinuousJogging => write!(f, "Continuous Jogging"),
            Self::HardwareJogging => write!(f, "Hardware Jogging"),
            Self::Homing => write!(f, "Homing"),
            Self::HardLimits => write!(f, "Hard Limits"),
            Self::SoftLimits => write!(f, "Soft Limits"),
            Self::Overrides => write!(f, "Overrides"),
            Self::RealTime => write!(f, "Real Time"),
            Self::V1Format => write!(f, "V1 Format"),
            Self::CheckMode => write!(f, "Check Mode"),
            Self::FirmwareSettings => write!(f, "Firmware Settings"),
            Self::SetupWizard => write!(f, "Setup Wizard"),
            Self::ReturnToZero => write!(f, "Return To Zero"),
            Self::XAxis => write!(f, "X Axis"),
            Self::YAxis => write!(f, "Y Axis"),
            Self::ZAxis => write!(f, "Z Axis"),
            Self::AAxis => write!(f, "A Axis"),
            Self::BAxis => write!(f, "B Axis"),
            Self::CAxis => write!(f, "C Axis"),
        }
    }
}

/// A set of capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    set: BTreeSet<Capability>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of capabilities
    pub fn from_slice(capabilities: &[Capability]) -> Self {
        Self {
            set: capabilities.iter().copied().collect(),
        }
    }

    pub fn add(&mut self, capability: Capability) {
        self.set.insert(capability);
    }

    pub fn remove(&mut self, capability: Capability) {
        self.set.remove(&capability);
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.set.contains(&capability)
    }

    /// Add every capability from `other`
    pub fn merge(&mut self, other: &Capabilities) {
        self.set.extend(other.set.iter().copied());
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.set.iter().copied()
    }

    /// Axes that are present, in wire order
    pub fn axes(&self) -> Vec<Axis> {
        Axis::ALL
            .iter()
            .copied()
            .filter(|axis| self.has(Capability::for_axis(*axis)))
            .collect()
    }

    pub fn has_jogging(&self) -> bool {
        self.has(Capability::Jogging)
    }

    pub fn has_overrides(&self) -> bool {
        self.has(Capability::Overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_merge() {
        let mut caps = Capabilities::from_slice(&[Capability::Jogging, Capability::XAxis]);
        assert!(caps.has_jogging());
        caps.remove(Capability::Jogging);
        assert!(!caps.has_jogging());

        let extra = Capabilities::from_slice(&[Capability::AAxis, Capability::Overrides]);
        caps.merge(&extra);
        assert!(caps.has_overrides());
        assert_eq!(caps.axes(), vec![Axis::X, Axis::A]);
    }
}
