//! Feed, rapid and spindle override requests

use serde::{Deserialize, Serialize};
use std::fmt;

/// An override adjustment requested by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Override {
    FeedReset,
    FeedCoarsePlus,
    FeedCoarseMinus,
    FeedFinePlus,
    FeedFineMinus,
    RapidReset,
    RapidMedium,
    RapidLow,
    SpindleReset,
    SpindleCoarsePlus,
    SpindleCoarseMinus,
    SpindleFinePlus,
    SpindleFineMinus,
    ToggleSpindle,
    ToggleFloodCoolant,
    ToggleMistCoolant,
}

impl fmt::Display for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Override::FeedReset => "feed reset",
            Override::FeedCoarsePlus => "feed +10%",
            Override::FeedCoarseMinus => "feed -10%",
            Override::FeedFinePlus => "feed +1%",
            Override::FeedFineMinus => "feed -1%",
            Override::RapidReset => "rapid 100%",
            Override::RapidMedium => "rapid 50%",
            Override::RapidLow => "rapid 25%",
            Override::SpindleReset => "spindle reset",
            Override::SpindleCoarsePlus => "spindle +10%",
            Override::SpindleCoarseMinus => "spindle -10%",
            Override::SpindleFinePlus => "spindle +1%",
            Override::SpindleFineMinus => "spindle -1%",
            Override::ToggleSpindle => "toggle spindle",
            Override::ToggleFloodCoolant => "toggle flood coolant",
            Override::ToggleMistCoolant => "toggle mist coolant",
        };
        write!(f, "{}", name)
    }
}
