//! Console message levels

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a console message shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageLevel {
    /// Chatty protocol traffic such as status reports
    Verbose,
    /// Normal operator information
    Info,
    /// Something went wrong
    Error,
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verbose => write!(f, "VERBOSE"),
            Self::Info => write!(f, "INFO"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}
