//! GRBL firmware support
//!
//! Covers GRBL 0.7 through 1.1 and the GrblESP32 port. Behavior that
//! depends on the firmware version is keyed off the welcome line the
//! firmware prints after every reset.

pub mod controller;
pub mod error_decoder;
pub mod settings;
pub mod status_parser;
pub mod utils;

pub use controller::GrblDialect;
pub use error_decoder::{decode_alarm, decode_error};
pub use settings::GrblSettings;
pub use utils::GrblVersion;
