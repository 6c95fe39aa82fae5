//! Parser modal state tracking
//!
//! Follows the distance mode, units and work coordinate system the firmware
//! is in, as implied by the commands sent to it and by parser-state reports
//! such as GRBL's `[GC:...]`. Jog helpers switch these temporarily and use
//! the tracked values to switch them back.

use cncstream_core::Units;
use regex::Regex;
use std::sync::OnceLock;

fn g_word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)G\s*0*(\d+(?:\.\d+)?)").expect("invalid regex pattern"))
}

/// Absolute or incremental distance mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMode {
    /// `G90`
    Absolute,
    /// `G91`
    Incremental,
}

impl DistanceMode {
    pub fn gcode(&self) -> &'static str {
        match self {
            DistanceMode::Absolute => "G90",
            DistanceMode::Incremental => "G91",
        }
    }
}

/// Last known parser modal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModalState {
    pub distance: Option<DistanceMode>,
    pub units: Option<Units>,
    /// Active work coordinate system, 54 through 59
    pub coordinate_system: Option<u8>,
}

impl ModalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the modal G words of a command or parser-state line
    pub fn update(&mut self, text: &str) {
        for caps in g_word_regex().captures_iter(text) {
            match &caps[1] {
                "90" => self.distance = Some(DistanceMode::Absolute),
                "91" => self.distance = Some(DistanceMode::Incremental),
                "20" => self.units = Some(Units::INCH),
                "21" => self.units = Some(Units::MM),
                code @ ("54" | "55" | "56" | "57" | "58" | "59") => {
                    self.coordinate_system = code.parse().ok();
                }
                _ => {}
            }
        }
    }

    /// Units in effect, millimeters until told otherwise
    pub fn units(&self) -> Units {
        self.units.unwrap_or(Units::MM)
    }

    /// `P` word of the active coordinate system, 1 for G54
    pub fn coordinate_index(&self) -> u8 {
        self.coordinate_system.map(|g| g - 53).unwrap_or(1)
    }

    /// Command that puts the parser back in the tracked distance mode and
    /// units, if either is known
    pub fn restore_command(&self) -> Option<String> {
        let words: Vec<&str> = [
            self.distance.map(|d| d.gcode()),
            self.units.and_then(|u| u.gcode()),
        ]
        .into_iter()
        .flatten()
        .collect();
        if words.is_empty() {
            None
        } else {
            Some(words.join(" "))
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_from_commands() {
        let mut modal = ModalState::new();
        assert_eq!(modal.restore_command(), None);

        modal.update("G91 G0 X10");
        assert_eq!(modal.distance, Some(DistanceMode::Incremental));
        modal.update("g20");
        assert_eq!(modal.units(), Units::INCH);
        modal.update("G90.1");
        assert_eq!(modal.distance, Some(DistanceMode::Incremental));
        assert_eq!(modal.restore_command().as_deref(), Some("G91 G20"));
    }

    #[test]
    fn test_update_from_parser_state() {
        let mut modal = ModalState::new();
        modal.update("G0 G55 G17 G21 G90 G94 M5 M9 T0 F0 S0");
        assert_eq!(modal.coordinate_system, Some(55));
        assert_eq!(modal.coordinate_index(), 2);
        assert_eq!(modal.restore_command().as_deref(), Some("G90 G21"));
    }
}
