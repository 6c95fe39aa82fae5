//! GRBL Protocol Utilities
//!
//! Response classification, version parsing, version dependent
//! capabilities and the commands whose syntax changed between GRBL
//! releases.

use cncstream_core::{Capabilities, Capability, Override, PartialPosition};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Soft reset
pub const GRBL_RESET_COMMAND: u8 = 0x18;
/// Status report request
pub const GRBL_STATUS_COMMAND: u8 = b'?';
/// Feed hold
pub const GRBL_PAUSE_COMMAND: u8 = b'!';
/// Cycle start / resume
pub const GRBL_RESUME_COMMAND: u8 = b'~';
/// Cancel the current jog (1.1)
pub const GRBL_JOG_CANCEL_COMMAND: u8 = 0x85;
/// Receive buffer of a stock GRBL build, less a little headroom
pub const GRBL_RX_BUFFER_SIZE: usize = 123;

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Grbl\s+(\d+)\.(\d+)([a-zA-Z])?").expect("invalid regex pattern")
    })
}

fn setting_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$(\d+)\s*=\s*([^\s(]*)").expect("invalid regex pattern"))
}

fn coordinate_write_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\$\d+=|^\$N|^\$RST=|G28\.1|G30\.1|G10.*L0*20?(\D|$)")
            .expect("invalid regex pattern")
    })
}

/// Firmware version from the GRBL welcome line, e.g. `1.1f`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GrblVersion {
    pub major: u32,
    pub minor: u32,
    pub letter: Option<char>,
}

impl GrblVersion {
    pub fn new(major: u32, minor: u32, letter: Option<char>) -> Self {
        Self {
            major,
            minor,
            letter,
        }
    }

    /// Parse `Grbl 1.1f ['$' for help]`
    pub fn parse(line: &str) -> Option<Self> {
        let caps = version_regex().captures(line.trim())?;
        Some(Self {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            letter: caps.get(3).and_then(|m| m.as_str().chars().next()),
        })
    }

    fn number(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    /// At least the given major.minor
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        self.number() >= (major, minor)
    }

    /// 0.8c exactly
    pub fn is_0_8c(&self) -> bool {
        self.number() == (0, 8) && self.letter.is_some_and(|l| l.to_ascii_lowercase() >= 'c')
    }

    /// `$H`, `$X`, `$C` and `$G` exist from 0.8c on
    pub fn has_system_commands(&self) -> bool {
        self.is_0_8c() || self.at_least(0, 9)
    }

    /// Status reports in the pipe delimited 1.1 format
    pub fn is_v1_format(&self) -> bool {
        self.at_least(1, 1)
    }
}

impl fmt::Display for GrblVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if let Some(letter) = self.letter {
            write!(f, "{}", letter)?;
        }
        Ok(())
    }
}

/// Capabilities implied by a GRBL version
pub fn capabilities_for(version: &GrblVersion) -> Capabilities {
    let mut caps = Capabilities::from_slice(&[
        Capability::Jogging,
        Capability::CheckMode,
        Capability::FirmwareSettings,
        Capability::XAxis,
        Capability::YAxis,
        Capability::ZAxis,
    ]);
    if version.at_least(0, 8) {
        caps.add(Capability::Homing);
        caps.add(Capability::HardLimits);
    }
    if version.is_0_8c() {
        caps.add(Capability::RealTime);
    }
    if version.at_least(0, 9) {
        caps.add(Capability::RealTime);
        caps.add(Capability::SoftLimits);
        caps.add(Capability::SetupWizard);
    }
    if version.is_v1_format() {
        caps.add(Capability::V1Format);
        caps.add(Capability::HardwareJogging);
        caps.add(Capability::Overrides);
        caps.add(Capability::ContinuousJogging);
    }
    caps
}

pub fn is_ok_response(line: &str) -> bool {
    line.trim() == "ok"
}

pub fn is_error_response(line: &str) -> bool {
    line.trim_start().starts_with("error")
}

pub fn is_alarm_response(line: &str) -> bool {
    line.trim_start().to_ascii_uppercase().starts_with("ALARM")
}

pub fn is_version_string(line: &str) -> bool {
    GrblVersion::parse(line).is_some()
}

pub fn is_status_string(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('<') && line.ends_with('>')
}

pub fn is_feedback_message(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('[') && line.ends_with(']')
}

pub fn is_probe_message(line: &str) -> bool {
    line.trim_start().starts_with("[PRB:")
}

/// `$13=0 (report inches, bool)` gives `("$13", "0")`
pub fn parse_setting_line(line: &str) -> Option<(String, String)> {
    let caps = setting_regex().captures(line.trim())?;
    Some((format!("${}", &caps[1]), caps[2].to_string()))
}

/// Parser state carried by a feedback message.
///
/// 1.1 reports `[GC:G0 G54 ...]`; older versions send the bare `[G0 G54 ...]`.
pub fn parse_feedback_modal_state<'a>(line: &'a str, v1_format: bool) -> Option<&'a str> {
    let inner = line.trim().strip_prefix('[')?.strip_suffix(']')?;
    if v1_format {
        inner.strip_prefix("GC:")
    } else if inner.starts_with('G') {
        Some(inner)
    } else {
        None
    }
}

/// Commands that write to persistent memory and must be sent alone
pub fn is_exclusive_command(text: &str) -> bool {
    coordinate_write_regex().is_match(text.trim())
}

/// Homing command for the version, if it has one
pub fn homing_command(version: &GrblVersion) -> Option<&'static str> {
    if version.has_system_commands() {
        Some("$H")
    } else if version.at_least(0, 8) {
        Some("G28 X0 Y0 Z0")
    } else {
        None
    }
}

/// Command setting the work position of the given axes
pub fn set_work_position_command(
    version: &GrblVersion,
    position: &PartialPosition,
) -> Option<String> {
    if version.at_least(0, 9) {
        Some(format!("G10 P0 L20 {}", position.format_gcode()))
    } else if version.is_0_8c() {
        Some(format!("G92 {}", position.format_gcode()))
    } else {
        None
    }
}

/// Command zeroing the work position on X, Y and Z
pub fn reset_coordinates_command(version: &GrblVersion) -> Option<&'static str> {
    if version.at_least(0, 9) {
        Some("G10 P0 L20 X0 Y0 Z0")
    } else if version.is_0_8c() {
        Some("G92 X0 Y0 Z0")
    } else {
        None
    }
}

/// Real-time byte of a 1.1 override
pub fn override_byte(command: Override) -> u8 {
    match command {
        Override::FeedReset => 0x90,
        Override::FeedCoarsePlus => 0x91,
        Override::FeedCoarseMinus => 0x92,
        Override::FeedFinePlus => 0x93,
        Override::FeedFineMinus => 0x94,
        Override::RapidReset => 0x95,
        Override::RapidMedium => 0x96,
        Override::RapidLow => 0x97,
        Override::SpindleReset => 0x99,
        Override::SpindleCoarsePlus => 0x9A,
        Override::SpindleCoarseMinus => 0x9B,
        Override::SpindleFinePlus => 0x9C,
        Override::SpindleFineMinus => 0x9D,
        Override::ToggleSpindle => 0x9E,
        Override::ToggleFloodCoolant => 0xA0,
        Override::ToggleMistCoolant => 0xA1,
    }
}
