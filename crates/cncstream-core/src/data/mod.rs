//! Data models for positions, status, and machine information
//!
//! This module provides:
//! - Position tracking with full 6-axis support (X, Y, Z, A, B, C)
//! - Partial position updates for selective axis changes
//! - Machine state and control state enums
//! - The controller status snapshot built by the status parsers
//! - Commands, capabilities and firmware settings

pub mod capabilities;
pub mod command;
pub mod overrides;
pub mod settings;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine coordinate units (millimeters or inches)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Units {
    /// Millimeters (metric)
    MM,
    /// Inches (imperial)
    INCH,
    /// Unknown or uninitialized
    Unknown,
}

impl Units {
    /// Convert a value from one unit to another
    ///
    /// Returns the original value if units are the same or unknown.
    pub fn convert(value: f64, from: Units, to: Units) -> f64 {
        if from == to {
            return value;
        }

        match (from, to) {
            (Units::MM, Units::INCH) => value / 25.4,
            (Units::INCH, Units::MM) => value * 25.4,
            _ => value,
        }
    }

    /// The G-code that selects these units, if any.
    pub fn gcode(&self) -> Option<&'static str> {
        match self {
            Units::MM => Some("G21"),
            Units::INCH => Some("G20"),
            Units::Unknown => None,
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::MM => write!(f, "mm"),
            Units::INCH => write!(f, "in"),
            Units::Unknown => write!(f, "unknown"),
        }
    }
}

/// Machine axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
    A,
    B,
    C,
}

impl Axis {
    /// All axes in wire order.
    pub const ALL: [Axis; 6] = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B, Axis::C];

    /// Parse an axis letter, case insensitive.
    pub fn from_char(c: char) -> Option<Axis> {
        match c.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            'A' => Some(Axis::A),
            'B' => Some(Axis::B),
            'C' => Some(Axis::C),
            _ => None,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
            Axis::A => "A",
            Axis::B => "B",
            Axis::C => "C",
        };
        write!(f, "{}", letter)
    }
}

/// Format a coordinate the way the firmware command synthesizers expect:
/// fixed four decimal places.
pub fn format_coordinate(value: f64) -> String {
    let formatted = format!("{:.4}", value);
    if formatted == "-0.0000" {
        "0.0000".to_string()
    } else {
        formatted
    }
}

/// A 6-axis coordinate with its units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
    /// A-axis (rotary around X) position
    pub a: f64,
    /// B-axis (rotary around Y) position
    pub b: f64,
    /// C-axis (rotary around Z) position
    pub c: f64,
    /// Units of the coordinates
    pub units: Units,
}

impl Position {
    /// Create a new XYZ position
    pub fn new(x: f64, y: f64, z: f64, units: Units) -> Self {
        Self {
            x,
            y,
            z,
            a: 0.0,
            b: 0.0,
            c: 0.0,
            units,
        }
    }

    /// The origin in the given units
    pub fn zero(units: Units) -> Self {
        Self::new(0.0, 0.0, 0.0, units)
    }

    /// Build a position from up to six axis values in X, Y, Z, A, B, C order.
    pub fn from_values(values: &[f64], units: Units) -> Self {
        let mut pos = Self::zero(units);
        for (axis, value) in Axis::ALL.iter().zip(values) {
            pos.set(*axis, *value);
        }
        pos
    }

    /// Value of a single axis
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::A => self.a,
            Axis::B => self.b,
            Axis::C => self.c,
        }
    }

    /// Set a single axis
    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::A => self.a = value,
            Axis::B => self.b = value,
            Axis::C => self.c = value,
        }
    }

    /// Add another position axis by axis
    pub fn add(&self, other: &Position) -> Self {
        let mut out = *self;
        for axis in Axis::ALL {
            out.set(axis, self.get(axis) + other.get(axis));
        }
        out
    }

    /// Subtract another position axis by axis
    pub fn subtract(&self, other: &Position) -> Self {
        let mut out = *self;
        for axis in Axis::ALL {
            out.set(axis, self.get(axis) - other.get(axis));
        }
        out
    }

    /// Convert linear axes to the target units. Rotary axes are unchanged.
    pub fn convert_to(&self, target: Units) -> Self {
        if self.units == target || self.units == Units::Unknown || target == Units::Unknown {
            return *self;
        }
        Self {
            x: Units::convert(self.x, self.units, target),
            y: Units::convert(self.y, self.units, target),
            z: Units::convert(self.z, self.units, target),
            a: self.a,
            b: self.b,
            c: self.c,
            units: target,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::zero(Units::MM)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X:{:.3} Y:{:.3} Z:{:.3} ({})",
            self.x, self.y, self.z, self.units
        )
    }
}

/// Partial position for updating only specific axes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialPosition {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub a: Option<f64>,
    pub b: Option<f64>,
    pub c: Option<f64>,
    pub units: Units,
}

impl PartialPosition {
    /// Create an empty partial position
    pub fn new(units: Units) -> Self {
        Self {
            x: None,
            y: None,
            z: None,
            a: None,
            b: None,
            c: None,
            units,
        }
    }

    /// Partial position with a single axis set
    pub fn axis(axis: Axis, value: f64, units: Units) -> Self {
        Self::new(units).with(axis, value)
    }

    /// X, Y and Z set
    pub fn xyz(x: f64, y: f64, z: f64, units: Units) -> Self {
        Self::new(units)
            .with(Axis::X, x)
            .with(Axis::Y, y)
            .with(Axis::Z, z)
    }

    /// Builder: set one axis
    pub fn with(mut self, axis: Axis, value: f64) -> Self {
        let slot = match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
            Axis::A => &mut self.a,
            Axis::B => &mut self.b,
            Axis::C => &mut self.c,
        };
        *slot = Some(value);
        self
    }

    /// Value of one axis, if set
    pub fn get(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::A => self.a,
            Axis::B => self.b,
            Axis::C => self.c,
        }
    }

    /// Iterate the axes that are set
    pub fn axes(&self) -> impl Iterator<Item = (Axis, f64)> + '_ {
        Axis::ALL
            .iter()
            .filter_map(move |axis| self.get(*axis).map(|v| (*axis, v)))
    }

    /// Number of axes that are set
    pub fn axis_count(&self) -> usize {
        self.axes().count()
    }

    /// Check if no axes are set
    pub fn is_empty(&self) -> bool {
        self.axis_count() == 0
    }

    /// Axis words for a G-code line, e.g. `X10.0000 Y0.0000`
    pub fn format_gcode(&self) -> String {
        self.axes()
            .map(|(axis, value)| format!("{}{}", axis, format_coordinate(value)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Apply this partial position to a full position
    pub fn apply_to(&self, pos: &Position) -> Position {
        let mut out = *pos;
        for (axis, value) in self.axes() {
            out.set(axis, value);
        }
        out
    }
}

/// Machine state reported by the firmware in status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    /// Connected and idle, ready for commands
    Idle,
    /// Executing a G-code program
    Run,
    /// Feed hold, awaiting resume
    Hold,
    /// Jog motion in progress
    Jog,
    /// Machine alarm state (requires manual intervention)
    Alarm,
    /// Safety door interlock triggered
    Door,
    /// Check mode (dry-run without machine movement)
    Check,
    /// Homing cycle in progress
    Home,
    /// Low-power sleep state
    Sleep,
    /// Firmware restarting or not yet reporting
    Disconnected,
    /// State string not recognized
    Unknown,
}

impl ControllerState {
    /// Map a GRBL-style state word (`Idle`, `Run`, `Hold:0`, ...) to a state.
    pub fn from_state_string(state: &str) -> Self {
        let word = state.split(':').next().unwrap_or_default();
        match word.to_ascii_lowercase().as_str() {
            "idle" => ControllerState::Idle,
            "run" => ControllerState::Run,
            "hold" | "queue" => ControllerState::Hold,
            "jog" => ControllerState::Jog,
            "alarm" => ControllerState::Alarm,
            "door" => ControllerState::Door,
            "check" => ControllerState::Check,
            "home" => ControllerState::Home,
            "sleep" => ControllerState::Sleep,
            _ => ControllerState::Unknown,
        }
    }

    /// Check if this state indicates active motion
    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            ControllerState::Run | ControllerState::Jog | ControllerState::Home
        )
    }

    /// Whether moving from `previous` to `self` ends a jog.
    ///
    /// A jog ends when the firmware leaves `Jog` for any state that is not
    /// itself motion, including transitions that skip `Idle` entirely such
    /// as a limit switch alarm or a door opening mid-jog.
    pub fn ends_jog(&self, previous: ControllerState) -> bool {
        use ControllerState::*;
        previous == Jog
            && matches!(self, Idle | Alarm | Door | Check | Sleep | Disconnected)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Run => write!(f, "Run"),
            Self::Hold => write!(f, "Hold"),
            Self::Jog => write!(f, "Jog"),
            Self::Alarm => write!(f, "Alarm"),
            Self::Door => write!(f, "Door"),
            Self::Check => write!(f, "Check"),
            Self::Home => write!(f, "Home"),
            Self::Sleep => write!(f, "Sleep"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Control state of the sender, as opposed to the machine.
///
/// Tracks the streaming lifecycle:
/// `Disconnected -> Connecting -> Idle <-> Sending <-> SendingPaused`,
/// with `Check` while the firmware is in check mode outside a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlState {
    /// Connection not established or closed
    Disconnected,
    /// Port is being opened
    Connecting,
    /// Connected with nothing in flight
    Idle,
    /// Commands are being sent or executed
    Sending,
    /// A send is paused
    SendingPaused,
    /// Firmware is in check mode
    Check,
}

impl ControlState {
    /// Check if a transition from this state to `target` is valid.
    ///
    /// Every connected state may drop to `Disconnected` on connection loss.
    pub fn can_transition_to(&self, target: ControlState) -> bool {
        use ControlState::*;
        if *self == target {
            return true;
        }
        matches!(
            (self, target),
            (Disconnected, Connecting)
                | (Connecting, Idle | Disconnected)
                | (Idle, Sending | SendingPaused | Check | Disconnected)
                | (Sending, Idle | SendingPaused | Check | Disconnected)
                | (SendingPaused, Idle | Sending | Check | Disconnected)
                | (Check, Idle | Sending | SendingPaused | Disconnected)
        )
    }

    /// Check if the connection is up
    pub fn is_connected(&self) -> bool {
        !matches!(self, ControlState::Disconnected | ControlState::Connecting)
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Idle => write!(f, "Idle"),
            Self::Sending => write!(f, "Sending"),
            Self::SendingPaused => write!(f, "Paused"),
            Self::Check => write!(f, "Check"),
        }
    }
}

/// Override percentages reported by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridePercents {
    pub feed: u32,
    pub rapid: u32,
    pub spindle: u32,
}

impl Default for OverridePercents {
    fn default() -> Self {
        Self {
            feed: 100,
            rapid: 100,
            spindle: 100,
        }
    }
}

/// Input pins reported active by the firmware (`Pn:` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnabledPins {
    pub x: bool,
    pub y: bool,
    pub z: bool,
    pub a: bool,
    pub b: bool,
    pub c: bool,
    pub probe: bool,
    pub door: bool,
    pub hold: bool,
    pub soft_reset: bool,
    pub cycle_start: bool,
}

impl EnabledPins {
    /// Parse the letters of a `Pn:` field, e.g. `XZP`.
    pub fn from_pin_string(pins: &str) -> Self {
        let mut out = Self::default();
        for c in pins.chars() {
            match c {
                'X' => out.x = true,
                'Y' => out.y = true,
                'Z' => out.z = true,
                'A' => out.a = true,
                'B' => out.b = true,
                'C' => out.c = true,
                'P' => out.probe = true,
                'D' => out.door = true,
                'H' => out.hold = true,
                'R' => out.soft_reset = true,
                'S' => out.cycle_start = true,
                _ => {}
            }
        }
        out
    }
}

/// Accessory states reported by the firmware (`A:` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessoryStates {
    pub spindle_cw: bool,
    pub spindle_ccw: bool,
    pub flood: bool,
    pub mist: bool,
}

impl AccessoryStates {
    /// Parse the letters of an `A:` field, e.g. `SFM`.
    pub fn from_accessory_string(accessories: &str) -> Self {
        let mut out = Self::default();
        for c in accessories.chars() {
            match c {
                'S' => out.spindle_cw = true,
                'C' => out.spindle_ccw = true,
                'F' => out.flood = true,
                'M' => out.mist = true,
                _ => {}
            }
        }
        out
    }
}

/// Snapshot of the machine built from one status report.
///
/// Replaced wholesale on every status line. Fields a report leaves out are
/// carried over from the previous snapshot by the dialect's parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    /// Raw state word as reported, e.g. `Hold:0`
    pub state_string: String,
    /// Parsed machine state
    pub state: ControllerState,
    /// Machine-frame position
    pub machine_coord: Position,
    /// Work-frame position
    pub work_coord: Position,
    /// Work coordinate offset, when known
    pub work_coordinate_offset: Option<Position>,
    /// Current feed rate
    pub feed_speed: f64,
    /// Current spindle speed
    pub spindle_speed: f64,
    /// Override percentages
    pub overrides: Option<OverridePercents>,
    /// Active input pins
    pub enabled_pins: EnabledPins,
    /// Spindle and coolant states
    pub accessory_states: AccessoryStates,
}

impl ControllerStatus {
    /// Create a status with the given state and zeroed positions
    pub fn new(state: ControllerState, units: Units) -> Self {
        Self {
            state_string: state.to_string(),
            state,
            machine_coord: Position::zero(units),
            work_coord: Position::zero(units),
            work_coordinate_offset: None,
            feed_speed: 0.0,
            spindle_speed: 0.0,
            overrides: None,
            enabled_pins: EnabledPins::default(),
            accessory_states: AccessoryStates::default(),
        }
    }

    /// Set state and state string
    pub fn with_state(mut self, state_string: impl Into<String>, state: ControllerState) -> Self {
        self.state_string = state_string.into();
        self.state = state;
        self
    }

    /// Set machine position
    pub fn with_machine_coord(mut self, position: Position) -> Self {
        self.machine_coord = position;
        self
    }

    /// Set work position
    pub fn with_work_coord(mut self, position: Position) -> Self {
        self.work_coord = position;
        self
    }

    /// Set work coordinate offset
    pub fn with_work_coordinate_offset(mut self, offset: Option<Position>) -> Self {
        self.work_coordinate_offset = offset;
        self
    }

    /// Set feed and spindle speed
    pub fn with_speeds(mut self, feed: f64, spindle: f64) -> Self {
        self.feed_speed = feed;
        self.spindle_speed = spindle;
        self
    }

    /// Set override percentages
    pub fn with_overrides(mut self, overrides: Option<OverridePercents>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Set pins and accessories
    pub fn with_io(mut self, pins: EnabledPins, accessories: AccessoryStates) -> Self {
        self.enabled_pins = pins;
        self.accessory_states = accessories;
        self
    }
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self::new(ControllerState::Unknown, Units::MM)
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} MPos[{}] WPos[{}] F:{} S:{}",
            self.state_string, self.machine_coord, self.work_coord, self.feed_speed,
            self.spindle_speed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_coordinate() {
        assert_eq!(format_coordinate(10.0), "10.0000");
        assert_eq!(format_coordinate(-1.23456), "-1.2346");
        assert_eq!(format_coordinate(-0.00001), "0.0000");
    }

    #[test]
    fn test_partial_position_gcode() {
        let p = PartialPosition::new(Units::MM)
            .with(Axis::X, 10.0)
            .with(Axis::Z, -2.5);
        assert_eq!(p.format_gcode(), "X10.0000 Z-2.5000");
        assert_eq!(p.axis_count(), 2);
        assert!(PartialPosition::new(Units::MM).is_empty());
    }

    #[test]
    fn test_position_arithmetic() {
        let m = Position::new(1.0, 2.0, 3.0, Units::MM);
        let wco = Position::new(7.0, 8.0, 9.0, Units::MM);
        let w = m.subtract(&wco);
        assert_eq!((w.x, w.y, w.z), (-6.0, -6.0, -6.0));
        assert_eq!(w.add(&wco), m);
    }

    #[test]
    fn test_position_convert() {
        let p = Position::new(25.4, 50.8, 0.0, Units::MM).convert_to(Units::INCH);
        assert!((p.x - 1.0).abs() < 1e-9);
        assert!((p.y - 2.0).abs() < 1e-9);
        assert_eq!(p.units, Units::INCH);
    }

    #[test]
    fn test_state_string_mapping() {
        assert_eq!(ControllerState::from_state_string("Idle"), ControllerState::Idle);
        assert_eq!(ControllerState::from_state_string("Hold:1"), ControllerState::Hold);
        assert_eq!(ControllerState::from_state_string("Door:0"), ControllerState::Door);
        assert_eq!(ControllerState::from_state_string("bogus"), ControllerState::Unknown);
    }

    #[test]
    fn test_jog_end_transitions() {
        use ControllerState::*;
        assert!(Idle.ends_jog(Jog));
        assert!(Alarm.ends_jog(Jog));
        assert!(Door.ends_jog(Jog));
        assert!(!Jog.ends_jog(Jog));
        assert!(!Run.ends_jog(Jog));
        assert!(!Idle.ends_jog(Run));
    }

    #[test]
    fn test_control_state_transitions() {
        use ControlState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Sending));
        assert!(Idle.can_transition_to(Sending));
        assert!(SendingPaused.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Disconnected));
    }

    #[test]
    fn test_pins_and_accessories() {
        let pins = EnabledPins::from_pin_string("XZPD");
        assert!(pins.x && pins.z && pins.probe && pins.door);
        assert!(!pins.y && !pins.hold);

        let acc = AccessoryStates::from_accessory_string("SFM");
        assert!(acc.spindle_cw && acc.flood && acc.mist);
        assert!(!acc.spindle_ccw);
    }
}
