//! TinyG JSON report parsing
//!
//! Classifies inbound JSON lines and folds `sr` status reports into a
//! [`ControllerStatus`]. Also builds the JSON and G10 commands that depend
//! on the last report.

use crate::controller::modal::ModalState;
use cncstream_core::{
    format_coordinate, Axis, ControllerState, ControllerStatus, Override, OverridePercents,
    PartialPosition, Position, Units,
};
use serde_json::{Map, Value};

const RESTARTING_MESSAGE: &str = "Loading configs from EEPROM";
const READY_MESSAGE: &str = "SYSTEM READY";

const OVERRIDE_MIN: f64 = 0.05;
const OVERRIDE_MAX: f64 = 2.0;
const OVERRIDE_DEFAULT: f64 = 1.0;

/// One inbound JSON line
#[derive(Debug, Clone, PartialEq)]
pub enum TinyGReport {
    /// Firmware is reloading its configuration after a reset
    Restarting,
    /// Boot finished, with the firmware version if reported
    Ready { version: Option<f64> },
    /// Answer to the enquire byte
    Ack,
    /// Pushed status report
    Status(Map<String, Value>),
    /// Response to a command, carrying a status report when the command
    /// was `{sr:n}`
    Response {
        status: Option<Map<String, Value>>,
        error: bool,
    },
    /// Planner queue report
    QueueReport(Value),
    /// Serial receive queue report
    ReceiveReport(Value),
    /// Valid JSON nothing here understands
    Unhandled,
}

/// Parse a line, `None` when it is not a JSON object
pub fn parse_report(line: &str) -> Option<TinyGReport> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let object = value.as_object()?;

    if let Some(response) = object.get("r").and_then(Value::as_object) {
        match response.get("msg").and_then(Value::as_str) {
            Some(RESTARTING_MESSAGE) => return Some(TinyGReport::Restarting),
            Some(READY_MESSAGE) => {
                return Some(TinyGReport::Ready {
                    version: response.get("fv").and_then(number),
                })
            }
            _ => {}
        }
    }
    if object.contains_key("ack") {
        return Some(TinyGReport::Ack);
    }
    if let Some(sr) = object.get("sr").and_then(Value::as_object) {
        return Some(TinyGReport::Status(sr.clone()));
    }
    if let Some(response) = object.get("r") {
        let status = response
            .get("sr")
            .and_then(Value::as_object)
            .cloned();
        return Some(TinyGReport::Response {
            status,
            error: footer_status(object).is_some_and(|code| code != 0),
        });
    }
    if let Some(qr) = object.get("qr") {
        return Some(TinyGReport::QueueReport(qr.clone()));
    }
    if let Some(rx) = object.get("rx") {
        return Some(TinyGReport::ReceiveReport(rx.clone()));
    }
    Some(TinyGReport::Unhandled)
}

/// Status code from the `f` footer: `[revision, status, rx_buffer]`
fn footer_status(object: &Map<String, Value>) -> Option<i64> {
    object.get("f")?.as_array()?.get(1)?.as_i64()
}

/// Numeric field, tolerating numbers sent as strings
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field(sr: &Map<String, Value>, key: &str) -> Option<f64> {
    sr.get(key).and_then(number)
}

fn int_field(sr: &Map<String, Value>, key: &str) -> Option<i64> {
    field(sr, key).map(|v| v as i64)
}

/// Machine state for a `stat` code
pub fn state_for_code(code: i64) -> ControllerState {
    match code {
        1 | 3 | 4 => ControllerState::Idle,
        2 | 13 => ControllerState::Alarm,
        5 => ControllerState::Run,
        6 => ControllerState::Hold,
        9 => ControllerState::Home,
        10 => ControllerState::Jog,
        // 0 initializing, 7 probing, 8 canned cycle, 11 interlock, 12 shutdown
        _ => ControllerState::Unknown,
    }
}

/// Fold a status report into the previous snapshot.
///
/// Work positions are in the reported `unit` (1 = mm), machine positions
/// are always millimeters.
pub fn update_status(previous: &ControllerStatus, sr: &Map<String, Value>) -> ControllerStatus {
    let mut work = previous.work_coord;
    if let Some(unit) = int_field(sr, "unit") {
        work.units = if unit == 1 { Units::MM } else { Units::INCH };
    }
    for (key, axis) in [("posx", Axis::X), ("posy", Axis::Y), ("posz", Axis::Z)] {
        if let Some(v) = field(sr, key) {
            work.set(axis, v);
        }
    }

    let mut machine = previous.machine_coord.convert_to(Units::MM);
    for (key, axis) in [("mpox", Axis::X), ("mpoy", Axis::Y), ("mpoz", Axis::Z)] {
        if let Some(v) = field(sr, key) {
            machine.set(axis, v);
        }
    }

    let mut overrides = previous.overrides.unwrap_or_default();
    let percent = |v: f64| (v * 100.0).round() as u32;
    if let Some(v) = field(sr, "mfo") {
        overrides.feed = percent(v);
    }
    if let Some(v) = field(sr, "sso") {
        overrides.spindle = percent(v);
    }
    if let Some(v) = field(sr, "mto") {
        overrides.rapid = percent(v);
    }

    let feed = field(sr, "vel").unwrap_or(previous.feed_speed);
    let state = int_field(sr, "stat")
        .map(state_for_code)
        .unwrap_or(previous.state);

    ControllerStatus {
        state_string: state.to_string(),
        state,
        machine_coord: machine,
        work_coord: work,
        feed_speed: feed,
        overrides: Some(overrides),
        ..previous.clone()
    }
}

/// G-code words implied by the modal fields of a status report
pub fn modal_words(sr: &Map<String, Value>) -> Vec<&'static str> {
    let mut words = Vec::new();
    if let Some(coor) = int_field(sr, "coor") {
        const SYSTEMS: [&str; 6] = ["G54", "G55", "G56", "G57", "G58", "G59"];
        if let Some(word) = usize::try_from(coor - 1).ok().and_then(|i| SYSTEMS.get(i)) {
            words.push(*word);
        }
    }
    if let Some(unit) = int_field(sr, "unit") {
        words.push(if unit == 0 { "G20" } else { "G21" });
    }
    match int_field(sr, "plan") {
        Some(0) => words.push("G17"),
        Some(1) => words.push("G18"),
        Some(2) => words.push("G19"),
        _ => {}
    }
    match int_field(sr, "frmo") {
        Some(0) => words.push("G94"),
        Some(1) => words.push("G93"),
        _ => {}
    }
    match int_field(sr, "dist") {
        Some(0) => words.push("G90"),
        Some(1) => words.push("G91"),
        _ => {}
    }
    match int_field(sr, "admo") {
        Some(0) => words.push("G90.1"),
        Some(1) => words.push("G91.1"),
        _ => {}
    }
    words
}

/// Zero the active coordinate system at the current machine position
pub fn reset_coordinates_command(machine: &Position, modal: &ModalState) -> String {
    let machine = machine.convert_to(modal.units());
    format!(
        "G10 L2 P{} X{} Y{} Z{}",
        modal.coordinate_index(),
        format_coordinate(machine.x),
        format_coordinate(machine.y),
        format_coordinate(machine.z)
    )
}

/// Offset the active coordinate system so the axes read `position`
pub fn set_work_position_command(
    machine: &Position,
    modal: &ModalState,
    position: &PartialPosition,
) -> String {
    let units = modal.units();
    let machine = machine.convert_to(units);
    let mut offsets = PartialPosition::new(units);
    for (axis, value) in position.axes() {
        let value = match axis {
            Axis::X | Axis::Y | Axis::Z => Units::convert(value, position.units, units),
            _ => value,
        };
        offsets = offsets.with(axis, -(value - machine.get(axis)));
    }
    format!("G10 L2 P{} {}", modal.coordinate_index(), offsets.format_gcode())
}

fn format_ratio(value: f64) -> String {
    let text = format!("{:.4}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    text.to_string()
}

/// Override assignment for the current override ratios, `None` when the
/// step would leave the allowed range or the firmware has no such override
pub fn override_command(current: Option<OverridePercents>, command: Override) -> Option<String> {
    let current = current.unwrap_or_default();
    let feed = current.feed as f64 / 100.0;
    let spindle = current.spindle as f64 / 100.0;

    let step = |key: &str, ratio: f64, delta: f64| -> Option<String> {
        let allowed = if delta < 0.0 {
            ratio > OVERRIDE_MIN
        } else {
            ratio < OVERRIDE_MAX
        };
        allowed.then(|| format!("{{{}:{}}}", key, format_ratio(ratio + delta)))
    };
    let set = |key: &str, ratio: f64| Some(format!("{{{}:{}}}", key, format_ratio(ratio)));

    match command {
        Override::FeedCoarseMinus => step("mfo", feed, -0.10),
        Override::FeedCoarsePlus => step("mfo", feed, 0.10),
        Override::FeedFineMinus => step("mfo", feed, -0.05),
        Override::FeedFinePlus => step("mfo", feed, 0.05),
        Override::FeedReset => set("mfo", OVERRIDE_DEFAULT),
        Override::SpindleCoarseMinus => step("sso", spindle, -0.10),
        Override::SpindleCoarsePlus => step("sso", spindle, 0.10),
        Override::SpindleFineMinus => step("sso", spindle, -0.05),
        Override::SpindleFinePlus => step("sso", spindle, 0.05),
        Override::SpindleReset => set("sso", OVERRIDE_DEFAULT),
        Override::RapidLow => set("mto", 0.25),
        Override::RapidMedium => set("mto", 0.5),
        Override::RapidReset => set("mto", 1.0),
        Override::ToggleSpindle | Override::ToggleFloodCoolant | Override::ToggleMistCoolant => {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sr(json: &str) -> Map<String, Value> {
        match parse_report(json) {
            Some(TinyGReport::Status(sr)) => sr,
            other => panic!("not a status report: {:?}", other),
        }
    }

    #[test]
    fn test_classify_reports() {
        assert_eq!(parse_report("ok"), None);
        assert_eq!(
            parse_report(r#"{"r":{"fv":0.97,"fb":440.2,"msg":"SYSTEM READY"},"f":[1,0,0]}"#),
            Some(TinyGReport::Ready { version: Some(0.97) })
        );
        assert_eq!(
            parse_report(r#"{"r":{"msg":"Loading configs from EEPROM"},"f":[1,0,0]}"#),
            Some(TinyGReport::Restarting)
        );
        assert_eq!(parse_report(r#"{"ack":true}"#), Some(TinyGReport::Ack));
        assert_eq!(
            parse_report(r#"{"r":{},"f":[1,0,8]}"#),
            Some(TinyGReport::Response { status: None, error: false })
        );
        assert_eq!(
            parse_report(r#"{"r":{"err":"bad"},"f":[1,108,8]}"#),
            Some(TinyGReport::Response { status: None, error: true })
        );
        assert!(matches!(
            parse_report(r#"{"r":{"sr":{"stat":1}},"f":[1,0,6]}"#),
            Some(TinyGReport::Response { status: Some(_), error: false })
        ));
        assert!(matches!(parse_report(r#"{"qr":28}"#), Some(TinyGReport::QueueReport(_))));
        assert_eq!(parse_report(r#"{"foo":1}"#), Some(TinyGReport::Unhandled));
    }

    #[test]
    fn test_update_status() {
        let previous = ControllerStatus::new(ControllerState::Unknown, Units::MM);
        let report = sr(r#"{"sr":{"posx":1.5,"posy":2,"posz":-0.5,"mpox":11.5,"mpoy":12,"mpoz":9.5,"vel":300,"stat":5,"unit":1,"mfo":1.2}}"#);
        let status = update_status(&previous, &report);
        assert_eq!(status.state, ControllerState::Run);
        assert_eq!(status.work_coord, Position::new(1.5, 2.0, -0.5, Units::MM));
        assert_eq!(status.machine_coord, Position::new(11.5, 12.0, 9.5, Units::MM));
        assert_eq!(status.feed_speed, 300.0);
        assert_eq!(status.overrides.unwrap().feed, 120);

        // Partial report keeps the rest.
        let next = update_status(&status, &sr(r#"{"sr":{"posx":2.0,"stat":3}}"#));
        assert_eq!(next.state, ControllerState::Idle);
        assert_eq!(next.work_coord.x, 2.0);
        assert_eq!(next.work_coord.y, 2.0);
        assert_eq!(next.feed_speed, 300.0);
    }

    #[test]
    fn test_inch_work_position() {
        let previous = ControllerStatus::new(ControllerState::Idle, Units::MM);
        let status = update_status(&previous, &sr(r#"{"sr":{"unit":0,"posx":1.0}}"#));
        assert_eq!(status.work_coord.units, Units::INCH);
        assert_eq!(status.machine_coord.units, Units::MM);
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(state_for_code(1), ControllerState::Idle);
        assert_eq!(state_for_code(4), ControllerState::Idle);
        assert_eq!(state_for_code(13), ControllerState::Alarm);
        assert_eq!(state_for_code(10), ControllerState::Jog);
        assert_eq!(state_for_code(7), ControllerState::Unknown);
    }

    #[test]
    fn test_modal_words() {
        let words = modal_words(&sr(r#"{"sr":{"coor":2,"unit":0,"plan":0,"dist":1,"admo":1}}"#));
        assert_eq!(words, vec!["G55", "G20", "G17", "G91", "G91.1"]);
        let mut modal = ModalState::new();
        modal.update(&words.join(" "));
        assert_eq!(modal.coordinate_index(), 2);
        assert_eq!(modal.units(), Units::INCH);
    }

    #[test]
    fn test_coordinate_commands() {
        let machine = Position::new(10.0, 20.0, -5.0, Units::MM);
        let modal = ModalState::new();
        assert_eq!(
            reset_coordinates_command(&machine, &modal),
            "G10 L2 P1 X10.0000 Y20.0000 Z-5.0000"
        );
        let target = PartialPosition::axis(Axis::X, 4.0, Units::MM);
        assert_eq!(
            set_work_position_command(&machine, &modal, &target),
            "G10 L2 P1 X6.0000"
        );
    }

    #[test]
    fn test_override_commands() {
        assert_eq!(
            override_command(None, Override::FeedCoarsePlus).as_deref(),
            Some("{mfo:1.1}")
        );
        let low = OverridePercents { feed: 5, rapid: 100, spindle: 100 };
        assert_eq!(override_command(Some(low), Override::FeedFineMinus), None);
        let high = OverridePercents { feed: 100, rapid: 100, spindle: 200 };
        assert_eq!(override_command(Some(high), Override::SpindleCoarsePlus), None);
        assert_eq!(
            override_command(Some(high), Override::SpindleReset).as_deref(),
            Some("{sso:1}")
        );
        assert_eq!(
            override_command(None, Override::RapidLow).as_deref(),
            Some("{mto:0.25}")
        );
        assert_eq!(override_command(None, Override::ToggleSpindle), None);
    }
}
