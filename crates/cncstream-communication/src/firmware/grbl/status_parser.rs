//! GRBL Status Report Parsing
//!
//! Builds a [`ControllerStatus`] from a status line in either format:
//! - 1.1: `<Idle|MPos:0.000,0.000,0.000|FS:0,0|WCO:0.000,0.000,0.000>`
//! - 0.8/0.9: `<Idle,MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000>`
//!
//! Fields the report leaves out come from the previous snapshot.

use cncstream_core::{
    AccessoryStates, ControllerState, ControllerStatus, EnabledPins, OverridePercents, Position,
    Units,
};
use regex::Regex;
use std::sync::OnceLock;

/// Parse comma separated coordinates. Needs at least X, Y and Z.
pub fn parse_position(values: &str, units: Units) -> Option<Position> {
    let coords: Vec<f64> = values
        .split(',')
        .filter_map(|s| s.trim().parse::<f64>().ok())
        .collect();
    if coords.len() < 3 {
        return None;
    }
    Some(Position::from_values(&coords, units))
}

fn parse_overrides(values: &str) -> Option<OverridePercents> {
    let pct: Vec<u32> = values
        .split(',')
        .filter_map(|s| s.trim().parse::<u32>().ok())
        .collect();
    match pct.as_slice() {
        [feed, rapid, spindle, ..] => Some(OverridePercents {
            feed: *feed,
            rapid: *rapid,
            spindle: *spindle,
        }),
        _ => None,
    }
}

fn parse_speeds(values: &str) -> (Option<f64>, Option<f64>) {
    let mut parts = values.split(',').map(|s| s.trim().parse::<f64>().ok());
    let feed = parts.next().flatten();
    let spindle = parts.next().flatten();
    (feed, spindle)
}

/// Fields found in one report
#[derive(Debug, Default)]
struct ReportFields {
    state_string: String,
    machine: Option<Position>,
    work: Option<Position>,
    offset: Option<Position>,
    feed: Option<f64>,
    spindle: Option<f64>,
    overrides: Option<OverridePercents>,
    pins: Option<EnabledPins>,
    accessories: Option<AccessoryStates>,
    override_report: bool,
}

/// Parse a status line, `None` if it is not one
pub fn parse_status(
    previous: Option<&ControllerStatus>,
    line: &str,
    v1_format: bool,
    units: Units,
) -> Option<ControllerStatus> {
    let inner = line.trim().strip_prefix('<')?.strip_suffix('>')?;
    let fields = if v1_format || inner.contains('|') {
        parse_v1_fields(inner, units)?
    } else {
        parse_legacy_fields(inner, units)?
    };
    Some(merge(previous, fields, units))
}

fn parse_v1_fields(inner: &str, units: Units) -> Option<ReportFields> {
    let mut parts = inner.split('|');
    let mut fields = ReportFields {
        state_string: parts.next()?.to_string(),
        ..ReportFields::default()
    };
    for part in parts {
        let Some((name, value)) = part.split_once(':') else {
            continue;
        };
        match name {
            "MPos" => fields.machine = parse_position(value, units),
            "WPos" => fields.work = parse_position(value, units),
            "WCO" => fields.offset = parse_position(value, units),
            "Ov" => {
                fields.override_report = true;
                fields.overrides = parse_overrides(value);
            }
            "FS" => (fields.feed, fields.spindle) = parse_speeds(value),
            "F" => fields.feed = value.trim().parse().ok(),
            "Pn" => fields.pins = Some(EnabledPins::from_pin_string(value)),
            "A" => fields.accessories = Some(AccessoryStates::from_accessory_string(value)),
            _ => {}
        }
    }
    Some(fields)
}

fn legacy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(MPos|WPos|WCO):([-+\d.]+,[-+\d.]+,[-+\d.]+(?:,[-+\d.]+)*?)(?:,[A-Za-z]|$)")
            .expect("invalid regex pattern")
    })
}

fn parse_legacy_fields(inner: &str, units: Units) -> Option<ReportFields> {
    let state = inner.split(',').next()?.trim();
    if state.is_empty() {
        return None;
    }
    let mut fields = ReportFields {
        state_string: state.to_string(),
        ..ReportFields::default()
    };
    // Matches may share the delimiter comma, so scan from each field start.
    let mut rest = inner;
    while let Some(caps) = legacy_regex().captures(rest) {
        let Some(whole) = caps.get(2) else {
            break;
        };
        let position = parse_position(whole.as_str(), units);
        match &caps[1] {
            "MPos" => fields.machine = position,
            "WPos" => fields.work = position,
            _ => fields.offset = position,
        }
        rest = &rest[whole.end()..];
    }
    Some(fields)
}

fn merge(previous: Option<&ControllerStatus>, fields: ReportFields, units: Units) -> ControllerStatus {
    let state = ControllerState::from_state_string(&fields.state_string);
    let offset = fields
        .offset
        .or_else(|| previous.and_then(|p| p.work_coordinate_offset));

    let (machine, work) = match (fields.machine, fields.work) {
        (Some(m), Some(w)) => (m, w),
        (Some(m), None) => {
            let w = offset
                .map(|o| m.subtract(&o))
                .or_else(|| previous.map(|p| p.work_coord))
                .unwrap_or(m);
            (m, w)
        }
        (None, Some(w)) => {
            let m = offset
                .map(|o| w.add(&o))
                .or_else(|| previous.map(|p| p.machine_coord))
                .unwrap_or(w);
            (m, w)
        }
        (None, None) => (
            previous.map(|p| p.machine_coord).unwrap_or(Position::zero(units)),
            previous.map(|p| p.work_coord).unwrap_or(Position::zero(units)),
        ),
    };

    let feed = fields
        .feed
        .or_else(|| previous.map(|p| p.feed_speed))
        .unwrap_or_default();
    let spindle = fields
        .spindle
        .or_else(|| previous.map(|p| p.spindle_speed))
        .unwrap_or_default();

    // Pins and accessories are only reported alongside overrides; when they
    // are missing from an override report they are off.
    let (overrides, pins, accessories) = if fields.override_report {
        (
            fields.overrides,
            fields.pins.unwrap_or_default(),
            fields.accessories.unwrap_or_default(),
        )
    } else {
        (
            previous.and_then(|p| p.overrides),
            fields
                .pins
                .or_else(|| previous.map(|p| p.enabled_pins))
                .unwrap_or_default(),
            previous.map(|p| p.accessory_states).unwrap_or_default(),
        )
    };

    ControllerStatus::new(state, units)
        .with_state(fields.state_string, state)
        .with_machine_coord(machine)
        .with_work_coord(work)
        .with_work_coordinate_offset(offset)
        .with_speeds(feed, spindle)
        .with_overrides(overrides)
        .with_io(pins, accessories)
}

/// Parse `[PRB:1.000,2.000,-3.000:1]` into the contact position and
/// whether the probe made contact
pub fn parse_probe(line: &str, units: Units) -> Option<(Position, bool)> {
    let inner = line.trim().strip_prefix("[PRB:")?.strip_suffix(']')?;
    let (coords, flag) = inner.rsplit_once(':')?;
    let position = parse_position(coords, units)?;
    Some((position, flag.trim() == "1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position_tolerates_short_numbers() {
        let p = parse_position("-.5,5.,10", Units::MM).unwrap();
        assert_eq!((p.x, p.y, p.z), (-0.5, 5.0, 10.0));
        assert!(parse_position("1,2", Units::MM).is_none());
        let p = parse_position("1,2,3,4", Units::MM).unwrap();
        assert_eq!(p.a, 4.0);
    }

    #[test]
    fn test_v1_status_with_offset() {
        let status = parse_status(
            None,
            "<Idle|MPos:10.000,20.000,-1.000|FS:0,0|WCO:1.000,2.000,3.000>",
            true,
            Units::MM,
        )
        .unwrap();
        assert_eq!(status.state, ControllerState::Idle);
        assert_eq!(status.machine_coord, Position::new(10.0, 20.0, -1.0, Units::MM));
        assert_eq!(status.work_coord, Position::new(9.0, 18.0, -4.0, Units::MM));

        // Offset omitted: the previous one still applies.
        let next = parse_status(Some(&status), "<Run|MPos:11.000,20.000,-1.000|FS:500,0>", true, Units::MM)
            .unwrap();
        assert_eq!(next.state, ControllerState::Run);
        assert_eq!(next.work_coord.x, 10.0);
        assert_eq!(next.feed_speed, 500.0);
    }

    #[test]
    fn test_v1_work_position_only() {
        let status = parse_status(
            None,
            "<Hold:0|WPos:1.000,1.000,1.000|F:100|WCO:1.000,1.000,1.000>",
            true,
            Units::MM,
        )
        .unwrap();
        assert_eq!(status.state_string, "Hold:0");
        assert_eq!(status.state, ControllerState::Hold);
        assert_eq!(status.machine_coord, Position::new(2.0, 2.0, 2.0, Units::MM));
        assert_eq!(status.feed_speed, 100.0);
    }

    #[test]
    fn test_override_report_carries_io() {
        let first = parse_status(
            None,
            "<Run|MPos:0,0,0|FS:100,1000|Ov:120,100,90|Pn:XP|A:SF>",
            true,
            Units::MM,
        )
        .unwrap();
        let ov = first.overrides.unwrap();
        assert_eq!((ov.feed, ov.rapid, ov.spindle), (120, 100, 90));
        assert!(first.enabled_pins.x && first.enabled_pins.probe);
        assert!(first.accessory_states.spindle_cw && first.accessory_states.flood);

        let second = parse_status(Some(&first), "<Run|MPos:1,0,0|FS:100,1000>", true, Units::MM)
            .unwrap();
        assert_eq!(second.overrides, first.overrides);
        assert_eq!(second.accessory_states, first.accessory_states);

        let third = parse_status(Some(&second), "<Run|MPos:1,0,0|FS:100,1000|Ov:100,100,100>", true, Units::MM)
            .unwrap();
        assert!(!third.accessory_states.flood);
        assert!(!third.enabled_pins.x);
    }

    #[test]
    fn test_legacy_status() {
        let status = parse_status(
            None,
            "<Idle,MPos:5.529,0.560,7.000,WPos:1.529,-5.440,-0.000>",
            false,
            Units::MM,
        )
        .unwrap();
        assert_eq!(status.state, ControllerState::Idle);
        assert_eq!(status.machine_coord, Position::new(5.529, 0.560, 7.0, Units::MM));
        assert_eq!(status.work_coord, Position::new(1.529, -5.440, 0.0, Units::MM));
    }

    #[test]
    fn test_legacy_missing_work_position_is_carried_over() {
        let previous = ControllerStatus::new(ControllerState::Idle, Units::MM)
            .with_machine_coord(Position::new(1.0, 1.0, 1.0, Units::MM))
            .with_work_coord(Position::new(4.0, 5.0, 6.0, Units::MM));
        let status = parse_status(
            Some(&previous),
            "<Run,MPos:2.000,2.000,2.000,Buf:0,RX:0>",
            false,
            Units::MM,
        )
        .unwrap();
        assert_eq!(status.state, ControllerState::Run);
        assert_eq!(status.machine_coord, Position::new(2.0, 2.0, 2.0, Units::MM));
        assert_eq!(status.work_coord, previous.work_coord);
    }

    #[test]
    fn test_not_a_status_line() {
        assert!(parse_status(None, "ok", true, Units::MM).is_none());
        assert!(parse_status(None, "[GC:G0]", true, Units::MM).is_none());
    }

    #[test]
    fn test_parse_probe() {
        let (pos, success) = parse_probe("[PRB:1.000,2.000,-3.500:1]", Units::MM).unwrap();
        assert_eq!(pos, Position::new(1.0, 2.0, -3.5, Units::MM));
        assert!(success);
        let (_, success) = parse_probe("[PRB:0.000,0.000,0.000:0]", Units::MM).unwrap();
        assert!(!success);
        assert!(parse_probe("[GC:G0]", Units::MM).is_none());
    }
}
