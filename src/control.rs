//! Inbound MQTT control messages to arbiter commands.
//!
//! One message yields at most one Control command; nothing is coalesced.

use crate::protocol::{Command, CommandKind};
use crate::topics::{SetTopic, TopicScheme};
use crate::zone::{RunMode, ZoneDirectory};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("not a control topic: {0}")]
    NotControl(String),
    #[error("no zone named {0:?}")]
    UnknownZone(String),
    #[error("unsupported field {0:?}")]
    UnknownField(String),
    #[error("target {0:?} is not a temperature")]
    InvalidTarget(String),
    #[error("hot water payload {0:?} is neither ON nor OFF")]
    InvalidHotwater(String),
    #[error("no hot water relay configured")]
    NoHotwater,
}

/// Turn one control message into a command for the arbiter.
///
/// Targets are rounded to whole degrees; range checking is left to the codec
/// so an out-of-range request still produces a visible failure.
pub fn parse_control(
    topic: &str,
    payload: &str,
    directory: &ZoneDirectory,
    scheme: &TopicScheme,
) -> Result<Command, ControlError> {
    let payload = payload.trim();
    match scheme.parse_set(topic) {
        Some(SetTopic::Hotwater { field: "hw_state" }) => {
            let relay = directory.hotwater().ok_or(ControlError::NoHotwater)?;
            let on = match payload.to_ascii_uppercase().as_str() {
                "ON" => true,
                "OFF" => false,
                _ => return Err(ControlError::InvalidHotwater(payload.to_string())),
            };
            Ok(Command::control(CommandKind::WriteHotwater { address: relay.address, on }))
        }
        Some(SetTopic::Hotwater { field }) => Err(ControlError::UnknownField(field.to_string())),
        Some(SetTopic::Zone { name, field }) => {
            let zone = directory
                .by_name(name)
                .ok_or_else(|| ControlError::UnknownZone(name.to_string()))?;
            let address = zone.address;
            match field {
                "target" => {
                    let target_c = parse_target(payload)?;
                    Ok(Command::control(CommandKind::WriteTarget { address, target_c }))
                }
                "mode" => {
                    let mode = RunMode::from_frost_flag(payload.eq_ignore_ascii_case("off"));
                    Ok(Command::control(CommandKind::WriteMode { address, mode }))
                }
                other => Err(ControlError::UnknownField(other.to_string())),
            }
        }
        None => Err(ControlError::NotControl(topic.to_string())),
    }
}

fn parse_target(payload: &str) -> Result<u8, ControlError> {
    let value: f64 = payload
        .parse()
        .map_err(|_| ControlError::InvalidTarget(payload.to_string()))?;
    let rounded = value.round();
    if !rounded.is_finite() || !(0.0..=f64::from(u8::MAX)).contains(&rounded) {
        return Err(ControlError::InvalidTarget(payload.to_string()));
    }
    Ok(rounded as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Priority;
    use crate::zone::{HotwaterRelay, SensorKind, Zone, ZoneType};

    fn directory() -> ZoneDirectory {
        ZoneDirectory::new(
            vec![
                Zone::new(1, "lounge", ZoneType::Programmable, SensorKind::Air),
                Zone::new(6, "utility", ZoneType::ProgrammableHotwater, SensorKind::Air),
            ],
            Some(HotwaterRelay { address: 6, name: "Hot Water".into(), on: None }),
        )
    }

    fn parse(topic: &str, payload: &str) -> Result<Command, ControlError> {
        parse_control(topic, payload, &directory(), &TopicScheme::default())
    }

    #[test]
    fn test_target_is_rounded() {
        let command = parse("home/heatmiser/lounge/set/target", "21.6").unwrap();
        assert_eq!(command.priority, Priority::Control);
        assert_eq!(command.kind, CommandKind::WriteTarget { address: 1, target_c: 22 });
    }

    #[test]
    fn test_out_of_range_target_reaches_codec() {
        let command = parse("home/heatmiser/lounge/set/target", "40").unwrap();
        assert_eq!(command.kind, CommandKind::WriteTarget { address: 1, target_c: 40 });
        assert!(matches!(
            parse("home/heatmiser/lounge/set/target", "warm"),
            Err(ControlError::InvalidTarget(_))
        ));
        assert!(matches!(
            parse("home/heatmiser/lounge/set/target", "-3"),
            Err(ControlError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_mode_off_means_frost() {
        let off = parse("home/heatmiser/utility/set/mode", "off").unwrap();
        assert_eq!(off.kind, CommandKind::WriteMode { address: 6, mode: RunMode::Frost });
        let heat = parse("home/heatmiser/utility/set/mode", "heat").unwrap();
        assert_eq!(heat.kind, CommandKind::WriteMode { address: 6, mode: RunMode::On });
    }

    #[test]
    fn test_hotwater() {
        let on = parse("home/heatmiser/hotwater/set/hw_state", "on").unwrap();
        assert_eq!(on.kind, CommandKind::WriteHotwater { address: 6, on: true });
        assert!(matches!(
            parse("home/heatmiser/hotwater/set/hw_state", "boost"),
            Err(ControlError::InvalidHotwater(_))
        ));

        let no_relay = ZoneDirectory::new(vec![], None);
        let result = parse_control(
            "home/heatmiser/hotwater/set/hw_state",
            "ON",
            &no_relay,
            &TopicScheme::default(),
        );
        assert_eq!(result, Err(ControlError::NoHotwater));
    }

    #[test]
    fn test_rejects_unknown() {
        assert!(matches!(parse("home/heatmiser/attic/set/target", "20"), Err(ControlError::UnknownZone(_))));
        assert!(matches!(parse("home/heatmiser/lounge/set/fan", "1"), Err(ControlError::UnknownField(_))));
        assert!(matches!(parse("other/lounge/set/target", "20"), Err(ControlError::NotControl(_))));
    }
}
