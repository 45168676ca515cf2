//! MQTT topic layout and Home Assistant discovery documents.

use crate::zone::{HotwaterRelay, Zone, MAX_TARGET_C, MIN_TARGET_C};
use serde_json::{json, Value};

pub const DEFAULT_BASE_TOPIC: &str = "home/heatmiser";
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
/// Path segment that addresses the hot-water relay instead of a zone.
pub const HOTWATER_SEGMENT: &str = "hotwater";

/// Upper bound advertised to Home Assistant, below the thermostat's own limit.
const DISCOVERY_MAX_TEMP: u8 = 30;

/// A parsed `{base}/{zone}/set/{field}` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetTopic<'a> {
    Zone { name: &'a str, field: &'a str },
    Hotwater { field: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    base: String,
    discovery_prefix: String,
}

impl TopicScheme {
    pub fn new(base: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            discovery_prefix: discovery_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Filter covering every control topic.
    pub fn control_filter(&self) -> String {
        format!("{}/+/set/+", self.base)
    }

    pub fn zone_set(&self, zone: &str, field: &str) -> String {
        format!("{}/{zone}/set/{field}", self.base)
    }

    pub fn zone_state(&self, zone: &str, field: &str) -> String {
        format!("{}/{zone}/state/{field}", self.base)
    }

    pub fn zone_error(&self, zone: &str) -> String {
        self.zone_state(zone, "error")
    }

    pub fn hotwater_set(&self) -> String {
        self.zone_set(HOTWATER_SEGMENT, "hw_state")
    }

    pub fn hotwater_state(&self) -> String {
        self.zone_state(HOTWATER_SEGMENT, "hw_state")
    }

    pub fn hotwater_error(&self) -> String {
        self.zone_error(HOTWATER_SEGMENT)
    }

    pub fn parse_set<'a>(&self, topic: &'a str) -> Option<SetTopic<'a>> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        let (name, rest) = rest.split_once('/')?;
        let field = rest.strip_prefix("set/")?;
        if name.is_empty() || field.is_empty() || field.contains('/') {
            return None;
        }
        if name == HOTWATER_SEGMENT {
            Some(SetTopic::Hotwater { field })
        } else {
            Some(SetTopic::Zone { name, field })
        }
    }

    pub fn climate_discovery(&self, zone: &Zone) -> (String, Value) {
        let name = &zone.name;
        let topic = format!("{}/climate/heatmiser_{name}/config", self.discovery_prefix);
        let payload = json!({
            "name": format!("{} Thermostat", capitalize(name)),
            "unique_id": format!("heatmiser_{}_climate", zone.address),
            "current_temperature_topic": self.zone_state(name, "temperature"),
            "temperature_state_topic": self.zone_state(name, "target"),
            "temperature_command_topic": self.zone_set(name, "target"),
            "min_temp": MIN_TARGET_C,
            "max_temp": DISCOVERY_MAX_TEMP.min(MAX_TARGET_C),
            "modes": ["heat", "off"],
            "mode_state_topic": self.zone_state(name, "mode"),
            "mode_command_topic": self.zone_set(name, "mode"),
            "action_topic": self.zone_state(name, "action"),
        });
        (topic, payload)
    }

    pub fn hotwater_discovery(&self, relay: &HotwaterRelay) -> (String, Value) {
        let topic = format!("{}/switch/heatmiser_hotwater/config", self.discovery_prefix);
        let payload = json!({
            "name": relay.name,
            "unique_id": format!("heatmiser_{}_hotwater", relay.address),
            "command_topic": self.hotwater_set(),
            "state_topic": self.hotwater_state(),
            "payload_on": "ON",
            "payload_off": "OFF",
            "state_on": "ON",
            "state_off": "OFF",
        });
        (topic, payload)
    }
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC, DEFAULT_DISCOVERY_PREFIX)
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::{SensorKind, ZoneType};

    #[test]
    fn test_parse_set_topics() {
        let scheme = TopicScheme::default();
        assert_eq!(
            scheme.parse_set("home/heatmiser/lounge/set/target"),
            Some(SetTopic::Zone { name: "lounge", field: "target" })
        );
        assert_eq!(
            scheme.parse_set("home/heatmiser/hotwater/set/hw_state"),
            Some(SetTopic::Hotwater { field: "hw_state" })
        );
        assert_eq!(scheme.parse_set("home/heatmiser/lounge/state/target"), None);
        assert_eq!(scheme.parse_set("home/heatmiserx/lounge/set/target"), None);
        assert_eq!(scheme.parse_set("home/heatmiser/lounge/set/"), None);
    }

    #[test]
    fn test_trailing_slash_in_base() {
        let scheme = TopicScheme::new("heat/", "ha");
        assert_eq!(scheme.zone_state("hall", "mode"), "heat/hall/state/mode");
        assert_eq!(scheme.control_filter(), "heat/+/set/+");
    }

    #[test]
    fn test_climate_discovery_document() {
        let scheme = TopicScheme::default();
        let zone = Zone::new(3, "kitchen", ZoneType::Programmable, SensorKind::Floor);
        let (topic, payload) = scheme.climate_discovery(&zone);
        assert_eq!(topic, "homeassistant/climate/heatmiser_kitchen/config");
        assert_eq!(payload["name"], "Kitchen Thermostat");
        assert_eq!(payload["unique_id"], "heatmiser_3_climate");
        assert_eq!(payload["mode_command_topic"], "home/heatmiser/kitchen/set/mode");
        assert_eq!(payload["min_temp"], 5);
        assert_eq!(payload["max_temp"], 30);
    }

    #[test]
    fn test_hotwater_discovery_document() {
        let scheme = TopicScheme::default();
        let relay = HotwaterRelay { address: 6, name: "Hot Water".into(), on: None };
        let (topic, payload) = scheme.hotwater_discovery(&relay);
        assert_eq!(topic, "homeassistant/switch/heatmiser_hotwater/config");
        assert_eq!(payload["command_topic"], "home/heatmiser/hotwater/set/hw_state");
        assert_eq!(payload["state_topic"], "home/heatmiser/hotwater/state/hw_state");
    }
}
