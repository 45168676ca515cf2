//! Bridge configuration: one JSON document, validated before anything starts.

use crate::arbiter::{ArbiterConfig, Backoff};
use crate::link::{LinkTarget, DEFAULT_BAUD_RATE};
use crate::mqtt::MqttSettings;
use crate::poller::DEFAULT_POLL_INTERVAL;
use crate::scheduler::{RetryPlacement, DEFAULT_BAND_CAPACITY};
use crate::topics::{TopicScheme, DEFAULT_BASE_TOPIC, DEFAULT_DISCOVERY_PREFIX, HOTWATER_SEGMENT};
use crate::zone::{HotwaterRelay, SensorKind, Zone, ZoneDirectory, ZoneType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "options.json";
const MAX_RETRIES: u32 = 10;
const SOCKET_SCHEME: &str = "socket://";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    pub mqtt: MqttConfig,
    pub heatmiser: HeatmiserConfig,
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub hotwater: Option<HotwaterConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmiserConfig {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Seconds between poll cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,
    #[serde(default = "default_control_settle_ms")]
    pub control_settle_ms: u64,
    #[serde(default = "default_poll_settle_ms")]
    pub poll_settle_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default)]
    pub retry_placement: RetryPlacement,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: u8,
    pub name: String,
    #[serde(rename = "type")]
    pub zone_type: ZoneType,
    #[serde(default)]
    pub sensor_type: SensorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotwaterConfig {
    pub zone_id: u8,
    #[serde(default = "default_hotwater_name")]
    pub name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "hmbus".to_string()
}
fn default_discovery_prefix() -> String {
    DEFAULT_DISCOVERY_PREFIX.to_string()
}
fn default_base_topic() -> String {
    DEFAULT_BASE_TOPIC.to_string()
}
fn default_baudrate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}
fn default_retry_max() -> u32 {
    crate::arbiter::DEFAULT_RETRY_MAX
}
fn default_exchange_timeout_ms() -> u64 {
    crate::arbiter::DEFAULT_EXCHANGE_TIMEOUT.as_millis() as u64
}
fn default_control_settle_ms() -> u64 {
    crate::arbiter::DEFAULT_CONTROL_SETTLE.as_millis() as u64
}
fn default_poll_settle_ms() -> u64 {
    crate::arbiter::DEFAULT_POLL_SETTLE.as_millis() as u64
}
fn default_retry_backoff_ms() -> u64 {
    crate::arbiter::DEFAULT_RETRY_BACKOFF.as_millis() as u64
}
fn default_queue_capacity() -> usize {
    DEFAULT_BAND_CAPACITY
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_hotwater_name() -> String {
    "Hot Water".to_string()
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link_target()?;

        let hm = &self.heatmiser;
        if hm.retry_max > MAX_RETRIES {
            return Err(invalid(format!("retry_max {} exceeds {MAX_RETRIES}", hm.retry_max)));
        }
        for (field, value) in [
            ("exchange_timeout_ms", hm.exchange_timeout_ms),
            ("poll_interval", hm.poll_interval),
            ("queue_capacity", hm.queue_capacity as u64),
        ] {
            if value == 0 {
                return Err(invalid(format!("{field} must be greater than zero")));
            }
        }
        if self.mqtt.broker.trim().is_empty() {
            return Err(invalid("mqtt.broker is empty"));
        }

        if self.zones.is_empty() {
            return Err(invalid("no zones configured"));
        }
        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        for zone in &self.zones {
            if zone.id == 0 {
                return Err(invalid(format!("zone {:?} uses address 0", zone.name)));
            }
            if !ids.insert(zone.id) {
                return Err(invalid(format!("zone id {} appears twice", zone.id)));
            }
            if !is_topic_safe(&zone.name) {
                return Err(invalid(format!("zone name {:?} cannot be used in a topic", zone.name)));
            }
            if !names.insert(zone.name.as_str()) {
                return Err(invalid(format!("zone name {:?} appears twice", zone.name)));
            }
        }

        if let Some(hotwater) = &self.hotwater {
            let zone = self
                .zones
                .iter()
                .find(|zone| zone.id == hotwater.zone_id)
                .ok_or_else(|| invalid(format!("hot water zone {} is not configured", hotwater.zone_id)))?;
            if !zone.zone_type.has_hotwater_relay() {
                return Err(invalid(format!("hot water zone {:?} is not a prthw thermostat", zone.name)));
            }
        }
        Ok(())
    }

    /// Exactly one of `device`, `ip` + `port`, or `url` selects the link.
    pub fn link_target(&self) -> Result<LinkTarget, ConfigError> {
        let hm = &self.heatmiser;
        let tcp = match (&hm.ip, hm.port) {
            (Some(ip), Some(port)) => Some(LinkTarget::Tcp { host: ip.clone(), port }),
            (None, None) => None,
            _ => return Err(invalid("ip and port must be given together")),
        };
        let device = hm.device.as_ref().map(|device| LinkTarget::Serial {
            device: device.clone(),
            baud_rate: hm.baudrate,
        });
        let url = hm.url.as_deref().map(|url| parse_url(url, hm.baudrate)).transpose()?;

        let mut chosen = [device, tcp, url].into_iter().flatten();
        match (chosen.next(), chosen.next()) {
            (Some(target), None) => Ok(target),
            (None, _) => Err(invalid("set one of heatmiser.device, heatmiser.ip/port or heatmiser.url")),
            (Some(_), Some(_)) => Err(invalid("heatmiser.device, ip/port and url are mutually exclusive")),
        }
    }

    pub fn arbiter_config(&self) -> ArbiterConfig {
        let hm = &self.heatmiser;
        let backoff_base = Duration::from_millis(hm.retry_backoff_ms);
        ArbiterConfig {
            retry_max: hm.retry_max,
            exchange_timeout: Duration::from_millis(hm.exchange_timeout_ms),
            control_settle: Duration::from_millis(hm.control_settle_ms),
            poll_settle: Duration::from_millis(hm.poll_settle_ms),
            backoff: match hm.backoff {
                BackoffKind::Fixed => Backoff::Fixed(backoff_base),
                BackoffKind::Exponential => Backoff::Exponential(backoff_base),
            },
            retry_placement: hm.retry_placement,
            queue_capacity: hm.queue_capacity,
        }
    }

    pub fn topics(&self) -> TopicScheme {
        TopicScheme::new(self.mqtt.base_topic.clone(), self.mqtt.discovery_prefix.clone())
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt.broker.clone(),
            port: self.mqtt.port,
            client_id: self.mqtt.client_id.clone(),
            credentials: self.mqtt.username.clone().map(|user| (user, self.mqtt.password.clone().unwrap_or_default())),
            ..MqttSettings::default()
        }
    }

    pub fn directory(&self) -> ZoneDirectory {
        let zones = self
            .zones
            .iter()
            .map(|zone| Zone::new(zone.id, zone.name.clone(), zone.zone_type, zone.sensor_type));
        let hotwater = self.hotwater.as_ref().map(|hotwater| HotwaterRelay {
            address: hotwater.zone_id,
            name: hotwater.name.clone(),
            on: None,
        });
        ZoneDirectory::new(zones, hotwater)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.heatmiser.poll_interval)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.heatmiser.reconnect_delay_ms)
    }
}

/// `socket://host:port` opens TCP; a bare path opens a serial device.
pub fn parse_url(url: &str, baud_rate: u32) -> Result<LinkTarget, ConfigError> {
    if let Some(rest) = url.strip_prefix(SOCKET_SCHEME) {
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid(format!("{url}: missing port")))?;
        let port = port
            .trim_end_matches('/')
            .parse()
            .map_err(|_| invalid(format!("{url}: bad port")))?;
        if host.is_empty() {
            return Err(invalid(format!("{url}: missing host")));
        }
        return Ok(LinkTarget::Tcp { host: host.to_string(), port });
    }
    if url.starts_with('/') {
        return Ok(LinkTarget::Serial { device: url.to_string(), baud_rate });
    }
    Err(invalid(format!("unsupported url {url:?}")))
}

fn is_topic_safe(name: &str) -> bool {
    !name.is_empty()
        && name != HOTWATER_SEGMENT
        && !name.chars().any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace() || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "mqtt": { "broker": "localhost" },
        "heatmiser": { "device": "/dev/ttyUSB0" },
        "zones": [
            { "id": 1, "name": "lounge", "type": "prt" },
            { "id": 6, "name": "utility", "type": "prthw", "sensor_type": "floor" }
        ],
        "hotwater": { "zone_id": 6 }
    }"#;

    fn with(edit: impl FnOnce(&mut serde_json::Value)) -> Result<BridgeConfig, ConfigError> {
        let mut value: serde_json::Value = serde_json::from_str(MINIMAL).unwrap();
        edit(&mut value);
        BridgeConfig::from_json(&value.to_string())
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.base_topic, "home/heatmiser");
        assert_eq!(config.heatmiser.baudrate, 4800);
        assert_eq!(config.poll_interval(), Duration::from_secs(120));
        assert_eq!(config.arbiter_config(), ArbiterConfig::default());
        assert_eq!(
            config.link_target().unwrap(),
            LinkTarget::Serial { device: "/dev/ttyUSB0".into(), baud_rate: 4800 }
        );
        let directory = config.directory();
        assert_eq!(directory.zone(6).map(|z| z.sensor), Some(SensorKind::Floor));
        assert_eq!(directory.hotwater().map(|h| h.name.as_str()), Some("Hot Water"));
    }

    #[test]
    fn test_link_selection() {
        let tcp = with(|v| {
            v["heatmiser"] = serde_json::json!({ "ip": "192.168.1.20", "port": 1024 });
        })
        .unwrap();
        assert_eq!(tcp.link_target().unwrap(), LinkTarget::Tcp { host: "192.168.1.20".into(), port: 1024 });

        let url = with(|v| v["heatmiser"] = serde_json::json!({ "url": "socket://uh1.local:4001" })).unwrap();
        assert_eq!(url.link_target().unwrap(), LinkTarget::Tcp { host: "uh1.local".into(), port: 4001 });

        assert!(with(|v| v["heatmiser"]["ip"] = "10.0.0.2".into()).is_err());
        assert!(with(|v| v["heatmiser"] = serde_json::json!({})).is_err());
        assert!(with(|v| v["heatmiser"]["url"] = "telnet://x:1".into()).is_err());
    }

    #[test]
    fn test_zone_rules() {
        assert!(with(|v| v["zones"][1]["id"] = 1.into()).is_err());
        assert!(with(|v| v["zones"][1]["name"] = "lounge".into()).is_err());
        assert!(with(|v| v["zones"][0]["name"] = "living room".into()).is_err());
        assert!(with(|v| v["zones"][0]["id"] = 0.into()).is_err());
        assert!(with(|v| v["hotwater"]["zone_id"] = 1.into()).is_err());
        assert!(with(|v| v["hotwater"]["zone_id"] = 9.into()).is_err());
    }

    #[test]
    fn test_tunables() {
        assert!(with(|v| v["heatmiser"]["retry_max"] = 11.into()).is_err());
        assert!(with(|v| v["heatmiser"]["exchange_timeout_ms"] = 0.into()).is_err());
        let exponential = with(|v| {
            v["heatmiser"]["backoff"] = "exponential".into();
            v["heatmiser"]["retry_placement"] = "head".into();
        })
        .unwrap();
        let arbiter = exponential.arbiter_config();
        assert_eq!(arbiter.backoff, Backoff::Exponential(Duration::from_millis(300)));
        assert_eq!(arbiter.retry_placement, RetryPlacement::Head);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, MINIMAL).unwrap();
        assert!(BridgeConfig::load(&path).is_ok());

        let missing = BridgeConfig::load(dir.path().join("absent.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(BridgeConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
