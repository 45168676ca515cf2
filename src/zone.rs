use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Lowest and highest set points a V3 thermostat accepts.
pub const MIN_TARGET_C: u8 = 5;
pub const MAX_TARGET_C: u8 = 35;

/// Thermostat model family, as written in the configuration (`dt`, `prt`, `prthw`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneType {
    #[serde(rename = "dt", alias = "basic")]
    Basic,
    #[serde(rename = "prt", alias = "programmable")]
    Programmable,
    #[serde(rename = "prthw", alias = "programmable-hotwater")]
    ProgrammableHotwater,
}

impl ZoneType {
    pub fn has_hotwater_relay(self) -> bool {
        matches!(self, ZoneType::ProgrammableHotwater)
    }
}

/// Which probe the measured temperature is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    #[default]
    Air,
    Floor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    /// Normal heating operation.
    On,
    /// Frost protection; the zone is effectively off.
    Frost,
}

impl RunMode {
    pub fn from_frost_flag(frost: bool) -> Self {
        if frost {
            RunMode::Frost
        } else {
            RunMode::On
        }
    }

    pub fn is_frost(self) -> bool {
        matches!(self, RunMode::Frost)
    }
}

/// Decoded snapshot of one thermostat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneState {
    pub target_c: u8,
    pub measured_decicelsius: i16,
    pub mode: RunMode,
    pub heating: bool,
}

impl ZoneState {
    pub fn measured_celsius(&self) -> f32 {
        f32::from(self.measured_decicelsius) / 10.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub address: u8,
    pub name: String,
    pub zone_type: ZoneType,
    pub sensor: SensorKind,
    pub state: Option<ZoneState>,
    #[serde(skip)]
    pub last_read: Option<SystemTime>,
}

impl Zone {
    pub fn new(address: u8, name: impl Into<String>, zone_type: ZoneType, sensor: SensorKind) -> Self {
        Self {
            address,
            name: name.into(),
            zone_type,
            sensor,
            state: None,
            last_read: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotwaterRelay {
    pub address: u8,
    pub name: String,
    pub on: Option<bool>,
}

/// Every configured zone plus the optional hot-water binding, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct ZoneDirectory {
    zones: BTreeMap<u8, Zone>,
    hotwater: Option<HotwaterRelay>,
}

impl ZoneDirectory {
    pub fn new(zones: impl IntoIterator<Item = Zone>, hotwater: Option<HotwaterRelay>) -> Self {
        Self {
            zones: zones.into_iter().map(|zone| (zone.address, zone)).collect(),
            hotwater,
        }
    }

    pub fn zone(&self, address: u8) -> Option<&Zone> {
        self.zones.get(&address)
    }

    pub fn zone_mut(&mut self, address: u8) -> Option<&mut Zone> {
        self.zones.get_mut(&address)
    }

    pub fn by_name(&self, name: &str) -> Option<&Zone> {
        self.zones.values().find(|zone| zone.name == name)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn hotwater(&self) -> Option<&HotwaterRelay> {
        self.hotwater.as_ref()
    }

    pub fn hotwater_mut(&mut self) -> Option<&mut HotwaterRelay> {
        self.hotwater.as_mut()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}
