//! Outcome records to MQTT state publications.
//!
//! The publisher owns the only copy of zone state and updates it from
//! outcomes alone. Reads publish when something changed; successful writes
//! always publish; failed writes publish an error document; failed reads
//! publish nothing.

use crate::arbiter::OutcomeRecord;
use crate::control::ControlError;
use crate::error::BusError;
use crate::protocol::{Command, CommandKind, Outcome, StateDelta};
use crate::topics::{SetTopic, TopicScheme};
use crate::zone::{RunMode, ZoneDirectory, ZoneState};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Publication {
    fn retained(topic: String, payload: impl Into<String>) -> Self {
        Self { topic, payload: payload.into(), retain: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PublisherStats {
    pub records: u64,
    pub unchanged: u64,
    pub publications: u64,
    pub errors_reported: u64,
}

pub fn mode_payload(mode: RunMode) -> &'static str {
    match mode {
        RunMode::On => "heat",
        RunMode::Frost => "off",
    }
}

pub fn action_payload(heating: bool) -> &'static str {
    if heating {
        "heating"
    } else {
        "idle"
    }
}

pub fn hotwater_payload(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

pub fn temperature_payload(state: &ZoneState) -> String {
    format!("{:.1}", state.measured_celsius())
}

#[derive(Debug)]
pub struct StatePublisher {
    scheme: TopicScheme,
    store: ZoneDirectory,
    stats: PublisherStats,
}

impl StatePublisher {
    pub fn new(scheme: TopicScheme, store: ZoneDirectory) -> Self {
        Self {
            scheme,
            store,
            stats: PublisherStats::default(),
        }
    }

    pub fn store(&self) -> &ZoneDirectory {
        &self.store
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    pub fn apply(&mut self, record: &OutcomeRecord) -> Vec<Publication> {
        self.stats.records += 1;
        let publications = match &record.outcome {
            Outcome::Decoded(delta) => self.apply_delta(&record.command, *delta),
            Outcome::Failed(err) if record.command.kind.is_write() => self.error_report(&record.command, err),
            Outcome::Failed(err) => {
                debug!(id = %record.command.id, command = %record.command.kind, error = %err, "poll failed, keeping last state");
                Vec::new()
            }
        };
        self.stats.publications += publications.len() as u64;
        publications
    }

    fn apply_delta(&mut self, command: &Command, delta: StateDelta) -> Vec<Publication> {
        if let StateDelta::Hotwater(on) = delta {
            return self.hotwater(on, command.kind.is_write());
        }

        let address = command.kind.address();
        let scheme = &self.scheme;
        let Some(zone) = self.store.zone_mut(address) else {
            warn!(address, "outcome for unconfigured zone");
            return Vec::new();
        };
        let name = zone.name.clone();
        match delta {
            StateDelta::Zone(state) => {
                zone.last_read = Some(SystemTime::now());
                if zone.state == Some(state) {
                    self.stats.unchanged += 1;
                    return Vec::new();
                }
                zone.state = Some(state);
                zone_publications(scheme, &name, &state)
            }
            StateDelta::Target(target_c) => match zone.state.as_mut() {
                Some(state) => {
                    state.target_c = target_c;
                    zone_publications(scheme, &name, state)
                }
                None => vec![Publication::retained(scheme.zone_state(&name, "target"), target_c.to_string())],
            },
            StateDelta::Mode(mode) => match zone.state.as_mut() {
                Some(state) => {
                    state.mode = mode;
                    if mode.is_frost() {
                        state.heating = false;
                    }
                    zone_publications(scheme, &name, state)
                }
                None => vec![Publication::retained(scheme.zone_state(&name, "mode"), mode_payload(mode))],
            },
            StateDelta::Hotwater(_) => Vec::new(),
        }
    }

    fn hotwater(&mut self, on: bool, force: bool) -> Vec<Publication> {
        let Some(relay) = self.store.hotwater_mut() else {
            warn!("hot water outcome without a configured relay");
            return Vec::new();
        };
        if !force && relay.on == Some(on) {
            self.stats.unchanged += 1;
            return Vec::new();
        }
        relay.on = Some(on);
        vec![Publication::retained(self.scheme.hotwater_state(), hotwater_payload(on))]
    }

    fn error_report(&mut self, command: &Command, err: &BusError) -> Vec<Publication> {
        let topic = match command.kind {
            CommandKind::WriteHotwater { .. } => self.scheme.hotwater_error(),
            kind => match self.store.zone(kind.address()) {
                Some(zone) => self.scheme.zone_error(&zone.name),
                None => {
                    warn!(address = kind.address(), "write failure for unconfigured zone");
                    return Vec::new();
                }
            },
        };
        let attempts = match err {
            BusError::RetryLimitExceeded { attempts, .. } => *attempts,
            _ => command.retries + 1,
        };
        let document = json!({
            "id": command.id.0,
            "command": command.kind.to_string(),
            "error": err.to_string(),
            "cause": err.root_cause().to_string(),
            "attempts": attempts,
        });
        warn!(id = %command.id, command = %command.kind, error = %err, "write failed");
        self.stats.errors_reported += 1;
        vec![Publication { topic, payload: document.to_string(), retain: false }]
    }
}

/// Error document for a control message that produced no command.
///
/// Goes to the error topic of the zone (or hot water) the message addressed;
/// `None` when the topic is not a control topic at all.
pub fn control_rejection(scheme: &TopicScheme, topic: &str, payload: &str, err: &ControlError) -> Option<Publication> {
    let error_topic = match scheme.parse_set(topic)? {
        SetTopic::Zone { name, .. } => scheme.zone_error(name),
        SetTopic::Hotwater { .. } => scheme.hotwater_error(),
    };
    let document = json!({
        "topic": topic,
        "payload": payload,
        "error": err.to_string(),
    });
    Some(Publication { topic: error_topic, payload: document.to_string(), retain: false })
}

fn zone_publications(scheme: &TopicScheme, zone: &str, state: &ZoneState) -> Vec<Publication> {
    vec![
        Publication::retained(scheme.zone_state(zone, "temperature"), temperature_payload(state)),
        Publication::retained(scheme.zone_state(zone, "target"), state.target_c.to_string()),
        Publication::retained(scheme.zone_state(zone, "mode"), mode_payload(state.mode)),
        Publication::retained(scheme.zone_state(zone, "action"), action_payload(state.heating)),
    ]
}
