//! In-process stand-in for a UH1 and its thermostats.
//!
//! [`SimulatedController`] implements [`Link`]: every request is decoded on
//! the controller side, applied to the addressed thermostat's data block and
//! answered with a proper response frame. Addresses with no thermostat stay
//! silent, exactly like the real bus.

use crate::link::{Link, LinkError};
use crate::protocol::{
    dcb, decode_request, encode_read_payload, encode_response, write_address, FUNC_READ, FUNC_WRITE,
};
use crate::zone::{RunMode, SensorKind, ZoneState, ZoneType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

const BLOCK_LEN: usize = 64;

/// Model codes as reported at `dcb::MODEL`.
fn model_code(zone_type: ZoneType) -> u8 {
    match zone_type {
        ZoneType::Basic => 0,
        ZoneType::Programmable => 2,
        ZoneType::ProgrammableHotwater => 4,
    }
}

#[derive(Debug, Clone)]
struct Thermostat {
    block: [u8; BLOCK_LEN],
    requests: u32,
}

impl Thermostat {
    fn new(zone_type: ZoneType) -> Self {
        let mut thermostat = Self {
            block: [0u8; BLOCK_LEN],
            requests: 0,
        };
        thermostat.block[dcb::MODEL] = model_code(zone_type);
        thermostat.block[dcb::ON_OFF] = 1;
        thermostat.block[dcb::TARGET_TEMP] = 20;
        thermostat.set_probe(dcb::AIR_TEMP, 190);
        thermostat.set_probe(dcb::FLOOR_TEMP, 180);
        thermostat.refresh_heating();
        thermostat
    }

    fn set_probe(&mut self, offset: usize, decicelsius: i16) {
        self.block[offset..offset + 2].copy_from_slice(&decicelsius.to_be_bytes());
    }

    fn probe(&self, offset: usize) -> i16 {
        i16::from_be_bytes([self.block[offset], self.block[offset + 1]])
    }

    fn refresh_heating(&mut self) {
        let frost = self.block[dcb::RUN_MODE] != 0;
        let wanted = i16::from(self.block[dcb::TARGET_TEMP]) * 10;
        self.block[dcb::HEATING_STATE] = u8::from(!frost && self.probe(dcb::AIR_TEMP) < wanted);
    }

    fn apply_write(&mut self, start: u16, value: u8) {
        match start {
            write_address::TARGET_TEMP => self.block[dcb::TARGET_TEMP] = value,
            write_address::RUN_MODE => self.block[dcb::RUN_MODE] = value,
            write_address::HOTWATER => {
                self.block[dcb::HOTWATER_STATE] = u8::from(value == write_address::HOTWATER_ON);
            }
            other => trace!(start = other, "ignoring write to unmapped address"),
        }
        self.refresh_heating();
    }

    fn state(&self, sensor: SensorKind) -> ZoneState {
        let probe = match sensor {
            SensorKind::Air => dcb::AIR_TEMP,
            SensorKind::Floor => dcb::FLOOR_TEMP,
        };
        ZoneState {
            target_c: self.block[dcb::TARGET_TEMP],
            measured_decicelsius: self.probe(probe),
            mode: RunMode::from_frost_flag(self.block[dcb::RUN_MODE] != 0),
            heating: self.block[dcb::HEATING_STATE] != 0,
        }
    }
}

/// Shared thermostat population; clones see the same thermostats.
#[derive(Debug, Clone, Default)]
pub struct SimulatedController {
    thermostats: Arc<Mutex<BTreeMap<u8, Thermostat>>>,
    outbox: VecDeque<Vec<u8>>,
    latency: Duration,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thermostat(self, address: u8, zone_type: ZoneType) -> Self {
        self.thermostats.lock().insert(address, Thermostat::new(zone_type));
        self
    }

    /// Delay before each response becomes readable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_air_temp(&self, address: u8, decicelsius: i16) {
        self.update(address, |t| t.set_probe(dcb::AIR_TEMP, decicelsius));
    }

    pub fn set_floor_temp(&self, address: u8, decicelsius: i16) {
        self.update(address, |t| t.set_probe(dcb::FLOOR_TEMP, decicelsius));
    }

    pub fn set_mode(&self, address: u8, mode: RunMode) {
        self.update(address, |t| t.block[dcb::RUN_MODE] = u8::from(mode.is_frost()));
    }

    pub fn state(&self, address: u8, sensor: SensorKind) -> Option<ZoneState> {
        self.thermostats.lock().get(&address).map(|t| t.state(sensor))
    }

    pub fn hotwater(&self, address: u8) -> Option<bool> {
        self.thermostats
            .lock()
            .get(&address)
            .map(|t| t.block[dcb::HOTWATER_STATE] != 0)
    }

    /// Requests addressed to `address` that decoded cleanly.
    pub fn requests(&self, address: u8) -> u32 {
        self.thermostats.lock().get(&address).map_or(0, |t| t.requests)
    }

    fn update(&self, address: u8, change: impl FnOnce(&mut Thermostat)) {
        if let Some(thermostat) = self.thermostats.lock().get_mut(&address) {
            change(thermostat);
            thermostat.refresh_heating();
        }
    }

    fn answer(&self, request: &[u8]) -> Option<Vec<u8>> {
        let request = decode_request(request).ok()?;
        let mut thermostats = self.thermostats.lock();
        let thermostat = thermostats.get_mut(&request.destination)?;
        thermostat.requests += 1;
        match request.function {
            FUNC_READ => {
                let payload = encode_read_payload(0, &thermostat.block);
                Some(encode_response(request.destination, FUNC_READ, &payload))
            }
            FUNC_WRITE => {
                let value = *request.payload.first()?;
                thermostat.apply_write(request.start, value);
                Some(encode_response(request.destination, FUNC_WRITE, &[]))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Link for SimulatedController {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if let Some(response) = self.answer(frame) {
            self.outbox.push_back(response);
        }
        Ok(())
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        match self.outbox.pop_front() {
            Some(frame) if self.latency <= timeout => {
                tokio::time::sleep(self.latency).await;
                Ok(frame)
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(LinkError::Timeout(timeout))
            }
        }
    }

    fn describe(&self) -> String {
        format!("simulator({} thermostats)", self.thermostats.lock().len())
    }

    fn mark_stale(&mut self) {
        self.outbox.clear();
    }
}
