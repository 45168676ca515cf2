//! Link wrapper that injects bus faults.
//!
//! Faults come from a script (one entry per exchange, consumed in order) and,
//! once the script is exhausted, from per-exchange probabilities drawn from a
//! fixed-seed generator so runs are reproducible.

use crate::link::{Link, LinkError};
use crate::protocol::{crc16, CRC_LEN};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;
const FUNCTION_OFFSET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InjectedFault {
    /// Flip a bit in the received CRC.
    CorruptChecksum,
    /// Drop the last bytes of the response.
    Truncate,
    /// The request is lost on the bus; nothing comes back.
    Timeout,
    /// Valid frame carrying the other function code.
    WrongFunction,
    /// Writing the request fails.
    WriteFailure,
    /// The connection drops while waiting for the response.
    Disconnect,
}

/// Probabilistic faults, applied after the script runs out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRates {
    pub corrupt_percent: f32,
    pub truncate_percent: f32,
    pub timeout_percent: f32,
    pub seed: u64,
}

impl Default for FaultRates {
    fn default() -> Self {
        Self {
            corrupt_percent: 0.0,
            truncate_percent: 0.0,
            timeout_percent: 0.0,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FaultStats {
    pub exchanges: u32,
    pub corrupted: u32,
    pub truncated: u32,
    pub timeouts: u32,
    pub wrong_function: u32,
    pub write_failures: u32,
    pub disconnects: u32,
}

impl FaultStats {
    pub fn total_injected(&self) -> u32 {
        self.corrupted + self.truncated + self.timeouts + self.wrong_function + self.write_failures + self.disconnects
    }

    fn count(&mut self, fault: InjectedFault) {
        match fault {
            InjectedFault::CorruptChecksum => self.corrupted += 1,
            InjectedFault::Truncate => self.truncated += 1,
            InjectedFault::Timeout => self.timeouts += 1,
            InjectedFault::WrongFunction => self.wrong_function += 1,
            InjectedFault::WriteFailure => self.write_failures += 1,
            InjectedFault::Disconnect => self.disconnects += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Sent { frame: Vec<u8>, at: Instant },
    Received { frame: Vec<u8>, at: Instant },
    TimedOut { at: Instant },
    Failed { at: Instant },
}

/// Shared record of everything that crossed a link, in order.
#[derive(Debug, Clone, Default)]
pub struct LinkProbe {
    events: Arc<Mutex<Vec<LinkEvent>>>,
}

impl LinkProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        self.events.lock().clone()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                LinkEvent::Sent { frame, .. } => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    /// Destination addresses of every request, in send order.
    pub fn destinations(&self) -> Vec<u8> {
        self.sent().iter().filter_map(|frame| frame.first().copied()).collect()
    }

    fn record(&self, event: LinkEvent) {
        self.events.lock().push(event);
    }
}

pub struct FaultyLink<L> {
    inner: L,
    script: VecDeque<Option<InjectedFault>>,
    rates: FaultRates,
    rng_state: u64,
    current: Option<InjectedFault>,
    stats: FaultStats,
    probe: Option<LinkProbe>,
}

impl<L: Link> FaultyLink<L> {
    pub fn new(inner: L) -> Self {
        Self::with_rates(inner, FaultRates::default())
    }

    pub fn with_rates(inner: L, rates: FaultRates) -> Self {
        let rng_state = rates.seed;
        Self {
            inner,
            script: VecDeque::new(),
            rates,
            rng_state,
            current: None,
            stats: FaultStats::default(),
            probe: None,
        }
    }

    /// One entry per upcoming exchange; `None` lets that exchange through untouched.
    pub fn script(mut self, faults: impl IntoIterator<Item = Option<InjectedFault>>) -> Self {
        self.script.extend(faults);
        self
    }

    /// Apply `fault` to every exchange, indefinitely.
    pub fn always(mut self, fault: InjectedFault) -> Self {
        match fault {
            InjectedFault::CorruptChecksum => self.rates.corrupt_percent = 100.0,
            InjectedFault::Truncate => self.rates.truncate_percent = 100.0,
            InjectedFault::Timeout => self.rates.timeout_percent = 100.0,
            other => self.script.extend(std::iter::repeat(Some(other)).take(1024)),
        }
        self
    }

    pub fn with_probe(mut self, probe: LinkProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn stats(&self) -> FaultStats {
        self.stats
    }

    pub fn into_inner(self) -> L {
        self.inner
    }

    fn pick_fault(&mut self) -> Option<InjectedFault> {
        if let Some(scripted) = self.script.pop_front() {
            return scripted;
        }
        let roll = self.random_percent();
        let mut threshold = self.rates.timeout_percent;
        if roll < threshold {
            return Some(InjectedFault::Timeout);
        }
        threshold += self.rates.corrupt_percent;
        if roll < threshold {
            return Some(InjectedFault::CorruptChecksum);
        }
        threshold += self.rates.truncate_percent;
        if roll < threshold {
            return Some(InjectedFault::Truncate);
        }
        None
    }

    fn record(&self, event: LinkEvent) {
        if let Some(probe) = &self.probe {
            probe.record(event);
        }
    }

    // Linear congruential generator, Numerical Recipes constants.
    fn next_random(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.rng_state
    }

    fn random_percent(&mut self) -> f32 {
        ((self.next_random() >> 33) % 10_000) as f32 / 100.0
    }
}

fn corrupt(fault: InjectedFault, mut frame: Vec<u8>) -> Vec<u8> {
    match fault {
        InjectedFault::CorruptChecksum => {
            if let Some(last) = frame.last_mut() {
                *last ^= 0x01;
            }
        }
        InjectedFault::Truncate => {
            let keep = frame.len().saturating_sub(3);
            frame.truncate(keep);
        }
        InjectedFault::WrongFunction => {
            if frame.len() > FUNCTION_OFFSET + CRC_LEN {
                frame[FUNCTION_OFFSET] ^= 0x01;
                let body = frame.len() - CRC_LEN;
                let crc = crc16(&frame[..body]).to_le_bytes();
                frame[body..].copy_from_slice(&crc);
            }
        }
        _ => {}
    }
    frame
}

#[async_trait]
impl<L: Link> Link for FaultyLink<L> {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.stats.exchanges += 1;
        self.current = self.pick_fault();
        if let Some(fault) = self.current {
            debug!(?fault, exchange = self.stats.exchanges, "injecting fault");
            self.stats.count(fault);
        }
        self.record(LinkEvent::Sent { frame: frame.to_vec(), at: Instant::now() });

        match self.current {
            Some(InjectedFault::WriteFailure) => {
                self.record(LinkEvent::Failed { at: Instant::now() });
                Err(LinkError::Write("injected write failure".into()))
            }
            // The request never reaches a thermostat.
            Some(InjectedFault::Timeout) => Ok(()),
            _ => self.inner.send(frame).await,
        }
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        match self.current.take() {
            Some(InjectedFault::Timeout) => {
                tokio::time::sleep(timeout).await;
                self.record(LinkEvent::TimedOut { at: Instant::now() });
                Err(LinkError::Timeout(timeout))
            }
            Some(InjectedFault::Disconnect) => {
                self.record(LinkEvent::Failed { at: Instant::now() });
                Err(LinkError::Closed)
            }
            fault => {
                let result = self.inner.receive_frame(timeout).await;
                let result = match (fault, result) {
                    (Some(fault), Ok(frame)) => Ok(corrupt(fault, frame)),
                    (_, result) => result,
                };
                let event = match &result {
                    Ok(frame) => LinkEvent::Received { frame: frame.clone(), at: Instant::now() },
                    Err(LinkError::Timeout(_)) => LinkEvent::TimedOut { at: Instant::now() },
                    Err(_) => LinkEvent::Failed { at: Instant::now() },
                };
                self.record(event);
                result
            }
        }
    }

    fn describe(&self) -> String {
        format!("faulty({})", self.inner.describe())
    }

    fn mark_stale(&mut self) {
        self.inner.mark_stale();
    }
}
