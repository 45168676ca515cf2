//! Periodic status reads.
//!
//! Each cycle submits one Poll read per zone plus one for the hot-water
//! relay. A target whose previous read has not resolved yet is skipped, so a
//! slow bus never accumulates duplicate polls.

use crate::arbiter::ArbiterHandle;
use crate::protocol::{Command, CommandKind};
use crate::scheduler::OutcomeHandle;
use crate::zone::ZoneDirectory;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PollTarget {
    Zone(u8),
    Hotwater(u8),
}

impl PollTarget {
    fn command(self, directory: &ZoneDirectory) -> Option<Command> {
        let kind = match self {
            PollTarget::Zone(address) => {
                let sensor = directory.zone(address)?.sensor;
                CommandKind::ReadZone { address, sensor }
            }
            PollTarget::Hotwater(address) => CommandKind::ReadHotwater { address },
        };
        Some(Command::poll(kind))
    }
}

pub struct Poller {
    arbiter: ArbiterHandle,
    directory: ZoneDirectory,
    outstanding: BTreeMap<PollTarget, OutcomeHandle>,
    cycles: u64,
}

impl Poller {
    pub fn new(arbiter: ArbiterHandle, directory: ZoneDirectory) -> Self {
        Self {
            arbiter,
            directory,
            outstanding: BTreeMap::new(),
            cycles: 0,
        }
    }

    pub fn targets(&self) -> Vec<PollTarget> {
        let zones = self.directory.zones().map(|zone| PollTarget::Zone(zone.address));
        let hotwater = self.directory.hotwater().map(|relay| PollTarget::Hotwater(relay.address));
        zones.chain(hotwater).collect()
    }

    /// Reads still queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Submit one cycle of reads; returns how many were submitted.
    pub fn poll_once(&mut self) -> usize {
        self.cycles += 1;
        self.outstanding.retain(|_, handle| handle.try_outcome().is_none());

        let mut submitted = 0;
        for target in self.targets() {
            if self.outstanding.contains_key(&target) {
                debug!(?target, "previous read still outstanding, skipping");
                continue;
            }
            let Some(command) = target.command(&self.directory) else {
                continue;
            };
            let handle = self.arbiter.submit(command);
            self.outstanding.insert(target, handle);
            submitted += 1;
        }
        debug!(cycle = self.cycles, submitted, queued = self.arbiter.queued(), "poll cycle");
        submitted
    }

    /// Poll every `interval` until cancelled; the first cycle runs immediately.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        info!(?interval, targets = self.targets().len(), "poller started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once();
                }
            }
        }
        info!(cycles = self.cycles, "poller stopped");
    }
}
