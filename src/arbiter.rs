//! The command arbiter: the only task that touches the link.
//!
//! One command is in flight at a time. Each command moves through
//! `Queued -> InFlight -> {Completed | RetryPending | Failed}`; a retry goes
//! back into its own band, so a Control command submitted meanwhile is
//! served first. A link-level failure ends [`Arbiter::run`] and leaves the
//! queue intact for the next connection.

use crate::error::BusError;
use crate::link::Link;
use crate::protocol::{self, Command, Outcome, Priority, StateDelta};
use crate::scheduler::{CommandQueue, OutcomeHandle, Pending, RetryPlacement, DEFAULT_BAND_CAPACITY};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RETRY_MAX: u32 = 2;
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_CONTROL_SETTLE: Duration = Duration::from_millis(500);
pub const DEFAULT_POLL_SETTLE: Duration = Duration::from_millis(250);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(300);

/// Ceiling for exponential backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(retry - 1)`, capped.
    Exponential(Duration),
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential(base) => {
                let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
                base.checked_mul(factor).map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(DEFAULT_RETRY_BACKOFF)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    pub retry_max: u32,
    pub exchange_timeout: Duration,
    pub control_settle: Duration,
    pub poll_settle: Duration,
    pub backoff: Backoff,
    pub retry_placement: RetryPlacement,
    pub queue_capacity: usize,
}

impl ArbiterConfig {
    pub fn settle_for(&self, priority: Priority) -> Duration {
        match priority {
            Priority::Control => self.control_settle,
            Priority::Poll => self.poll_settle,
        }
    }
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            retry_max: DEFAULT_RETRY_MAX,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            control_settle: DEFAULT_CONTROL_SETTLE,
            poll_settle: DEFAULT_POLL_SETTLE,
            backoff: Backoff::default(),
            retry_placement: RetryPlacement::default(),
            queue_capacity: DEFAULT_BAND_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArbiterStats {
    /// Requests put on the wire.
    pub attempts: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
}

/// One resolved command, in resolution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub command: Command,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterExit {
    /// Cancelled or the queue was closed; every queued command has been resolved.
    Shutdown,
    /// The connection failed; queued commands are still waiting.
    LinkDown(BusError),
}

/// Cloneable producer side of the arbiter.
#[derive(Debug, Clone)]
pub struct ArbiterHandle {
    queue: Arc<CommandQueue>,
    stats: Arc<Mutex<ArbiterStats>>,
}

impl ArbiterHandle {
    pub fn submit(&self, command: Command) -> OutcomeHandle {
        self.queue.submit(command)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> ArbiterStats {
        *self.stats.lock()
    }
}

pub struct Arbiter {
    config: ArbiterConfig,
    queue: Arc<CommandQueue>,
    outcomes: mpsc::UnboundedSender<OutcomeRecord>,
    stats: Arc<Mutex<ArbiterStats>>,
}

impl Arbiter {
    pub fn new(config: ArbiterConfig) -> (Self, ArbiterHandle, mpsc::UnboundedReceiver<OutcomeRecord>) {
        let queue = Arc::new(CommandQueue::new(config.queue_capacity));
        let stats = Arc::new(Mutex::new(ArbiterStats::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ArbiterHandle {
            queue: Arc::clone(&queue),
            stats: Arc::clone(&stats),
        };
        let arbiter = Self {
            config,
            queue,
            outcomes: tx,
            stats,
        };
        (arbiter, handle, rx)
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn stats(&self) -> ArbiterStats {
        *self.stats.lock()
    }

    /// Serve the queue over `link` until cancelled, closed, or the link fails.
    pub async fn run(&mut self, mut link: Box<dyn Link>, cancel: &CancellationToken) -> ArbiterExit {
        info!(link = %link.describe(), queued = self.queue.len(), "arbiter running");
        let queue = Arc::clone(&self.queue);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = queue.next() => next,
            };
            let Some(pending) = next else {
                self.shutdown();
                return ArbiterExit::Shutdown;
            };
            if let Some(err) = self.execute(&mut *link, pending, cancel).await {
                error!(link = %link.describe(), error = %err, queued = self.queue.len(), "link down, arbiter stopping");
                return ArbiterExit::LinkDown(err);
            }
        }
    }

    /// Run one command to completion, failure, or re-queue. Returns a link-fatal error.
    async fn execute(&mut self, link: &mut dyn Link, mut pending: Pending, cancel: &CancellationToken) -> Option<BusError> {
        let priority = pending.command.priority;
        debug!(
            id = %pending.command.id,
            command = %pending.command.kind,
            ?priority,
            retries = pending.command.retries,
            "in flight"
        );

        let request = match protocol::encode(&pending.command) {
            Ok(request) => request,
            Err(err) => {
                warn!(id = %pending.command.id, error = %err, "rejected before sending");
                self.stats.lock().failed += 1;
                self.finish(pending, Outcome::Failed(err));
                return None;
            }
        };

        self.stats.lock().attempts += 1;
        match self.exchange(link, &request, &pending.command).await {
            Ok(delta) => {
                debug!(id = %pending.command.id, ?delta, "completed");
                self.stats.lock().completed += 1;
                self.finish(pending, Outcome::Decoded(delta));
                pause(self.config.settle_for(priority), cancel).await;
                None
            }
            Err(err) if err.is_link_fatal() => {
                self.stats.lock().failed += 1;
                self.finish(pending, Outcome::Failed(err.clone()));
                Some(err)
            }
            Err(err) if err.is_retryable() && pending.command.retries < self.config.retry_max => {
                resync(link, &err);
                pending.command.retries += 1;
                let delay = self.config.backoff.delay(pending.command.retries);
                debug!(
                    id = %pending.command.id,
                    error = %err,
                    retry = pending.command.retries,
                    ?delay,
                    "retry pending"
                );
                self.stats.lock().retries += 1;
                // A cancelled backoff still requeues; shutdown then resolves it.
                pause(delay, cancel).await;
                if let Err(pending) = self.queue.requeue(pending, self.config.retry_placement) {
                    self.finish(pending, Outcome::Failed(BusError::Shutdown));
                }
                None
            }
            Err(err) => {
                resync(link, &err);
                let attempts = pending.command.retries + 1;
                let err = if err.is_retryable() {
                    BusError::RetryLimitExceeded { attempts, last: Box::new(err) }
                } else {
                    err
                };
                warn!(id = %pending.command.id, command = %pending.command.kind, error = %err, "failed");
                self.stats.lock().failed += 1;
                self.finish(pending, Outcome::Failed(err));
                pause(self.config.settle_for(priority), cancel).await;
                None
            }
        }
    }

    async fn exchange(&self, link: &mut dyn Link, request: &[u8], command: &Command) -> Result<StateDelta, BusError> {
        let timeout = self.config.exchange_timeout;
        tokio::time::timeout(timeout, link.send(request))
            .await
            .map_err(|_| BusError::LinkWrite(format!("write stalled for {timeout:?}")))??;
        let raw = link.receive_frame(self.config.exchange_timeout).await?;
        let frame = protocol::decode(&raw)?;
        protocol::interpret(&frame, command)
    }

    fn finish(&self, pending: Pending, outcome: Outcome) {
        let command = pending.resolve(&outcome);
        // Nobody listening is fine; the originator already has its outcome.
        let _ = self.outcomes.send(OutcomeRecord { command, outcome });
    }

    /// Close the queue and fail everything still in it with `Shutdown`.
    pub fn shutdown(&self) {
        let drained = self.queue.close();
        if !drained.is_empty() {
            info!(count = drained.len(), "failing queued commands on shutdown");
        }
        let outcome = Outcome::Failed(BusError::Shutdown);
        for pending in drained {
            self.finish(pending, outcome.clone());
        }
    }
}

/// Any reply that failed to match may be followed by the one we wanted, or
/// by a late one for an earlier request; drop whatever is buffered.
fn resync(link: &mut dyn Link, err: &BusError) {
    if !matches!(err, BusError::Timeout(_)) {
        debug!(link = %link.describe(), error = %err, "discarding buffered input");
        link.mark_stale();
    }
}

async fn pause(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed(Duration::from_millis(300));
        assert_eq!(backoff.delay(1), Duration::from_millis(300));
        assert_eq!(backoff.delay(5), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(40), MAX_BACKOFF);
    }

    #[test]
    fn test_settle_by_priority() {
        let config = ArbiterConfig::default();
        assert_eq!(config.settle_for(Priority::Control), DEFAULT_CONTROL_SETTLE);
        assert_eq!(config.settle_for(Priority::Poll), DEFAULT_POLL_SETTLE);
    }
}
