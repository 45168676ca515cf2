//! Two-band command queue shared by the producers and the arbiter.
//!
//! Control commands always pop before Poll commands; each band is FIFO.
//! Producers never block: [`CommandQueue::submit`] returns an
//! [`OutcomeHandle`] immediately and the arbiter resolves it later.

use crate::error::BusError;
use crate::protocol::{Command, CommandId, Outcome, Priority};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::Notify;
use tracing::trace;

pub const DEFAULT_BAND_CAPACITY: usize = 64;

/// Where a command waiting for its retry goes back into its band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryPlacement {
    /// Behind everything already waiting in the band.
    #[default]
    Tail,
    /// In front of the band, so it is the next command of its priority.
    Head,
}

/// A queued command and the channel its originator is waiting on.
#[derive(Debug)]
pub struct Pending {
    pub command: Command,
    reply: oneshot::Sender<Outcome>,
}

impl Pending {
    /// Deliver the final outcome; returns the command for the outcome stream.
    pub fn resolve(self, outcome: &Outcome) -> Command {
        // The originator may have stopped waiting.
        let _ = self.reply.send(outcome.clone());
        self.command
    }
}

/// Resolves once the arbiter is done with a command.
#[derive(Debug)]
pub struct OutcomeHandle {
    id: CommandId,
    receiver: oneshot::Receiver<Outcome>,
}

impl OutcomeHandle {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub async fn outcome(self) -> Outcome {
        self.receiver.await.unwrap_or(Outcome::Failed(BusError::Shutdown))
    }

    /// Non-blocking check; `None` while the command is still queued or in flight.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Outcome::Failed(BusError::Shutdown)),
        }
    }

    fn resolved(id: CommandId, outcome: Outcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { id, receiver: rx }
    }
}

#[derive(Debug, Default)]
struct Bands {
    control: VecDeque<Pending>,
    poll: VecDeque<Pending>,
    last_id: u64,
    closed: bool,
}

impl Bands {
    fn band_mut(&mut self, priority: Priority) -> &mut VecDeque<Pending> {
        match priority {
            Priority::Control => &mut self.control,
            Priority::Poll => &mut self.poll,
        }
    }

    fn pop(&mut self) -> Option<Pending> {
        self.control.pop_front().or_else(|| self.poll.pop_front())
    }
}

#[derive(Debug)]
pub struct CommandQueue {
    bands: Mutex<Bands>,
    ready: Notify,
    capacity: usize,
}

impl CommandQueue {
    /// `capacity` bounds each band separately.
    pub fn new(capacity: usize) -> Self {
        Self {
            bands: Mutex::new(Bands::default()),
            ready: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Stamp the command with the next id and enqueue it in its band.
    pub fn submit(&self, mut command: Command) -> OutcomeHandle {
        let (tx, rx) = oneshot::channel();
        let mut bands = self.bands.lock();
        bands.last_id += 1;
        command.id = CommandId(bands.last_id);
        command.retries = 0;
        let id = command.id;

        if bands.closed {
            return OutcomeHandle::resolved(id, Outcome::Failed(BusError::Shutdown));
        }
        let capacity = self.capacity;
        let priority = command.priority;
        let band = bands.band_mut(priority);
        if band.len() >= capacity {
            return OutcomeHandle::resolved(id, Outcome::Failed(BusError::QueueFull));
        }
        trace!(%id, command = %command.kind, ?priority, "queued");
        band.push_back(Pending { command, reply: tx });
        drop(bands);

        self.ready.notify_one();
        OutcomeHandle { id, receiver: rx }
    }

    /// Put a command back after a failed attempt. Hands it back if the queue has closed.
    pub fn requeue(&self, pending: Pending, placement: RetryPlacement) -> Result<(), Pending> {
        let mut bands = self.bands.lock();
        if bands.closed {
            return Err(pending);
        }
        let band = bands.band_mut(pending.command.priority);
        match placement {
            RetryPlacement::Tail => band.push_back(pending),
            RetryPlacement::Head => band.push_front(pending),
        }
        drop(bands);
        self.ready.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<Pending> {
        self.bands.lock().pop()
    }

    /// Wait for the next command, Control first. `None` once the queue is closed.
    pub async fn next(&self) -> Option<Pending> {
        loop {
            {
                let mut bands = self.bands.lock();
                if let Some(pending) = bands.pop() {
                    return Some(pending);
                }
                if bands.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Refuse further submissions and hand back everything still queued.
    pub fn close(&self) -> Vec<Pending> {
        let mut bands = self.bands.lock();
        bands.closed = true;
        let mut drained: Vec<Pending> = bands.control.drain(..).collect();
        drained.extend(bands.poll.drain(..));
        drop(bands);
        self.ready.notify_one();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.bands.lock().closed
    }

    pub fn len(&self) -> usize {
        let bands = self.bands.lock();
        bands.control.len() + bands.poll.len()
    }

    pub fn band_len(&self, priority: Priority) -> usize {
        let mut bands = self.bands.lock();
        bands.band_mut(priority).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(DEFAULT_BAND_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandKind;
    use crate::zone::SensorKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn read(address: u8) -> Command {
        Command::poll(CommandKind::ReadZone { address, sensor: SensorKind::Air })
    }

    fn write(address: u8) -> Command {
        Command::control(CommandKind::WriteTarget { address, target_c: 20 })
    }

    #[test]
    fn test_control_pops_before_poll() {
        let queue = CommandQueue::default();
        queue.submit(read(1));
        queue.submit(read(2));
        queue.submit(write(3));

        let order: Vec<u8> = std::iter::from_fn(|| queue.try_pop())
            .map(|pending| pending.command.kind.address())
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let queue = CommandQueue::default();
        let a = queue.submit(read(1));
        let b = queue.submit(write(1));
        assert!(b.id() > a.id());
        assert_eq!(queue.try_pop().map(|p| p.command.id), Some(b.id()));
    }

    #[test]
    fn test_band_capacity() {
        let queue = CommandQueue::new(1);
        let _first = queue.submit(read(1));
        let mut overflow = queue.submit(read(2));
        assert_eq!(overflow.try_outcome(), Some(Outcome::Failed(BusError::QueueFull)));
        // The other band has its own limit.
        let mut control = queue.submit(write(1));
        assert_eq!(control.try_outcome(), None);
        assert_eq!(queue.band_len(Priority::Poll), 1);
        assert_eq!(queue.band_len(Priority::Control), 1);
    }

    #[test]
    fn test_requeue_placement() {
        let queue = CommandQueue::default();
        queue.submit(read(1));
        queue.submit(read(2));
        let first = queue.try_pop().unwrap();
        queue.requeue(first, RetryPlacement::Tail).unwrap();
        assert_eq!(queue.try_pop().unwrap().command.kind.address(), 2);

        queue.submit(read(3));
        let retried = queue.try_pop().unwrap();
        assert_eq!(retried.command.kind.address(), 1);
        queue.requeue(retried, RetryPlacement::Head).unwrap();
        assert_eq!(queue.try_pop().unwrap().command.kind.address(), 1);
    }

    #[test]
    fn test_close_drains_and_rejects() {
        let queue = CommandQueue::default();
        let _handle = queue.submit(read(1));
        let drained = queue.close();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_closed());
        assert!(queue.is_empty());

        let mut late = queue.submit(write(2));
        assert_eq!(late.try_outcome(), Some(Outcome::Failed(BusError::Shutdown)));

        let pending = drained.into_iter().next().unwrap();
        assert!(queue.requeue(pending, RetryPlacement::Tail).is_err());
    }

    #[tokio::test]
    async fn test_dropped_pending_reads_as_shutdown() {
        let queue = CommandQueue::default();
        let handle = queue.submit(read(1));
        drop(queue.try_pop());
        assert_eq!(handle.outcome().await, Outcome::Failed(BusError::Shutdown));
    }

    #[tokio::test]
    async fn test_next_waits_for_submission() {
        let queue = Arc::new(CommandQueue::default());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await.map(|p| p.command.kind.address()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());
        queue.submit(read(9));
        assert_eq!(consumer.await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_next_returns_none_after_close() {
        let queue = Arc::new(CommandQueue::default());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(consumer.await.unwrap());
    }
}
