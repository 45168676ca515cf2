//! Error taxonomy for the bus engine.
//!
//! [`BusError`] is what a command's originator sees in a failed
//! [`Outcome`](crate::protocol::Outcome). Frame-level variants are retried by
//! the arbiter; connection-level variants stop it.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Rejected while building the request; never sent.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("frame truncated: {len} bytes, need at least {min}")]
    Truncated { len: usize, min: usize },

    #[error("length mismatch: declared {declared} bytes, received {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch: computed {computed:#06x}, frame carries {received:#06x}")]
    ChecksumMismatch { computed: u16, received: u16 },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("unexpected function code {actual:#04x}, expected {expected:#04x}")]
    UnexpectedFunctionCode { expected: u8, actual: u8 },

    #[error("response from address {actual}, expected {expected}")]
    UnexpectedAddress { expected: u8, actual: u8 },

    #[error("frame addressed to {0:#04x}, not to the master")]
    ForeignDestination(u8),

    #[error("data block too short: {len} bytes, need {needed}")]
    ShortDataBlock { len: usize, needed: usize },

    #[error("link write failed: {0}")]
    LinkWrite(String),

    #[error("link down: {0}")]
    LinkDown(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetryLimitExceeded { attempts: u32, last: Box<BusError> },

    #[error("command queue full")]
    QueueFull,

    #[error("arbiter shut down")]
    Shutdown,
}

impl BusError {
    /// Frame-level faults caused by bus noise; worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Truncated { .. }
                | BusError::LengthMismatch { .. }
                | BusError::ChecksumMismatch { .. }
                | BusError::Timeout(_)
                | BusError::UnexpectedFunctionCode { .. }
                | BusError::UnexpectedAddress { .. }
                | BusError::ForeignDestination(_)
                | BusError::ShortDataBlock { .. }
        )
    }

    /// The connection itself is gone; the arbiter must stop.
    pub fn is_link_fatal(&self) -> bool {
        matches!(self, BusError::LinkWrite(_) | BusError::LinkDown(_))
    }

    /// Underlying cause, looking through `RetryLimitExceeded`.
    pub fn root_cause(&self) -> &BusError {
        match self {
            BusError::RetryLimitExceeded { last, .. } => last.root_cause(),
            other => other,
        }
    }
}
