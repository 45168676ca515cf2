//! Exclusive half-duplex link to the UH1 wiring centre.
//!
//! A [`Link`] only moves bytes: `send` writes one request, `receive_frame`
//! collects exactly one response frame (3-byte header, then the declared
//! remainder) or times out. Sequencing is the arbiter's job.

use crate::error::BusError;
use crate::protocol::{MAX_RESPONSE_LEN, MIN_RESPONSE_LEN};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::{debug, info, trace};

pub const DEFAULT_BAUD_RATE: u32 = 4800;

/// Silence that ends a drain of stale input.
const DRAIN_QUIET: Duration = Duration::from_millis(20);
const DRAIN_MAX_READS: usize = 64;
const RESPONSE_HEADER_PEEK: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Serial { device: String, baud_rate: u32 },
    Tcp { host: String, port: u16 },
}

impl core::fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LinkTarget::Serial { device, baud_rate } => write!(f, "serial {device} @ {baud_rate} baud"),
            LinkTarget::Tcp { host, port } => write!(f, "tcp {host}:{port}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no complete frame within {0:?}")]
    Timeout(Duration),
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("cannot open {target}: {reason}")]
    Open { target: String, reason: String },
}

impl From<LinkError> for BusError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Timeout(after) => BusError::Timeout(after),
            LinkError::Write(reason) => BusError::LinkWrite(reason),
            other => BusError::LinkDown(other.to_string()),
        }
    }
}

#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;
    async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError>;
    fn describe(&self) -> String;

    /// Buffered input can no longer be trusted; discard it before the next send.
    fn mark_stale(&mut self) {}
}

#[async_trait]
impl<L: Link + ?Sized> Link for Box<L> {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        (**self).send(frame).await
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        (**self).receive_frame(timeout).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn mark_stale(&mut self) {
        (**self).mark_stale();
    }
}

/// Link over any byte stream: a serial port, a TCP socket, or an in-memory pipe.
#[derive(Debug)]
pub struct StreamLink<S> {
    stream: S,
    name: String,
    /// Set after a timeout, a malformed header, or a rejected reply; input may
    /// hold a stale tail.
    dirty: bool,
}

impl<S> StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, name: impl Into<String>) -> Self {
        Self {
            stream,
            name: name.into(),
            dirty: false,
        }
    }

    async fn drain_stale(&mut self) {
        let mut buf = [0u8; 64];
        let mut discarded = 0usize;
        for _ in 0..DRAIN_MAX_READS {
            match tokio::time::timeout(DRAIN_QUIET, self.stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => discarded += n,
                _ => break,
            }
        }
        if discarded > 0 {
            debug!(link = %self.name, discarded, "dropped stale input before send");
        }
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, LinkError> {
        let mut header = [0u8; RESPONSE_HEADER_PEEK];
        self.stream.read_exact(&mut header).await.map_err(read_error)?;

        let declared = usize::from(u16::from_le_bytes([header[1], header[2]]));
        if !(MIN_RESPONSE_LEN..=MAX_RESPONSE_LEN).contains(&declared) {
            // Hand the header to the codec so the failure is classified there.
            self.dirty = true;
            return Ok(header.to_vec());
        }

        let mut frame = vec![0u8; declared];
        frame[..RESPONSE_HEADER_PEEK].copy_from_slice(&header);
        self.stream
            .read_exact(&mut frame[RESPONSE_HEADER_PEEK..])
            .await
            .map_err(read_error)?;
        Ok(frame)
    }
}

fn read_error(err: std::io::Error) -> LinkError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        LinkError::Closed
    } else {
        LinkError::Read(err.to_string())
    }
}

#[async_trait]
impl<S> Link for StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if self.dirty {
            self.drain_stale().await;
            self.dirty = false;
        }
        trace!(link = %self.name, bytes = frame.len(), "tx");
        self.stream
            .write_all(frame)
            .await
            .map_err(|e| LinkError::Write(e.to_string()))?;
        self.stream.flush().await.map_err(|e| LinkError::Write(e.to_string()))
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        match tokio::time::timeout(timeout, self.read_frame()).await {
            Ok(result) => {
                if let Ok(frame) = &result {
                    trace!(link = %self.name, bytes = frame.len(), "rx");
                }
                result
            }
            Err(_) => {
                self.dirty = true;
                Err(LinkError::Timeout(timeout))
            }
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }

    fn mark_stale(&mut self) {
        self.dirty = true;
    }
}

/// Open the configured connection. Serial ports use the V3 line settings (8N1).
pub async fn open(target: &LinkTarget, connect_timeout: Duration) -> Result<Box<dyn Link>, LinkError> {
    match target {
        LinkTarget::Serial { device, baud_rate } => {
            let stream = tokio_serial::new(device.as_str(), *baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .open_native_async()
                .map_err(|e| LinkError::Open {
                    target: target.to_string(),
                    reason: e.to_string(),
                })?;
            info!(%target, "serial link open");
            Ok(Box::new(StreamLink::new(stream, device.clone())))
        }
        LinkTarget::Tcp { host, port } => {
            let addr = format!("{host}:{port}");
            let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| LinkError::Open {
                    target: target.to_string(),
                    reason: format!("connect timed out after {connect_timeout:?}"),
                })?
                .map_err(|e| LinkError::Open {
                    target: target.to_string(),
                    reason: e.to_string(),
                })?;
            stream.set_nodelay(true).map_err(|e| LinkError::Open {
                target: target.to_string(),
                reason: e.to_string(),
            })?;
            info!(%target, "tcp link open");
            Ok(Box::new(StreamLink::new(stream, addr)))
        }
    }
}
