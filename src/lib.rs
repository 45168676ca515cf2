//! # hmbus
//!
//! Heatmiser V3 thermostat bus arbiter and MQTT bridge. A UH1 wiring centre
//! links a chain of thermostats over a half-duplex RS-485 bus that tolerates
//! exactly one outstanding request; this crate makes every exchange on that
//! bus go through a single arbiter so user commands and periodic polls never
//! collide.
//!
//! ## Features
//!
//! - **Frame codec**: bit-exact V3 request/response frames with CRC-16/CCITT
//! - **Link transport**: serial (8N1) or TCP, one frame per receive, bounded waits
//! - **Command arbiter**: Control-before-Poll priority, retry with backoff, settle delays
//! - **Bridge**: MQTT control topics in, retained state topics and Home Assistant discovery out
//! - **Test doubles**: an in-process thermostat simulator and a fault-injecting link
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hmbus::arbiter::{Arbiter, ArbiterConfig};
//! use hmbus::protocol::{Command, CommandKind};
//! use hmbus::simulator::SimulatedController;
//! use hmbus::zone::{SensorKind, ZoneType};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let (mut arbiter, handle, _outcomes) = Arbiter::new(ArbiterConfig::default());
//! let link = SimulatedController::new().with_thermostat(1, ZoneType::Programmable);
//! let cancel = CancellationToken::new();
//!
//! let read = handle.submit(Command::poll(CommandKind::ReadZone { address: 1, sensor: SensorKind::Air }));
//! let stop = cancel.clone();
//! tokio::spawn(async move { arbiter.run(Box::new(link), &stop).await });
//!
//! println!("{:?}", read.outcome().await);
//! cancel.cancel();
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Frame codec, commands and outcomes
//! - [`link`] - Byte transport to the UH1
//! - [`scheduler`] - Two-band command queue
//! - [`arbiter`] - The single task that owns the link
//! - [`poller`], [`control`] - Producers feeding the arbiter
//! - [`telemetry`] - Outcomes to MQTT state publications
//! - [`bridge`] - Wires everything to a broker

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod arbiter;
pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod fault_injection;
pub mod link;
pub mod logging;
pub mod mqtt;
pub mod poller;
pub mod protocol;
pub mod scheduler;
pub mod simulator;
pub mod telemetry;
pub mod topics;
pub mod zone;

pub use arbiter::{Arbiter, ArbiterConfig, ArbiterHandle, OutcomeRecord};
pub use error::BusError;
pub use link::Link;
pub use protocol::{Command, CommandKind, Outcome, Priority, StateDelta};
pub use zone::{ZoneDirectory, ZoneState};
