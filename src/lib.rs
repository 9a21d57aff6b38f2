//! abbd - dual-channel driver for the ABB RAPID motion server
//!
//! The controller runs two socket servers: a motion server that accepts fixed-width
//! command frames and a logger that streams status lines. A [`Session`] owns one
//! connection to each and keeps them independent: a slow reply never blocks telemetry
//! and a telemetry stall never blocks commands.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use abbd::{DriverConfig, LoggingObserver, Session, ZoneSetting};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DriverConfig::load_from_path("config/abbd.yaml")?;
//!     let mut session = Session::connect_with_config(&config, Arc::new(LoggingObserver)).await?;
//!     session.apply_defaults(&config).await?;
//!
//!     session.set_zone(&ZoneSetting::Named("z10".into())).await?;
//!     session.buffer_add(vec![400.0, 0.0, 300.0, 0.0, 0.0, 1.0, 0.0]).await?;
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **ConnectionManager / Session**: bootstrap and lifecycle of both channels
//! - **CommandChannel**: two-class queue drained by a single dispatcher task
//! - **TelemetryReader**: receive loop feeding a [`TelemetryObserver`]
//! - **protocol / commands**: frame encoding and the RAPID command vocabulary
//! - **CommandStream**: stdin line interface used by the `abbd` binary

pub mod channel;
pub mod commands;
pub mod config;
pub mod error;
pub mod json_output;
mod net;
pub mod pose;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod units;

pub use channel::{ChannelOptions, ChannelStats, CommandChannel, CommandTicket, QueueOrder};
pub use commands::ZoneSetting;
pub use config::{DriverConfig, Timeouts};
pub use error::{AbbError, Result};
pub use pose::{Pose, PoseInput};
pub use protocol::{encode, Command, FieldSpec, Frame, Opcode, Reply};
pub use session::{ConnectionManager, Endpoints, Session, SessionState};
pub use stream::{CommandStream, StreamCommand};
pub use telemetry::{
    ConsoleObserver, FnObserver, LoggingObserver, NoOpObserver, RecordParser, TelemetryObserver,
    TelemetryParser, TelemetryRecord, WatchObserver,
};
pub use units::{AngularUnit, CoordinateTransform, LinearUnit};
