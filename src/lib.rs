#![warn(rust_2018_idioms)]

//! Durable client-side telemetry. Accepted items are serialized,
//! persisted to a disk spool, and drained to an HTTP ingest endpoint by a
//! background transmitter that survives crashes, outages, and restarts
//! without losing committed events or taking the host down with it.

pub mod channel;
pub mod clock;
pub mod domain;
pub mod sender;
pub mod spool;
pub mod stats;
pub mod transmitter;

pub use channel::{ChannelConfig, ChannelError, FILE_SINK_ENV, OPTOUT_ENV, TelemetryChannel};
pub use domain::{EventTelemetry, ExceptionTelemetry, TelemetryItem};
pub use spool::{Spool, SpoolConfig, Transmission};
pub use stats::ChannelStats;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
