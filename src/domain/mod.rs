pub mod context;
pub mod item;

pub use context::TelemetryContext;
pub use item::{EventTelemetry, ExceptionTelemetry, TelemetryItem};
