//! Tracing setup for the gateway: fmt logging, optional OTLP export and a
//! log filter that can be swapped at runtime.

pub mod config;
pub mod level;
pub mod otlp;
pub mod spans;

pub use config::{OtlpProtocol, TracingConfig};
pub use level::{LogLevelHandle, TracingError};
pub use otlp::{init_tracing, TracingGuard};
