//! Telemetry: the append-only domain-event sink the engine emits into, and
//! tracing-subscriber initialization for the process.
//!
//! The sink is emission only; aggregation and analytics live elsewhere.

pub mod init;
pub mod sink;

pub use init::{TelemetryConfig, init_telemetry, init_with_config};
pub use sink::{MemoryTelemetrySink, TelemetryEvent, TelemetryEventKind, TelemetrySink, TracingTelemetrySink};
