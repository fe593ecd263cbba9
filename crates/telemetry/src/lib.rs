//! In-memory usage and trace stores for ModelRelay.
//!
//! Both stores are bounded rings behind a single mutex, per-instance by
//! design: external aggregation workers drain them asynchronously, and
//! the gateway never blocks on downstream I/O to record telemetry.

pub mod trace;
pub mod usage;

pub use trace::{TraceEvent, TraceKind, TraceStore};
pub use usage::{UsageRecord, UsageStore};
