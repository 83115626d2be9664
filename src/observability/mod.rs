//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, JSON or pretty)
//!     → metrics.rs (counters and gauges)
//!
//! Request spans and ids come from tower_http layers in router::dispatch.
//! Audit records go to the `audit` target (auth::audit::TracingAudit).
//! ```

pub mod logging;
pub mod metrics;
