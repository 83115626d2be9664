//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → proxy refresh loop exits
//!             → main runs Router::shutdown
//!                 (stop flag, three drain cycles, drift loop exits) → exit
//! ```
//!
//! # Design Decisions
//! - Config reloads come from the file watcher, not SIGHUP
//! - Shutdown is a watch channel so late subscribers still observe it

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_on_signal;
