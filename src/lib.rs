//! Zero-trust reverse proxy library.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod observability;
pub mod proxy;
pub mod router;
pub mod store;

pub use config::GatewayConfig;
pub use error::{GatewayError, StoreError};
pub use lifecycle::Shutdown;
pub use proxy::{Dispatch, Proxy};
pub use router::Router;
