//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated)
//!         ├── store_seed() → MemoryStore (nodes, services, certificates, ...)
//!         └── settings()   → SharedSettings (router, proxy, auth)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads and validates new config
//!     → MemoryStore::apply_seed
//!     → atomic swap of Arc<Settings>
//!     → proxy refresh loop and router fingerprint loop observe the change
//! ```
//!
//! # Design Decisions
//! - Node, service and certificate records are store data, not settings;
//!   their changes reach listeners only through the fingerprint check
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - A failed reload keeps the current configuration

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    shared_settings, AuthSettings, GatewayConfig, LogFormat, ObservabilityConfig, ProxySettings,
    RouterSettings, Settings, SharedSettings,
};
pub use watcher::ConfigWatcher;
