//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::store::{Authority, Certificate, Node, Service, Session, StoreSeed, User};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Identity of this process in the cluster.
    pub node: NodeConfig,

    /// Listener lifecycle settings.
    pub router: RouterSettings,

    /// Host table refresh settings.
    pub proxy: ProxySettings,

    /// Session and single sign-on settings.
    pub auth: AuthSettings,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    pub nodes: Vec<Node>,
    pub services: Vec<Service>,
    pub certificates: Vec<Certificate>,
    pub authorities: Vec<Authority>,
    pub users: Vec<User>,
    pub sessions: Vec<Session>,
}

impl GatewayConfig {
    /// Records handed to the store.
    pub fn store_seed(&self) -> StoreSeed {
        StoreSeed {
            nodes: self.nodes.clone(),
            services: self.services.clone(),
            certificates: self.certificates.clone(),
            authorities: self.authorities.clone(),
            users: self.users.clone(),
            sessions: self.sessions.clone(),
        }
    }

    /// Runtime settings shared with the running subsystems.
    pub fn settings(&self) -> Settings {
        Settings {
            router: self.router.clone(),
            proxy: self.proxy.clone(),
            auth: self.auth.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
        }
    }
}

/// Settings that can change on reload without restarting the process.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub router: RouterSettings,
    pub proxy: ProxySettings,
    pub auth: AuthSettings,
}

/// Settings shared between the config watcher and the running subsystems.
pub type SharedSettings = Arc<ArcSwap<Settings>>;

pub fn shared_settings(settings: Settings) -> SharedSettings {
    Arc::new(ArcSwap::from_pointee(settings))
}

/// Router and listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Request body read timeout in seconds.
    pub read_timeout_secs: u64,

    /// Request header read timeout in seconds.
    pub read_header_timeout_secs: u64,

    /// Response production timeout in seconds.
    pub write_timeout_secs: u64,

    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,

    /// Port of the plain HTTP redirect listener.
    pub redirect_port: u16,

    /// Trust the forwarded-for header even from public peers.
    pub unsafe_remote_header: bool,

    /// Graceful shutdown window per listener before connections are dropped.
    pub shutdown_timeout_ms: u64,

    /// How often the listener fingerprint is recomputed.
    pub fingerprint_interval_ms: u64,

    /// Upper bound of the random delay before a drift restart.
    pub restart_jitter_ms: u64,

    /// Pause after a drift restart before checking again.
    pub post_restart_pause_ms: u64,

    /// Delay before retrying a failed listener init or bind.
    pub retry_delay_ms: u64,

    /// Pause between the restart cycles of a shutdown.
    pub drain_pause_ms: u64,

    /// Grace added to the shutdown window, and the pause after a restart
    /// before the run loop relistens.
    pub restart_settle_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            read_timeout_secs: 300,
            read_header_timeout_secs: 60,
            write_timeout_secs: 300,
            idle_timeout_secs: 60,
            redirect_port: 80,
            unsafe_remote_header: false,
            shutdown_timeout_ms: 1000,
            fingerprint_interval_ms: 1000,
            restart_jitter_ms: 3000,
            post_restart_pause_ms: 2000,
            retry_delay_ms: 1000,
            drain_pause_ms: 1000,
            restart_settle_ms: 250,
        }
    }
}

impl RouterSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn read_header_timeout(&self) -> Duration {
        Duration::from_secs(self.read_header_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn fingerprint_interval(&self) -> Duration {
        Duration::from_millis(self.fingerprint_interval_ms)
    }

    pub fn post_restart_pause(&self) -> Duration {
        Duration::from_millis(self.post_restart_pause_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn drain_pause(&self) -> Duration {
        Duration::from_millis(self.drain_pause_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

/// Proxy refresh settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Host table rebuild interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
        }
    }
}

impl ProxySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Session and single sign-on settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Minimum seconds between two remote syncs of the same user.
    pub sync_interval_secs: u64,

    /// Base URL of the single sign-on server. Unset disables remote sync.
    pub sso_server: Option<String>,

    /// License key sent along with sync requests.
    pub license: String,

    /// Name of the session cookie.
    pub session_cookie: String,

    /// Lifetime of secondary-factor tokens in seconds.
    pub secondary_expire_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            sync_interval_secs: 1800,
            sso_server: None,
            license: String::new(),
            session_cookie: "zero-session".to_string(),
            secondary_expire_secs: 90,
        }
    }
}

impl AuthSettings {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn secondary_expire(&self) -> Duration {
        Duration::from_secs(self.secondary_expire_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
