//! Persisted records consumed by the proxy and router.
//!
//! All records deserialize from the `[[nodes]]`, `[[services]]`, ... tables of
//! the configuration file so that [`MemoryStore`](super::MemoryStore) can be
//! seeded directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Management,
    User,
    Proxy,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Management => "management",
            Role::User => "user",
            Role::Proxy => "proxy",
        }
    }
}

/// Listener or backend protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    #[default]
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// A gateway node and its listener settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Node {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Declared roles. An empty list behaves as a pure proxy node.
    #[serde(default)]
    pub roles: Vec<Role>,

    #[serde(default)]
    pub management_domain: String,

    #[serde(default)]
    pub user_domain: String,

    /// Primary listener port, 0 selects 443.
    #[serde(default)]
    pub port: u16,

    /// Primary listener protocol, unset selects https.
    #[serde(default)]
    pub protocol: Option<Protocol>,

    #[serde(default)]
    pub no_redirect_server: bool,

    /// Header carrying the client address when running behind a load balancer.
    #[serde(default)]
    pub forwarded_for_header: Option<String>,

    /// Header carrying the original scheme when running behind a load balancer.
    #[serde(default)]
    pub forwarded_proto_header: Option<String>,

    /// Ids of services served by this node.
    #[serde(default)]
    pub services: Vec<String>,

    /// Ids of TLS certificates installed on this node.
    #[serde(default)]
    pub certificates: Vec<String>,
}

impl Node {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// True when the node declares exactly one role.
    pub fn is_only(&self, role: Role) -> bool {
        !self.roles.is_empty() && self.roles.iter().all(|r| *r == role)
    }

    pub fn listen_port(&self) -> u16 {
        if self.port == 0 {
            443
        } else {
            self.port
        }
    }

    pub fn listen_protocol(&self) -> Protocol {
        self.protocol.unwrap_or_default()
    }
}

/// Public domain under which a service is exposed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Domain {
    pub domain: String,

    /// Host header sent to the backend, defaults to the public domain.
    #[serde(default)]
    pub host: Option<String>,
}

/// One backend server of a service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Server {
    #[serde(default)]
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
}

/// A proxied service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Service {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub domains: Vec<Domain>,

    #[serde(default)]
    pub servers: Vec<Server>,

    /// Roles allowed through the default role policy.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Client networks allowed to bypass authentication (CIDR).
    #[serde(default)]
    pub whitelist_networks: Vec<String>,

    /// Path patterns reachable without identity.
    #[serde(default)]
    pub whitelist_paths: Vec<String>,

    /// Path patterns that end the session.
    #[serde(default)]
    pub logout_paths: Vec<String>,

    /// Authority issuing the client certificate used for mTLS to backends.
    #[serde(default)]
    pub client_authority: Option<String>,

    #[serde(default)]
    pub websockets: bool,

    #[serde(default)]
    pub disable_csrf_check: bool,
}

impl Service {
    pub fn match_whitelist_path(&self, path: &str) -> bool {
        self.whitelist_paths.iter().any(|p| match_path(p, path))
    }

    pub fn match_logout_path(&self, path: &str) -> bool {
        self.logout_paths.iter().any(|p| match_path(p, path))
    }
}

/// Exact match, or prefix match when the pattern ends in `*`.
fn match_path(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

/// A TLS server certificate with its private key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Certificate {
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub certificate: String,
    pub key: String,
}

impl Certificate {
    /// Hex digest over certificate and key content.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.certificate.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Certificate authority able to issue backend client certificates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Authority {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// PEM encoded CA certificate.
    pub ca_certificate: String,

    /// PEM encoded CA private key.
    pub ca_key: String,

    /// Validity of issued client certificates.
    #[serde(default = "default_client_cert_days")]
    pub client_cert_days: u32,
}

fn default_client_cert_days() -> u32 {
    1
}

/// A freshly issued client certificate, PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub certificate: String,
    pub key: String,
}

/// Account type, decides whether single sign-on state is synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserKind {
    #[default]
    Local,
    Google,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,

    #[serde(default)]
    pub kind: UserKind,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub disabled: bool,

    /// Last successful single sign-on synchronization.
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,

    /// Sessions created for API tokens rather than browsers.
    #[serde(default)]
    pub api: bool,
}

/// Pending secondary-factor challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secondary {
    pub token: String,
    pub user_id: String,
    pub kind: String,
    pub provider_id: Option<String>,
    pub created: DateTime<Utc>,
}
