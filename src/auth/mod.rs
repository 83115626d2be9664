//! Access gate contracts consumed by the proxy dispatcher.
//!
//! # Data Flow
//! ```text
//! request parts
//!     → SessionProvider::authorize   (cookie / bearer token → Authorizer)
//!     → Authorizer::user             (session → user record)
//!     → SsoSync::sync_user           (inactive → all user sessions removed)
//!     → PolicyValidator::validate_proxy
//!         ├── denial → AuditSink::record(ProxyAuthFailed) + Authorizer::clear
//!         └── pass   → forwarded with identity headers
//! ```
//!
//! # Design Decisions
//! - Every collaborator is a trait object so deployments can swap in their
//!   own identity, sync and policy providers
//! - A policy denial is data ([`Validation::denial`]), not an error
//! - Clearing a session mutates persisted state and writes response headers
//!   (for example an expired cookie) into the caller's map

pub mod audit;
pub mod csrf;
pub mod policy;
pub mod session;
pub mod sync;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::config::SharedSettings;
use crate::error::GatewayError;
use crate::store::{Service, Store, User};

pub use audit::{AuditKind, AuditRecord, AuditSink, MemoryAudit, TracingAudit};
pub use policy::RolePolicy;
pub use session::CookieSessions;
pub use sync::RemoteSync;

/// Free-form audit and denial details.
pub type AuditFields = BTreeMap<String, String>;

/// Resolves the identity attached to a request.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn authorize(
        &self,
        service: &Service,
        parts: &Parts,
    ) -> Result<Box<dyn Authorizer>, GatewayError>;
}

/// Identity resolved for one request.
#[async_trait]
pub trait Authorizer: Send + Sync {
    fn is_valid(&self) -> bool;

    /// True for API token sessions.
    fn is_api(&self) -> bool;

    async fn user(&self) -> Result<Option<User>, GatewayError>;

    /// End the session and write any headers the client needs to forget it.
    async fn clear(&self, headers: &mut HeaderMap) -> Result<(), GatewayError>;
}

/// Single sign-on state synchronization.
#[async_trait]
pub trait SsoSync: Send + Sync {
    /// Whether the user is still active upstream.
    async fn sync_user(&self, user: &User) -> Result<bool, GatewayError>;
}

/// Reason a request was refused by policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorData {
    pub error: String,
    pub message: String,
}

/// Outcome of a policy check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    /// Fields recorded with the audit entry of a denial.
    pub audit_fields: Option<AuditFields>,
    pub denial: Option<ErrorData>,
}

impl Validation {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn deny(error: &str, message: &str) -> Self {
        Self {
            audit_fields: None,
            denial: Some(ErrorData {
                error: error.to_string(),
                message: message.to_string(),
            }),
        }
    }

    pub fn with_audit_fields(mut self, fields: AuditFields) -> Self {
        self.audit_fields = Some(fields);
        self
    }
}

#[async_trait]
pub trait PolicyValidator: Send + Sync {
    async fn validate_proxy(
        &self,
        user: &User,
        is_api: bool,
        service: &Service,
        parts: &Parts,
    ) -> Result<Validation, GatewayError>;
}

/// The collaborators consulted on the authorization path.
#[derive(Clone)]
pub struct AccessGate {
    pub sessions: Arc<dyn SessionProvider>,
    pub sync: Arc<dyn SsoSync>,
    pub policy: Arc<dyn PolicyValidator>,
    pub audit: Arc<dyn AuditSink>,
}

impl AccessGate {
    /// Gate built from the bundled implementations.
    pub fn reference(store: Arc<dyn Store>, settings: SharedSettings) -> Result<Self, GatewayError> {
        Ok(Self {
            sessions: Arc::new(CookieSessions::new(store.clone(), settings.clone())),
            sync: Arc::new(RemoteSync::new(store, settings)?),
            policy: Arc::new(RolePolicy),
            audit: Arc::new(TracingAudit),
        })
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }
}
