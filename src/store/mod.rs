//! Persistence contract.
//!
//! # Data Flow
//! ```text
//! proxy refresh loop ──► nodes / services / authority / issue_client_certificate
//! router drift loop  ──► node / certificates
//! access gate        ──► user / session / remove_* / update_user_sync
//! ```
//!
//! # Design Decisions
//! - The gateway never owns storage; everything goes through [`Store`]
//! - `StoreError::NotFound` is distinguishable so callers can degrade a single
//!   item instead of failing a whole rebuild
//! - [`MemoryStore`] is the reference implementation, seeded from config

pub mod memory;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

pub use memory::{MemoryStore, StoreSeed};
pub use types::{
    Authority, Certificate, ClientCertificate, Domain, Node, Protocol, Role, Secondary, Server,
    Service, Session, User, UserKind,
};

#[async_trait]
pub trait Store: Send + Sync {
    async fn node(&self, id: &str) -> Result<Node, StoreError>;

    async fn nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// All services, whether or not they are bound to a node.
    async fn services(&self) -> Result<Vec<Service>, StoreError>;

    /// Certificates with the given ids. Unknown ids are skipped.
    async fn certificates(&self, ids: &[String]) -> Result<Vec<Certificate>, StoreError>;

    async fn authority(&self, id: &str) -> Result<Authority, StoreError>;

    /// Issue a short-lived client certificate signed by `authority`.
    async fn issue_client_certificate(
        &self,
        authority: &Authority,
    ) -> Result<ClientCertificate, StoreError>;

    /// Permanently clear the whitelist networks of a service.
    async fn remove_whitelist_networks(&self, service_id: &str) -> Result<(), StoreError>;

    async fn user(&self, id: &str) -> Result<Option<User>, StoreError>;

    async fn update_user_sync(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    async fn remove_session(&self, id: &str) -> Result<(), StoreError>;

    async fn remove_user_sessions(&self, user_id: &str) -> Result<(), StoreError>;

    async fn insert_secondary(&self, secondary: Secondary) -> Result<(), StoreError>;

    /// A secondary-factor record of `kind` created less than `max_age` ago.
    async fn secondary(
        &self,
        token: &str,
        kind: &str,
        max_age: Duration,
    ) -> Result<Option<Secondary>, StoreError>;

    async fn remove_secondary(&self, token: &str) -> Result<(), StoreError>;
}
