//! In-memory store seeded from configuration.

use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{Datelike, DateTime, Days, Utc};
use dashmap::DashMap;
use rcgen::{
    date_time_ymd, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::types::{
    Authority, Certificate, ClientCertificate, Node, Secondary, Service, Session, User,
};
use crate::store::Store;

/// Records loaded from the configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSeed {
    pub nodes: Vec<Node>,
    pub services: Vec<Service>,
    pub certificates: Vec<Certificate>,
    pub authorities: Vec<Authority>,
    pub users: Vec<User>,
    pub sessions: Vec<Session>,
}

/// Thread-safe store backed by a swappable seed plus runtime state.
///
/// Configuration records are replaced wholesale by [`MemoryStore::apply_seed`].
/// Sessions, sync timestamps, whitelist removals and secondary tokens are
/// runtime state and survive a reload. Seed sessions are only loaded once.
pub struct MemoryStore {
    seed: ArcSwap<StoreSeed>,
    sessions: DashMap<String, Session>,
    user_sync: DashMap<String, DateTime<Utc>>,
    removed_whitelists: DashMap<String, ()>,
    secondaries: DashMap<String, Secondary>,
}

impl MemoryStore {
    pub fn new(seed: StoreSeed) -> Self {
        let sessions = DashMap::new();
        for session in &seed.sessions {
            sessions.insert(session.id.clone(), session.clone());
        }

        Self {
            seed: ArcSwap::from_pointee(seed),
            sessions,
            user_sync: DashMap::new(),
            removed_whitelists: DashMap::new(),
            secondaries: DashMap::new(),
        }
    }

    /// Replace configuration records after a reload.
    pub fn apply_seed(&self, seed: StoreSeed) {
        tracing::info!(
            nodes = seed.nodes.len(),
            services = seed.services.len(),
            certificates = seed.certificates.len(),
            "Store seed replaced"
        );
        self.seed.store(std::sync::Arc::new(seed));
    }

    pub fn insert_session(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn node(&self, id: &str) -> Result<Node, StoreError> {
        self.seed
            .load()
            .nodes
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("node", id))
    }

    async fn nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.seed.load().nodes.clone())
    }

    async fn services(&self) -> Result<Vec<Service>, StoreError> {
        let mut services = self.seed.load().services.clone();
        for srvc in services.iter_mut() {
            if self.removed_whitelists.contains_key(&srvc.id) {
                srvc.whitelist_networks.clear();
            }
        }
        Ok(services)
    }

    async fn certificates(&self, ids: &[String]) -> Result<Vec<Certificate>, StoreError> {
        let seed = self.seed.load();
        Ok(ids
            .iter()
            .filter_map(|id| seed.certificates.iter().find(|c| &c.id == id).cloned())
            .collect())
    }

    async fn authority(&self, id: &str) -> Result<Authority, StoreError> {
        self.seed
            .load()
            .authorities
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("authority", id))
    }

    async fn issue_client_certificate(
        &self,
        authority: &Authority,
    ) -> Result<ClientCertificate, StoreError> {
        issue_client_certificate(authority)
    }

    async fn remove_whitelist_networks(&self, service_id: &str) -> Result<(), StoreError> {
        self.removed_whitelists.insert(service_id.to_string(), ());
        Ok(())
    }

    async fn user(&self, id: &str) -> Result<Option<User>, StoreError> {
        let user = self.seed.load().users.iter().find(|u| u.id == id).cloned();
        Ok(user.map(|mut usr| {
            if let Some(at) = self.user_sync.get(&usr.id) {
                usr.last_sync = Some(*at);
            }
            usr
        }))
    }

    async fn update_user_sync(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.user_sync.insert(user_id.to_string(), at);
        Ok(())
    }

    async fn session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn remove_session(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.remove(id);
        Ok(())
    }

    async fn remove_user_sessions(&self, user_id: &str) -> Result<(), StoreError> {
        self.sessions.retain(|_, s| s.user_id != user_id);
        Ok(())
    }

    async fn insert_secondary(&self, secondary: Secondary) -> Result<(), StoreError> {
        self.secondaries.insert(secondary.token.clone(), secondary);
        Ok(())
    }

    async fn secondary(
        &self,
        token: &str,
        kind: &str,
        max_age: Duration,
    ) -> Result<Option<Secondary>, StoreError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| StoreError::Invalid(format!("secondary expiry: {e}")))?;
        let oldest = Utc::now() - max_age;

        Ok(self
            .secondaries
            .get(token)
            .filter(|s| s.kind == kind && s.created >= oldest)
            .map(|s| s.clone()))
    }

    async fn remove_secondary(&self, token: &str) -> Result<(), StoreError> {
        self.secondaries.remove(token);
        Ok(())
    }
}

/// Sign a client-auth leaf certificate with the authority's CA.
fn issue_client_certificate(authority: &Authority) -> Result<ClientCertificate, StoreError> {
    let invalid = |what: &str, e: rcgen::Error| {
        StoreError::Invalid(format!("authority {}: {what}: {e}", authority.id))
    };

    let ca_key = KeyPair::from_pem(&authority.ca_key).map_err(|e| invalid("ca key", e))?;
    let ca_cert = CertificateParams::from_ca_cert_pem(&authority.ca_certificate)
        .map_err(|e| invalid("ca certificate", e))?
        .self_signed(&ca_key)
        .map_err(|e| invalid("ca certificate", e))?;

    let leaf_key = KeyPair::generate().map_err(|e| invalid("key generation", e))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "zero-gateway");
    params.distinguished_name = dn;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

    let today = Utc::now().date_naive();
    let until = today
        .checked_add_days(Days::new(u64::from(authority.client_cert_days.max(1))))
        .unwrap_or(today);
    params.not_before = date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = date_time_ymd(until.year(), until.month() as u8, until.day() as u8);

    let cert = params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .map_err(|e| invalid("signing", e))?;

    Ok(ClientCertificate {
        certificate: cert.pem(),
        key: leaf_key.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, IsCa};

    fn test_authority() -> Authority {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "test ca");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key).unwrap();

        Authority {
            id: "a1".into(),
            name: "ca".into(),
            ca_certificate: cert.pem(),
            ca_key: key.serialize_pem(),
            client_cert_days: 1,
        }
    }

    fn seed() -> StoreSeed {
        StoreSeed {
            users: vec![User {
                id: "u1".into(),
                username: "alice".into(),
                kind: Default::default(),
                roles: vec![],
                disabled: false,
                last_sync: None,
            }],
            sessions: vec![
                Session { id: "s1".into(), user_id: "u1".into(), api: false },
                Session { id: "s2".into(), user_id: "u1".into(), api: false },
                Session { id: "s3".into(), user_id: "u2".into(), api: false },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn remove_user_sessions_only_touches_that_user() {
        let store = MemoryStore::new(seed());
        store.remove_user_sessions("u1").await.unwrap();
        assert!(store.session("s1").await.unwrap().is_none());
        assert!(store.session("s2").await.unwrap().is_none());
        assert!(store.session("s3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_timestamp_survives_seed_reload() {
        let store = MemoryStore::new(seed());
        let now = Utc::now();
        store.update_user_sync("u1", now).await.unwrap();
        store.apply_seed(seed());
        assert_eq!(store.user("u1").await.unwrap().unwrap().last_sync, Some(now));
    }

    #[tokio::test]
    async fn missing_authority_is_not_found() {
        let store = MemoryStore::new(seed());
        let err = store.authority("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn issues_client_certificate_from_authority() {
        let store = MemoryStore::new(seed());
        let cert = store.issue_client_certificate(&test_authority()).await.unwrap();
        assert!(cert.certificate.contains("BEGIN CERTIFICATE"));
        assert!(cert.key.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn garbage_authority_is_invalid() {
        let mut authority = test_authority();
        authority.ca_key = "not a key".into();
        let store = MemoryStore::new(seed());
        let err = store.issue_client_certificate(&authority).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn expired_secondary_is_hidden() {
        let store = MemoryStore::new(seed());
        store
            .insert_secondary(Secondary {
                token: "t1".into(),
                user_id: "u1".into(),
                kind: "proxy".into(),
                provider_id: None,
                created: Utc::now() - chrono::Duration::seconds(120),
            })
            .await
            .unwrap();

        let max_age = Duration::from_secs(60);
        assert!(store.secondary("t1", "proxy", max_age).await.unwrap().is_none());
        assert!(store
            .secondary("t1", "proxy", Duration::from_secs(600))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .secondary("t1", "user", Duration::from_secs(600))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn removed_whitelist_is_persisted() {
        let mut seed = seed();
        seed.services.push(Service {
            id: "svc".into(),
            name: String::new(),
            domains: vec![],
            servers: vec![],
            roles: vec![],
            whitelist_networks: vec!["10.0.0.0/8".into()],
            whitelist_paths: vec![],
            logout_paths: vec![],
            client_authority: None,
            websockets: false,
            disable_csrf_check: false,
        });
        let store = MemoryStore::new(seed);
        store.remove_whitelist_networks("svc").await.unwrap();
        let services = store.services().await.unwrap();
        assert!(services[0].whitelist_networks.is_empty());
    }
}
