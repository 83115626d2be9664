//! Append-only audit sinks.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuditFields;
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ProxyAuthFailed,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ProxyAuthFailed => "proxy_auth_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub kind: AuditKind,
    pub fields: AuditFields,
    pub remote_addr: String,
    pub user_agent: String,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), GatewayError>;
}

/// Emits records on the `audit` tracing target.
pub struct TracingAudit;

#[async_trait]
impl AuditSink for TracingAudit {
    async fn record(&self, record: AuditRecord) -> Result<(), GatewayError> {
        let fields = serde_json::to_string(&record.fields).unwrap_or_default();
        tracing::info!(
            target: "audit",
            audit_id = %record.id,
            timestamp = %record.timestamp.to_rfc3339(),
            user_id = %record.user_id,
            kind = record.kind.as_str(),
            fields = %fields,
            remote_addr = %record.remote_addr,
            user_agent = %record.user_agent,
            "Audit event"
        );
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemoryAudit {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAudit {
    async fn record(&self, record: AuditRecord) -> Result<(), GatewayError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_audit_appends() {
        let audit = MemoryAudit::new();
        let record = AuditRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_id: "u1".into(),
            kind: AuditKind::ProxyAuthFailed,
            fields: AuditFields::new(),
            remote_addr: "10.0.0.1".into(),
            user_agent: "curl".into(),
        };
        audit.record(record.clone()).await.unwrap();
        TracingAudit.record(record.clone()).await.unwrap();
        assert_eq!(audit.records(), vec![record]);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&AuditKind::ProxyAuthFailed).unwrap();
        assert_eq!(json, "\"proxy_auth_failed\"");
    }
}
