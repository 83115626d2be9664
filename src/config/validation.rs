//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (nodes reference existing services/certificates)
//! - Validate value ranges (intervals > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Bad CIDRs and unparsable certificates are not rejected here; the proxy
//!   and router degrade those items individually at runtime

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::GatewayConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("node {0} is not declared in [[nodes]]")]
    UnknownSelf(String),

    #[error("duplicate {kind} id {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("node {node} references unknown {kind} {id}")]
    UnknownReference {
        node: String,
        kind: &'static str,
        id: String,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("domain {0} is served by more than one service")]
    DuplicateDomain(String),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !config.nodes.iter().any(|n| n.id == config.node.id) {
        errors.push(ValidationError::UnknownSelf(config.node.id.clone()));
    }

    let service_ids = unique_ids(
        "service",
        config.services.iter().map(|s| s.id.as_str()),
        &mut errors,
    );
    let certificate_ids = unique_ids(
        "certificate",
        config.certificates.iter().map(|c| c.id.as_str()),
        &mut errors,
    );
    unique_ids("node", config.nodes.iter().map(|n| n.id.as_str()), &mut errors);

    for node in &config.nodes {
        for id in &node.services {
            if !service_ids.contains(id.as_str()) {
                errors.push(ValidationError::UnknownReference {
                    node: node.id.clone(),
                    kind: "service",
                    id: id.clone(),
                });
            }
        }
        for id in &node.certificates {
            if !certificate_ids.contains(id.as_str()) {
                errors.push(ValidationError::UnknownReference {
                    node: node.id.clone(),
                    kind: "certificate",
                    id: id.clone(),
                });
            }
        }
    }

    let mut domains = HashSet::new();
    for srvc in &config.services {
        for domain in &srvc.domains {
            if !domains.insert(domain.domain.to_lowercase()) {
                errors.push(ValidationError::DuplicateDomain(domain.domain.clone()));
            }
        }
    }

    if config.proxy.poll_interval_ms == 0 {
        errors.push(ValidationError::Zero("proxy.poll_interval_ms"));
    }
    if config.router.fingerprint_interval_ms == 0 {
        errors.push(ValidationError::Zero("router.fingerprint_interval_ms"));
    }
    if config.router.shutdown_timeout_ms == 0 {
        errors.push(ValidationError::Zero("router.shutdown_timeout_ms"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn unique_ids<'a>(
    kind: &'static str,
    ids: impl Iterator<Item = &'a str>,
    errors: &mut Vec<ValidationError>,
) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            errors.push(ValidationError::Duplicate {
                kind,
                id: id.to_string(),
            });
        }
    }
    seen
}
