//! Role based proxy policy.

use async_trait::async_trait;
use axum::http::request::Parts;

use crate::auth::{AuditFields, PolicyValidator, Validation};
use crate::error::GatewayError;
use crate::store::{Service, User};

/// Denies disabled users, and users sharing no role with a service that
/// declares roles.
pub struct RolePolicy;

#[async_trait]
impl PolicyValidator for RolePolicy {
    async fn validate_proxy(
        &self,
        usr: &User,
        _is_api: bool,
        srvc: &Service,
        _parts: &Parts,
    ) -> Result<Validation, GatewayError> {
        if usr.disabled {
            return Ok(Validation::deny("unauthorized", "Account disabled"));
        }

        if !srvc.roles.is_empty() && !usr.roles.iter().any(|r| srvc.roles.contains(r)) {
            let mut fields = AuditFields::new();
            fields.insert("error".into(), "service_unauthorized".into());
            fields.insert("message".into(), "User does not have access to service".into());
            fields.insert("service".into(), srvc.id.clone());

            return Ok(Validation::deny(
                "service_unauthorized",
                "User does not have access to service",
            )
            .with_audit_fields(fields));
        }

        Ok(Validation::allow())
    }
}
