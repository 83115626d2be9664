//! Per-request decision pipeline.
//!
//! Steps run strictly in order and the first match wins:
//!
//! 1. unknown domain or empty pool → `/check` 200, otherwise 404
//! 2. cross-site check → 401 on failure
//! 3. client address safety and whitelisted networks → direct forward
//! 4. whitelisted path → isolated forward without identity
//! 5. session, single sign-on sync and policy → `Unhandled` on failure
//! 6. authorized WebSocket upgrade → websocket forward
//! 7. logout path → session cleared, 302 to `/`
//! 8. default → http forward with identity

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::header::{LOCATION, USER_AGENT};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use uuid::Uuid;

use crate::auth::{csrf, AuditFields, AuditKind, AuditRecord, Authorizer};
use crate::error::GatewayError;
use crate::observability::metrics;
use crate::proxy::backend::{self, BackendInstance, ForwardContext, InstanceMode};
use crate::proxy::remote;
use crate::proxy::websocket::is_upgrade;
use crate::proxy::{Dispatch, Generation, Proxy};
use crate::store::User;

pub(crate) async fn run(
    proxy: &Proxy,
    generation: &Generation,
    req: Request<Body>,
    peer: SocketAddr,
) -> Result<Dispatch, GatewayError> {
    let domain = request_host(&req);

    let (Some(node), Some(host), Some(pool)) = (
        generation.node.as_ref(),
        generation.hosts.get(&domain),
        generation.pools.get(&domain).filter(|p| !p.http.is_empty()),
    ) else {
        metrics::record_request("not_found");
        if req.uri().path() == "/check" {
            return Ok(Dispatch::Handled((StatusCode::OK, "ok").into_response()));
        }
        return Ok(Dispatch::Handled(StatusCode::NOT_FOUND.into_response()));
    };

    let (parts, body) = req.into_parts();
    let upgrade = is_upgrade(&parts.headers);

    if !host.service.disable_csrf_check && !csrf::check(&host.domain.domain, &parts) {
        tracing::warn!(domain = %domain, method = %parts.method, "Cross-site request blocked");
        metrics::record_request("csrf");
        return Ok(Dispatch::Handled(
            (StatusCode::UNAUTHORIZED, "CSRF check failed").into_response(),
        ));
    }

    let remote = remote::resolve(&parts.headers, peer, node.forwarded_for_header.as_deref());
    let client_ip = remote.ip;

    if host.whitelist_active() {
        if !remote.valid {
            tracing::error!(
                service_id = %host.service.id,
                "Unsafe access on whitelisted networks with unset forwarded header, disabling whitelisted networks"
            );
            host.disable_whitelist();
            proxy
                .store
                .remove_whitelist_networks(&host.service.id)
                .await?;
        } else if remote.from_header
            && !proxy.settings.load().router.unsafe_remote_header
            && !remote::is_private(peer.ip())
        {
            tracing::error!(
                service_id = %host.service.id,
                remote_address = %peer.ip(),
                header_remote_address = %remote.ip,
                "Blocking remote header address whitelist check"
            );
        } else if host.whitelisted(remote.ip) {
            let instance = if upgrade {
                pool.pick(InstanceMode::WebSocket)
            } else {
                None
            };
            let instance = instance.or_else(|| pool.pick(InstanceMode::Http));
            if let Some(instance) = instance {
                let ctx = ForwardContext {
                    client_ip,
                    user: None,
                };
                return forward(proxy, &instance, Request::from_parts(parts, body), &ctx, "whitelist").await;
            }
        }
    }

    if host.service.match_whitelist_path(parts.uri.path()) {
        if let Some(instance) = pool.pick(InstanceMode::Isolated) {
            let ctx = ForwardContext {
                client_ip,
                user: None,
            };
            return forward(proxy, &instance, Request::from_parts(parts, body), &ctx, "isolated").await;
        }
    }

    let authr = proxy.gate.sessions.authorize(&host.service, &parts).await?;
    let mut headers = HeaderMap::new();

    if !authr.is_valid() {
        return unhandled(authr.as_ref(), parts, body, headers).await;
    }

    let Some(usr) = authr.user().await? else {
        return unhandled(authr.as_ref(), parts, body, headers).await;
    };

    if !proxy.gate.sync.sync_user(&usr).await? {
        proxy.store.remove_user_sessions(&usr.id).await?;
        return unhandled(authr.as_ref(), parts, body, headers).await;
    }

    let validation = proxy
        .gate
        .policy
        .validate_proxy(&usr, authr.is_api(), &host.service, &parts)
        .await?;

    if let Some(denial) = validation.denial {
        authr.clear(&mut headers).await?;

        let mut fields = validation.audit_fields.unwrap_or_else(|| {
            AuditFields::from([
                ("error".to_string(), denial.error.clone()),
                ("message".to_string(), denial.message.clone()),
            ])
        });
        fields.insert("method".into(), "check".into());

        proxy
            .gate
            .audit
            .record(audit_record(&usr, fields, client_ip, &parts))
            .await?;

        tracing::info!(
            user_id = %usr.id,
            service_id = %host.service.id,
            error = %denial.error,
            "Proxy authorization denied"
        );
        metrics::record_request("unhandled");
        return Ok(Dispatch::Unhandled(Request::from_parts(parts, body), headers));
    }

    let ctx = ForwardContext {
        client_ip,
        user: Some(usr),
    };

    if upgrade {
        if let Some(instance) = pool.pick(InstanceMode::WebSocket) {
            return forward(proxy, &instance, Request::from_parts(parts, body), &ctx, "websocket").await;
        }
    }

    if host.service.match_logout_path(parts.uri.path()) {
        authr.clear(&mut headers).await?;
        let mut resp = (StatusCode::FOUND, headers).into_response();
        resp.headers_mut()
            .insert(LOCATION, HeaderValue::from_static("/"));
        metrics::record_request("logout");
        return Ok(Dispatch::Handled(resp));
    }

    match pool.pick(InstanceMode::Http) {
        Some(instance) => {
            forward(proxy, &instance, Request::from_parts(parts, body), &ctx, "forwarded").await
        }
        None => Ok(Dispatch::Handled(StatusCode::NOT_FOUND.into_response())),
    }
}

/// Clear the session and hand the request back to the caller.
async fn unhandled(
    authr: &dyn Authorizer,
    parts: Parts,
    body: Body,
    mut headers: HeaderMap,
) -> Result<Dispatch, GatewayError> {
    authr.clear(&mut headers).await?;
    metrics::record_request("unhandled");
    Ok(Dispatch::Unhandled(Request::from_parts(parts, body), headers))
}

/// Forward to `instance`. Backend failures answer 502 and are not retried.
async fn forward(
    proxy: &Proxy,
    instance: &BackendInstance,
    req: Request<Body>,
    ctx: &ForwardContext,
    outcome: &'static str,
) -> Result<Dispatch, GatewayError> {
    match instance.forward(req, ctx, &proxy.websockets).await {
        Ok(resp) => {
            metrics::record_request(outcome);
            Ok(Dispatch::Handled(resp))
        }
        Err(e) if e.status() == StatusCode::BAD_GATEWAY => {
            tracing::warn!(
                backend = %backend::describe(instance),
                error = %e,
                "Upstream request failed"
            );
            metrics::record_request("upstream_error");
            Ok(Dispatch::Handled(
                (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response(),
            ))
        }
        Err(e) => Err(e),
    }
}

fn audit_record(
    usr: &User,
    fields: AuditFields,
    client_ip: std::net::IpAddr,
    parts: &Parts,
) -> AuditRecord {
    AuditRecord {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        user_id: usr.id.clone(),
        kind: AuditKind::ProxyAuthFailed,
        fields,
        remote_addr: client_ip.to_string(),
        user_agent: parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    }
}

/// Lowercase request host without port.
pub fn request_host<B>(req: &Request<B>) -> String {
    let raw = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default();
    strip_port(raw).to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
