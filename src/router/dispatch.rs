//! Top-level request dispatch by node role.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;

use crate::config::RouterSettings;
use crate::proxy::dispatch::request_host;
use crate::proxy::{Dispatch, Proxy};
use crate::store::{Node, Role};

/// Handlers mounted for each node role.
#[derive(Clone)]
pub struct RoleRouters {
    pub management: Router,
    pub user: Router,
    /// Answers requests the proxy hands back without identity.
    pub proxy: Router,
}

impl Default for RoleRouters {
    fn default() -> Self {
        Self {
            management: check_router(),
            user: check_router(),
            proxy: check_router()
                .fallback(|| async { (StatusCode::UNAUTHORIZED, "Authentication required") }),
        }
    }
}

fn check_router() -> Router {
    Router::new().route("/check", get(|| async { "ok" }))
}

#[derive(Clone)]
struct DispatchState {
    node: Arc<ArcSwapOption<Node>>,
    proxy: Arc<Proxy>,
    routers: RoleRouters,
}

/// The application served on the primary listener.
#[allow(deprecated)]
pub fn app(
    node: Arc<ArcSwapOption<Node>>,
    proxy: Arc<Proxy>,
    routers: RoleRouters,
    settings: &RouterSettings,
) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(DispatchState {
            node,
            proxy,
            routers,
        })
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyTimeoutLayer::new(nonzero(settings.read_timeout())))
        .layer(TimeoutLayer::new(nonzero(settings.write_timeout())))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Zero disables a timeout.
fn nonzero(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        Duration::MAX
    } else {
        timeout
    }
}

async fn dispatch(State(state): State<DispatchState>, req: Request) -> Response {
    let node = state.node.load_full();

    if let Some(node) = node.as_deref() {
        if let Some(redirect) = forwarded_http_redirect(node, &req) {
            return redirect;
        }

        let host = request_host(&req);
        if node.is_only(Role::Management) {
            return call(&state.routers.management, req).await;
        }
        if node.is_only(Role::User) {
            return call(&state.routers.user, req).await;
        }
        if node.has_role(Role::Management) && host == node.management_domain.to_ascii_lowercase() {
            return call(&state.routers.management, req).await;
        }
        if node.has_role(Role::User) && host == node.user_domain.to_ascii_lowercase() {
            return call(&state.routers.user, req).await;
        }
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    match state.proxy.serve(req, peer).await {
        Ok(Dispatch::Handled(resp)) => resp,
        Ok(Dispatch::Unhandled(req, headers)) => {
            let mut resp = call(&state.routers.proxy, req).await;
            for (name, value) in headers.iter() {
                resp.headers_mut().append(name, value.clone());
            }
            resp
        }
        Err(e) => {
            tracing::error!(error = %e, "Proxy request failed");
            (e.status(), "Internal Server Error").into_response()
        }
    }
}

/// 301 to HTTPS when a load balancer reports the original scheme as http.
fn forwarded_http_redirect(node: &Node, req: &Request) -> Option<Response> {
    let name = node.forwarded_proto_header.as_deref().filter(|h| !h.is_empty())?;
    let proto = req.headers().get(name)?.to_str().ok()?;
    if !proto.eq_ignore_ascii_case("http") {
        return None;
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}{}", request_host(req), path_and_query);
    let location = HeaderValue::from_str(&location).ok()?;
    Some((StatusCode::MOVED_PERMANENTLY, [(LOCATION, location)]).into_response())
}

async fn call(router: &Router, req: Request) -> Response {
    match router.clone().oneshot(req).await {
        Ok(resp) => resp,
        Err(never) => match never {},
    }
}
