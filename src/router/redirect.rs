//! Plain HTTP listener: ACME HTTP-01 answers and HTTPS redirects.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use dashmap::DashMap;

use crate::proxy::dispatch::request_host;

pub const ACME_PATH: &str = "/.well-known/acme-challenge/";

const MAX_TOKEN_LEN: usize = 96;

/// Pending ACME HTTP-01 challenges, token to key authorization.
#[derive(Default)]
pub struct AcmeChallenges {
    challenges: DashMap<String, String>,
}

impl AcmeChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.challenges.insert(token.into(), key_authorization.into());
    }

    pub fn remove(&self, token: &str) {
        self.challenges.remove(token);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.challenges.get(token).map(|v| v.clone())
    }
}

#[derive(Clone)]
struct RedirectState {
    acme: Arc<AcmeChallenges>,
    https_port: u16,
}

/// Router served on the redirect port.
pub fn redirect_router(acme: Arc<AcmeChallenges>, https_port: u16) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(RedirectState { acme, https_port })
}

async fn handle(State(state): State<RedirectState>, req: Request) -> Response {
    let path = req.uri().path();

    if let Some(raw) = path.strip_prefix(ACME_PATH) {
        let token = filter_token(raw);
        if !token.is_empty() {
            return match state.acme.get(&token) {
                Some(key_authorization) => {
                    tracing::info!(token = %token, "Acme challenge requested");
                    (StatusCode::OK, key_authorization).into_response()
                }
                None => StatusCode::BAD_REQUEST.into_response(),
            };
        }
    } else if path == "/check" {
        return (StatusCode::OK, "ok").into_response();
    }

    let mut host = request_host(&req);
    if state.https_port != 443 {
        host = format!("{}:{}", host, state.https_port);
    }
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match HeaderValue::from_str(&format!("https://{}{}", host, path_and_query)) {
        Ok(location) => (StatusCode::MOVED_PERMANENTLY, [(LOCATION, location)]).into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// Keep `[A-Za-z0-9_-]`, at most 96 characters.
fn filter_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_TOKEN_LEN)
        .collect()
}
