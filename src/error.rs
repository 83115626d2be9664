//! Error types shared across the gateway.

use std::io::ErrorKind;
use std::net::SocketAddr;

use axum::http::StatusCode;
use thiserror::Error;

/// Errors returned by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The backing store could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored record exists but cannot be used.
    #[error("invalid record: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Top-level error for proxy, router and access-gate operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("upgrade failed: {0}")]
    Upgrade(#[from] hyper::Error),

    #[error("sso request failed: {0}")]
    Sso(#[from] reqwest::Error),

    #[error("invalid request: {0}")]
    Http(#[from] axum::http::Error),
}

/// Failure of a listener task. Never fatal; the listener retries.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("listener on {addr} failed: {source}")]
    Serve {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

impl ListenerError {
    pub fn from_io(addr: SocketAddr, source: std::io::Error) -> Self {
        match source.kind() {
            ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable | ErrorKind::PermissionDenied => {
                ListenerError::Bind { addr, source }
            }
            _ => ListenerError::Serve { addr, source },
        }
    }
}

impl GatewayError {
    /// Status code answered to the client when this error ends a request.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Upstream(_) | GatewayError::Upgrade(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
