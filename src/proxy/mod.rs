//! Dynamic host-routing proxy.
//!
//! # Data Flow
//! ```text
//! refresh loop (every proxy.poll_interval_ms)
//!     → store.node(self) → host::rebuild → backend::build_pools
//!     → ArcSwap<Generation>::store           (hosts + pools + origins together)
//!     on error → empty Generation             (nothing reachable)
//!
//! request
//!     → Generation::load (one snapshot per request)
//!     → dispatch::run → Dispatch::Handled | Dispatch::Unhandled
//! ```
//!
//! # Design Decisions
//! - The refresh loop is the only writer; requests never block on it
//! - A failed rebuild never keeps stale routes
//! - The whitelist flag on a host is the only state mutated after publication

pub mod backend;
pub mod dispatch;
pub mod host;
pub mod remote;
pub mod websocket;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{HeaderMap, Request};
use axum::response::Response;

use crate::auth::AccessGate;
use crate::config::SharedSettings;
use crate::error::GatewayError;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::store::{Node, Store};

pub use backend::{BackendClient, BackendInstance, DomainPool, ForwardContext, InstanceMode};
pub use host::{Host, HostTable, Origins};
pub use websocket::WebSocketRegistry;

/// Result of running a request through the proxy.
pub enum Dispatch {
    /// A response was produced.
    Handled(Response),

    /// No identity; the caller answers. Headers written while clearing the
    /// session must be merged into that answer.
    Unhandled(Request<Body>, HeaderMap),
}

/// One coherent snapshot of routing state.
#[derive(Default)]
pub struct Generation {
    pub node: Option<Node>,
    pub hosts: HashMap<String, Arc<Host>>,
    pub pools: HashMap<String, DomainPool>,
    pub origins: Origins,
}

impl Generation {
    pub fn empty() -> Self {
        Self::default()
    }
}

pub struct Proxy {
    node_id: String,
    store: Arc<dyn Store>,
    settings: SharedSettings,
    gate: AccessGate,
    websockets: Arc<WebSocketRegistry>,
    client: BackendClient,
    generation: ArcSwap<Generation>,
}

impl Proxy {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn Store>,
        settings: SharedSettings,
        gate: AccessGate,
        websockets: Arc<WebSocketRegistry>,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            node_id: node_id.into(),
            store,
            settings,
            gate,
            websockets,
            client: backend::build_client(None)?,
            generation: ArcSwap::from_pointee(Generation::empty()),
        })
    }

    /// Current routing snapshot.
    pub fn generation(&self) -> Arc<Generation> {
        self.generation.load_full()
    }

    pub fn websockets(&self) -> &Arc<WebSocketRegistry> {
        &self.websockets
    }

    /// Rebuild and publish a new generation.
    pub async fn update(&self) -> Result<(), GatewayError> {
        let node = self.store.node(&self.node_id).await?;
        let table = host::rebuild(self.store.as_ref(), &node).await?;
        let pools = backend::build_pools(&table.hosts, &node, &self.client)?;

        let hosts = table.hosts.len();
        self.generation.store(Arc::new(Generation {
            node: Some(node),
            hosts: table.hosts,
            pools,
            origins: table.origins,
        }));

        metrics::set_proxy_hosts(hosts);
        tracing::debug!(hosts, "Proxy generation published");
        Ok(())
    }

    /// Publish an empty generation.
    pub fn clear(&self) {
        self.generation.store(Arc::new(Generation::empty()));
        metrics::set_proxy_hosts(0);
    }

    /// Refresh until shutdown. Failures publish an empty generation.
    pub async fn watch(self: Arc<Self>, shutdown: Shutdown) {
        let mut stop = shutdown.subscribe();

        loop {
            if let Err(e) = self.update().await {
                self.clear();
                metrics::record_rebuild_failure();
                tracing::error!(error = %e, "Failed to load proxy state");
            }

            let interval = self.settings.load().proxy.poll_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.wait_for(|stop| *stop) => break,
            }
        }

        tracing::debug!("Proxy refresh loop stopped");
    }

    /// Run a request through the dispatch pipeline.
    pub async fn serve(
        &self,
        req: Request<Body>,
        peer: SocketAddr,
    ) -> Result<Dispatch, GatewayError> {
        let generation = self.generation();
        dispatch::run(self, &generation, req, peer).await
    }
}
