//! Zero-trust reverse proxy node.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ───────────────▶ redirect listener (:80) ── ACME / 301 to https
//!     ───────────────▶ primary listener (:443, TLS by SNI)
//!                           │
//!                           ▼
//!                      role dispatch ──▶ management / user routers
//!                           │
//!                           ▼
//!                      proxy dispatcher
//!                        │  generation snapshot (hosts + pools)
//!                        │  csrf → whitelist → access gate
//!                        ▼
//!                      backend instance (http / websocket / isolated) ──▶ Backend
//!
//!     background: proxy refresh loop, router fingerprint loop, config watcher
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use zero_gateway::auth::AccessGate;
use zero_gateway::config::{load_config, shared_settings, watcher, ConfigWatcher};
use zero_gateway::events::EventBus;
use zero_gateway::lifecycle::{shutdown_on_signal, Shutdown};
use zero_gateway::observability::{logging, metrics};
use zero_gateway::proxy::{Proxy, WebSocketRegistry};
use zero_gateway::router::Router;
use zero_gateway::store::{MemoryStore, Store};

#[derive(Parser)]
#[command(name = "zero-gateway")]
#[command(about = "Zero-trust reverse proxy node", long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "ZERO_GATEWAY_CONFIG", default_value = "gateway.toml")]
    config: PathBuf,

    /// Node id, overrides `[node] id`.
    #[arg(short, long, env = "ZERO_GATEWAY_NODE_ID")]
    node_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(id) = cli.node_id {
        config.node.id = id;
    }

    logging::init_logging(&config.observability);
    tracing::info!(
        node_id = %config.node.id,
        config = %cli.config.display(),
        "zero-gateway v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let memory = Arc::new(MemoryStore::new(config.store_seed()));
    let store: Arc<dyn Store> = memory.clone();
    let settings = shared_settings(config.settings());

    let (watcher, updates) = ConfigWatcher::new(&cli.config);
    let _watcher = match watcher.run() {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, reload disabled");
            None
        }
    };
    tokio::spawn(watcher::apply_updates(updates, memory, settings.clone()));

    let shutdown = Shutdown::new();
    let events = EventBus::new();
    let gate = AccessGate::reference(store.clone(), settings.clone())?;
    let websockets = Arc::new(WebSocketRegistry::new());

    let proxy = Arc::new(Proxy::new(
        config.node.id.clone(),
        store.clone(),
        settings.clone(),
        gate,
        websockets,
    )?);
    tokio::spawn(proxy.clone().watch(shutdown.clone()));

    let router = Arc::new(Router::new(
        config.node.id.clone(),
        store,
        settings,
        proxy,
        events,
    ));
    let serving = tokio::spawn(router.clone().run());

    shutdown_on_signal(shutdown.clone()).await;

    tracing::info!("Shutting down");
    router.shutdown().await;
    let _ = serving.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
