//! Router and server lifecycle.
//!
//! # Data Flow
//! ```text
//! run loop:
//!     start (control lock) → store.node + store.certificates
//!         → redirect listener (optional) + primary listener
//!     wait for both to exit → stop flag? → repeat
//!
//! drift loop (every router.fingerprint_interval_ms):
//!     store.node + store.certificates → Fingerprint
//!     changed → jitter → restart → certificate.change event → pause
//!
//! restart (control lock):
//!     graceful_shutdown(shutdown_timeout) → force close on expiry
//!     → close websocket tunnels → run loop relistens with fresh config
//! ```
//!
//! # Design Decisions
//! - The control lock guards listener transitions only; requests never take it
//! - A restart with no active listeners is a no-op
//! - Listen failures are logged and retried, never fatal

pub mod dispatch;
pub mod fingerprint;
pub mod redirect;
pub mod tls;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{RouterSettings, SharedSettings};
use crate::error::{GatewayError, ListenerError};
use crate::events::{EventBus, CERTIFICATE_CHANGE};
use crate::observability::metrics;
use crate::proxy::Proxy;
use crate::store::{Node, Protocol, Store};

pub use dispatch::RoleRouters;
pub use fingerprint::Fingerprint;
pub use redirect::AcmeChallenges;
pub use tls::SelfCertificate;

/// A running listener task.
struct Listener {
    name: &'static str,
    handle: Handle,
    close: watch::Sender<bool>,
    exited: watch::Receiver<bool>,
}

impl Listener {
    fn spawn(
        name: &'static str,
        addr: SocketAddr,
        tls: Option<RustlsConfig>,
        app: axum::Router,
        settings: RouterSettings,
    ) -> (Self, JoinHandle<()>) {
        let handle = Handle::new();
        let (close, mut closed) = watch::channel(false);
        let (exited_tx, exited) = watch::channel(false);

        let task = tokio::spawn({
            let handle = handle.clone();
            async move {
                loop {
                    let result = serve(addr, tls.clone(), app.clone(), handle.clone(), &settings).await;
                    if *closed.borrow() {
                        break;
                    }

                    match result {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::error!(listener = name, error = %e, "Listener error");
                            tokio::select! {
                                _ = tokio::time::sleep(settings.retry_delay()) => {}
                                _ = closed.changed() => break,
                            }
                        }
                    }
                }

                tracing::debug!(listener = name, address = %addr, "Listener exited");
                let _ = exited_tx.send(true);
            }
        });

        (
            Self {
                name,
                handle,
                close,
                exited,
            },
            task,
        )
    }
}

async fn serve(
    addr: SocketAddr,
    tls: Option<RustlsConfig>,
    app: axum::Router,
    handle: Handle,
    settings: &RouterSettings,
) -> Result<(), ListenerError> {
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let result = match tls {
        Some(tls) => {
            let mut server = axum_server::bind_rustls(addr, tls).handle(handle);
            configure(server.http_builder(), settings);
            server.serve(make_service).await
        }
        None => {
            let mut server = axum_server::bind(addr).handle(handle);
            configure(server.http_builder(), settings);
            server.serve(make_service).await
        }
    };

    result.map_err(|e| ListenerError::from_io(addr, e))
}

/// Connection level timeouts.
fn configure(builder: &mut Builder<TokioExecutor>, settings: &RouterSettings) {
    if !settings.read_header_timeout().is_zero() {
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(settings.read_header_timeout());
    }
    if !settings.idle_timeout().is_zero() {
        builder
            .http2()
            .timer(TokioTimer::new())
            .keep_alive_interval(settings.idle_timeout())
            .keep_alive_timeout(settings.idle_timeout());
    }
}

pub struct Router {
    node_id: String,
    store: Arc<dyn Store>,
    settings: SharedSettings,
    proxy: Arc<Proxy>,
    events: EventBus,
    acme: Arc<AcmeChallenges>,
    routers: RoleRouters,
    self_cert: SelfCertificate,
    node: Arc<ArcSwapOption<Node>>,
    control: Mutex<Vec<Listener>>,
    stop: AtomicBool,
    running: watch::Sender<bool>,
}

impl Router {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn Store>,
        settings: SharedSettings,
        proxy: Arc<Proxy>,
        events: EventBus,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            node_id: node_id.into(),
            store,
            settings,
            proxy,
            events,
            acme: Arc::new(AcmeChallenges::new()),
            routers: RoleRouters::default(),
            self_cert: SelfCertificate::new(),
            node: Arc::new(ArcSwapOption::empty()),
            control: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            running,
        }
    }

    /// Replace the management, user and proxy sub-routers.
    pub fn with_routers(mut self, routers: RoleRouters) -> Self {
        self.routers = routers;
        self
    }

    pub fn acme(&self) -> &Arc<AcmeChallenges> {
        &self.acme
    }

    /// Role dispatch application, as served on the primary listener.
    pub fn app(&self) -> axum::Router {
        dispatch::app(
            self.node.clone(),
            self.proxy.clone(),
            self.routers.clone(),
            &self.settings.load().router,
        )
    }

    /// Number of listeners currently started.
    pub async fn active_listeners(&self) -> usize {
        self.control.lock().await.len()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Serve until [`Router::shutdown`]. Never returns early on listen errors.
    pub async fn run(self: Arc<Self>) {
        self.running.send_replace(true);

        let baseline = match self.fingerprint().await {
            Ok(fp) => Some(fp),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to compute initial node fingerprint");
                None
            }
        };
        let watcher = tokio::spawn(Arc::clone(&self).watch_node(baseline));

        while !self.is_stopping() {
            match self.start().await {
                Ok(tasks) if tasks.is_empty() => continue,
                Ok(tasks) => {
                    for task in tasks {
                        let _ = task.await;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to init web servers");
                    let delay = self.settings.load().router.retry_delay();
                    tokio::time::sleep(delay).await;
                }
            }
        }

        watcher.abort();
        self.running.send_replace(false);
        tracing::info!("Router stopped");
    }

    /// Read the node, build both listeners and start them.
    async fn start(&self) -> Result<Vec<JoinHandle<()>>, GatewayError> {
        let mut active = self.control.lock().await;
        if self.is_stopping() {
            return Ok(Vec::new());
        }

        let node = self.store.node(&self.node_id).await?;
        let certificates = self.store.certificates(&node.certificates).await?;
        let settings = self.settings.load().router.clone();
        self.node.store(Some(Arc::new(node.clone())));

        let port = node.listen_port();
        let protocol = node.listen_protocol();

        let tls = match protocol {
            Protocol::Http => None,
            Protocol::Https => {
                let resolver = tls::build_resolver(&certificates, &self.self_cert)?;
                Some(RustlsConfig::from_config(tls::server_config(resolver)?))
            }
        };

        let mut tasks = Vec::new();

        if port != settings.redirect_port && !node.no_redirect_server {
            tracing::info!(protocol = "http", port = settings.redirect_port, "Starting redirect server");
            let app = redirect::redirect_router(Arc::clone(&self.acme), port);
            let addr = SocketAddr::from(([0, 0, 0, 0], settings.redirect_port));
            let (listener, task) = Listener::spawn("redirect", addr, None, app, settings.clone());
            active.push(listener);
            tasks.push(task);
        }

        tracing::info!(
            protocol = protocol.as_str(),
            port,
            read_timeout = settings.read_timeout_secs,
            write_timeout = settings.write_timeout_secs,
            idle_timeout = settings.idle_timeout_secs,
            read_header_timeout = settings.read_header_timeout_secs,
            "Starting web server"
        );
        let app = dispatch::app(
            self.node.clone(),
            self.proxy.clone(),
            self.routers.clone(),
            &settings,
        );
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let (listener, task) = Listener::spawn("web", addr, tls, app, settings);
        active.push(listener);
        tasks.push(task);

        Ok(tasks)
    }

    /// Stop every listener and close websocket tunnels. The run loop then
    /// relistens with fresh configuration.
    pub async fn restart(&self) {
        let mut active = self.control.lock().await;
        if active.is_empty() {
            tracing::debug!("Restart skipped, no active listeners");
            return;
        }

        let (timeout, settle) = {
            let settings = self.settings.load();
            (settings.router.shutdown_timeout(), settings.router.restart_settle())
        };
        for listener in active.iter() {
            let _ = listener.close.send(true);
            listener.handle.graceful_shutdown(Some(timeout));
        }

        for listener in active.drain(..) {
            let mut exited = listener.exited.clone();
            let stopped = tokio::time::timeout(timeout + settle, exited.wait_for(|e| *e)).await;
            if stopped.is_err() {
                tracing::warn!(listener = listener.name, "Listener did not stop in time, forcing close");
                listener.handle.shutdown();
            }
        }

        self.proxy.websockets().stop_all();
        metrics::record_restart();
        tracing::info!("Router restarted");

        tokio::time::sleep(settle).await;
    }

    /// Stop serving: three restart cycles, then wait for the run loop.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let pause = self.settings.load().router.drain_pause();

        self.restart().await;
        tokio::time::sleep(pause).await;
        self.restart().await;
        tokio::time::sleep(pause).await;
        self.restart().await;

        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }

    async fn fingerprint(&self) -> Result<Fingerprint, GatewayError> {
        let node = self.store.node(&self.node_id).await?;
        let certificates = self.store.certificates(&node.certificates).await?;
        let settings = self.settings.load();

        let fingerprint = Fingerprint::compute(&node, &settings.router, &certificates);
        self.node.store(Some(Arc::new(node)));
        Ok(fingerprint)
    }

    async fn watch_node(self: Arc<Self>, mut last: Option<Fingerprint>) {
        loop {
            let settings = self.settings.load().router.clone();
            tokio::time::sleep(settings.fingerprint_interval()).await;
            if self.is_stopping() {
                break;
            }

            let current = match self.fingerprint().await {
                Ok(fp) => fp,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to compute node fingerprint");
                    continue;
                }
            };

            let Some(previous) = last.replace(current) else {
                continue;
            };
            if previous == current {
                continue;
            }

            tracing::info!(fingerprint = %current.to_hex(), "Node configuration changed");

            if settings.restart_jitter_ms > 0 {
                let jitter = rand::thread_rng().gen_range(0..settings.restart_jitter_ms);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
            if self.is_stopping() {
                break;
            }

            self.restart().await;
            if previous.certificates_changed(&current) {
                self.events.publish(CERTIFICATE_CHANGE);
            }

            tokio::time::sleep(settings.post_restart_pause()).await;
        }
    }
}
