//! WebSocket tunnel tracking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::header::UPGRADE;
use axum::http::HeaderMap;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::sync::broadcast;

use crate::observability::metrics;

/// Whether the request asks for a WebSocket upgrade.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Process-wide set of open tunnels that can be closed at once.
pub struct WebSocketRegistry {
    stop: broadcast::Sender<()>,
    open: AtomicUsize,
}

impl WebSocketRegistry {
    pub fn new() -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            stop,
            open: AtomicUsize::new(0),
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Close every open tunnel. Returns how many were signalled.
    pub fn stop_all(&self) -> usize {
        let count = self.stop.send(()).unwrap_or(0);
        if count > 0 {
            tracing::info!(tunnels = count, "Closing websocket tunnels");
        }
        count
    }

    /// Splice the client and backend connections once both upgrades resolve.
    pub fn spawn_tunnel(self: &Arc<Self>, client: OnUpgrade, backend: OnUpgrade, target: String) {
        let mut stop = self.stop.subscribe();
        let registry = Arc::clone(self);
        registry.track(1);

        tokio::spawn(async move {
            let tunnel = async {
                let (client, backend) = tokio::try_join!(client, backend)?;
                let mut client = TokioIo::new(client);
                let mut backend = TokioIo::new(backend);
                let copied = tokio::io::copy_bidirectional(&mut client, &mut backend).await?;
                Ok::<_, Box<dyn std::error::Error + Send + Sync>>(copied)
            };

            tokio::select! {
                res = tunnel => match res {
                    Ok((to_backend, to_client)) => {
                        tracing::debug!(backend = %target, to_backend, to_client, "Websocket closed");
                    }
                    Err(e) => {
                        tracing::debug!(backend = %target, error = %e, "Websocket closed with error");
                    }
                },
                _ = stop.recv() => {
                    tracing::debug!(backend = %target, "Websocket closed by restart");
                }
            }

            registry.track(-1);
        });
    }

    fn track(&self, delta: isize) {
        let open = if delta > 0 {
            self.open.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.open.fetch_sub(1, Ordering::SeqCst) - 1
        };
        metrics::set_websocket_tunnels(open);
    }
}

impl Default for WebSocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
