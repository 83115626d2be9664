//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use zero_gateway::auth::{AccessGate, MemoryAudit};
use zero_gateway::config::{shared_settings, Settings, SharedSettings};
use zero_gateway::events::EventBus;
use zero_gateway::proxy::{Proxy, WebSocketRegistry};
use zero_gateway::router::Router;
use zero_gateway::store::{MemoryStore, Store, StoreSeed};

/// Raw TCP backend answering with its name, counting requests.
pub struct MockBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub async fn start(name: &'static str) -> Self {
        Self::start_with_status(name, "200 OK").await
    }

    /// Backend answering every request with `status`, e.g. `"503 Service Unavailable"`.
    pub async fn start_with_status(name: &'static str, status: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let (h, r) = (hits.clone(), requests.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (h, r) = (h.clone(), r.clone());
                tokio::spawn(async move {
                    handle(socket, name, status, h, r).await;
                });
            }
        });

        Self {
            addr,
            hits,
            requests,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Lowercased request head of the most recent request.
    pub fn last_request(&self) -> Option<String> {
        self.requests.lock().unwrap().last().cloned()
    }
}

async fn read_head(socket: &mut TcpStream) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < 64 * 1024 {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    Some(head)
}

async fn handle(
    mut socket: TcpStream,
    name: &'static str,
    status: &'static str,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let Some(head) = read_head(&mut socket).await else {
        return;
    };

    hits.fetch_add(1, Ordering::SeqCst);
    requests
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&head).to_lowercase());

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        name.len(),
        name
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Raw TCP backend accepting every WebSocket upgrade and echoing the
/// upgraded stream byte for byte.
pub struct EchoBackend {
    pub addr: SocketAddr,
}

impl EchoBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if read_head(&mut socket).await.is_none() {
                        return;
                    }
                    let switching = "HTTP/1.1 101 Switching Protocols\r\n\
                        Connection: Upgrade\r\n\
                        Upgrade: websocket\r\n\r\n";
                    if socket.write_all(switching.as_bytes()).await.is_err() {
                        return;
                    }

                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self { addr }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Port that was free a moment ago.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `check` every 20ms until it holds, failing after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether something accepts connections on the local `port`.
pub async fn accepting(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

/// Store, settings, gate and proxy wired the way the binary wires them.
pub struct Wiring {
    pub store: Arc<MemoryStore>,
    pub settings: SharedSettings,
    pub proxy: Arc<Proxy>,
    pub audit: Arc<MemoryAudit>,
}

impl Wiring {
    pub async fn new(seed: StoreSeed, settings: Settings) -> Self {
        let store = Arc::new(MemoryStore::new(seed));
        let dyn_store: Arc<dyn Store> = store.clone();
        let settings = shared_settings(settings);

        let audit = Arc::new(MemoryAudit::new());
        let gate = AccessGate::reference(dyn_store.clone(), settings.clone())
            .unwrap()
            .with_audit(audit.clone());

        let proxy = Arc::new(
            Proxy::new(
                "n1",
                dyn_store.clone(),
                settings.clone(),
                gate,
                Arc::new(WebSocketRegistry::new()),
            )
            .unwrap(),
        );
        proxy.update().await.unwrap();

        Self {
            store,
            settings,
            proxy,
            audit,
        }
    }

    pub fn router(&self, events: EventBus) -> Router {
        let store: Arc<dyn Store> = self.store.clone();
        Router::new("n1", store, self.settings.clone(), self.proxy.clone(), events)
    }
}

/// A proxy node serving the role dispatch app on a local port.
pub struct Gateway {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub proxy: Arc<Proxy>,
    pub audit: Arc<MemoryAudit>,
}

impl Gateway {
    pub async fn start(seed: &str) -> Self {
        Self::start_with(toml::from_str(seed).unwrap(), Settings::default()).await
    }

    pub async fn start_with(seed: StoreSeed, settings: Settings) -> Self {
        let wiring = Wiring::new(seed, settings).await;
        let app = wiring.router(EventBus::new()).app();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            addr,
            store: wiring.store,
            proxy: wiring.proxy,
            audit: wiring.audit,
        }
    }

    /// Client resolving `domain` to this gateway, without redirects.
    pub fn client(&self, domain: &str) -> reqwest::Client {
        reqwest::Client::builder()
            .resolve(domain, self.addr)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    pub fn url(&self, domain: &str, path: &str) -> String {
        format!("http://{}:{}{}", domain, self.addr.port(), path)
    }
}

/// Seed with node `n1` serving `app.test` from the given backend ports.
/// `service_extra` is appended to the `[[services]]` table.
pub fn seed(ports: &[u16], service_extra: &str) -> String {
    let servers = ports
        .iter()
        .map(|p| format!(r#"{{ protocol = "http", hostname = "127.0.0.1", port = {p} }}"#))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"
        [[nodes]]
        id = "n1"
        roles = ["proxy"]
        services = ["svc"]
        forwarded_for_header = "X-Real-IP"

        [[users]]
        id = "u1"
        username = "alice"
        roles = ["staff"]

        [[users]]
        id = "u2"
        username = "mallory"
        roles = ["guest"]

        [[sessions]]
        id = "s1"
        user_id = "u1"

        [[sessions]]
        id = "s2"
        user_id = "u2"

        [[services]]
        id = "svc"
        domains = [{{ domain = "app.test" }}]
        servers = [{servers}]
        roles = ["staff"]
        {service_extra}
        "#
    )
}
