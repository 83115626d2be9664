//! Listener lifecycle of the router over real ports: serving, restart,
//! fingerprint drift and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use zero_gateway::config::Settings;
use zero_gateway::events::{EventBus, CERTIFICATE_CHANGE};
use zero_gateway::router::Router;
use zero_gateway::store::{Certificate, Protocol, StoreSeed};

mod common;

use common::{accepting, eventually, free_port, seed, MockBackend, Wiring};

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.router.fingerprint_interval_ms = 50;
    settings.router.restart_jitter_ms = 20;
    settings.router.post_restart_pause_ms = 20;
    settings.router.drain_pause_ms = 20;
    settings.router.shutdown_timeout_ms = 200;
    settings.router.restart_settle_ms = 20;
    settings.router.retry_delay_ms = 50;
    settings
}

/// Seed whose node listens with plain http on `port` without a redirect listener.
fn node_seed(backend: u16, port: u16) -> StoreSeed {
    let mut records: StoreSeed = toml::from_str(&seed(&[backend], "")).unwrap();
    let node = &mut records.nodes[0];
    node.port = port;
    node.protocol = Some(Protocol::Http);
    node.no_redirect_server = true;
    records
}

struct Running {
    wiring: Wiring,
    router: Arc<Router>,
    events: EventBus,
    run: JoinHandle<()>,
}

async fn run(records: StoreSeed) -> Running {
    let wiring = Wiring::new(records, fast_settings()).await;
    let events = EventBus::new();
    let router = Arc::new(wiring.router(events.clone()));
    let run = tokio::spawn(Arc::clone(&router).run());

    Running {
        wiring,
        router,
        events,
        run,
    }
}

async fn fetch(port: u16) -> Option<String> {
    let client = reqwest::Client::builder()
        .resolve("app.test", SocketAddr::from(([127, 0, 0, 1], port)))
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let resp = client
        .get(format!("http://app.test:{port}/"))
        .header("cookie", "zero-session=s1")
        .send()
        .await
        .ok()?;
    resp.text().await.ok()
}

async fn serves(port: u16) -> bool {
    fetch(port).await.as_deref() == Some("one")
}

#[tokio::test]
async fn restart_closes_connections_and_relistens() {
    let backend = MockBackend::start("one").await;
    let port = free_port().await;
    let node = run(node_seed(backend.port(), port)).await;

    eventually("listener", || serves(port)).await;
    assert_eq!(node.router.active_listeners().await, 1);

    let mut idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    node.router.restart().await;

    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(Duration::from_secs(2), idle.read(&mut buf)).await;
    assert!(matches!(closed, Ok(Ok(0)) | Ok(Err(_))));

    let router = &node.router;
    eventually("relisten", move || async move {
        router.active_listeners().await == 1
    })
    .await;
    eventually("serving after restart", || serves(port)).await;
    assert!(!node.router.is_stopping());
    assert!(!node.run.is_finished());
}

#[tokio::test]
async fn fingerprint_drift_moves_listener_and_announces_certificates() {
    let backend = MockBackend::start("one").await;
    let (old_port, new_port) = (free_port().await, free_port().await);
    let node = run(node_seed(backend.port(), old_port)).await;
    let mut events = node.events.subscribe();

    eventually("listener", || serves(old_port)).await;

    let mut records = node_seed(backend.port(), new_port);
    records.nodes[0].certificates = vec!["c1".into()];
    records.certificates = vec![Certificate {
        id: "c1".into(),
        name: "app".into(),
        certificate: "cert".into(),
        key: "key".into(),
    }];
    node.wiring.store.apply_seed(records);

    eventually("listener on new port", || serves(new_port)).await;
    eventually("old port released", move || async move { !accepting(old_port).await }).await;

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, CERTIFICATE_CHANGE);
}

#[tokio::test]
async fn port_only_drift_publishes_no_certificate_event() {
    let backend = MockBackend::start("one").await;
    let (old_port, new_port) = (free_port().await, free_port().await);
    let node = run(node_seed(backend.port(), old_port)).await;
    let mut events = node.events.subscribe();

    eventually("listener", || serves(old_port)).await;
    node.wiring.store.apply_seed(node_seed(backend.port(), new_port));
    eventually("listener on new port", || serves(new_port)).await;

    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn shutdown_stops_running_loop() {
    let backend = MockBackend::start("one").await;
    let port = free_port().await;
    let node = run(node_seed(backend.port(), port)).await;

    eventually("listener", || serves(port)).await;

    tokio::time::timeout(Duration::from_secs(5), node.router.shutdown())
        .await
        .unwrap();
    assert!(node.router.is_stopping());

    tokio::time::timeout(Duration::from_secs(2), node.run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.router.active_listeners().await, 0);
    assert!(!accepting(port).await);
}
