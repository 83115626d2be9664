//! WebSocket upgrades spliced through the proxy to a raw echo backend.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use zero_gateway::config::Settings;
use zero_gateway::store::StoreSeed;

mod common;

use common::{eventually, seed, EchoBackend, Gateway};

const UPGRADE: &str = "GET /socket HTTP/1.1\r\n\
    Host: app.test\r\n\
    Cookie: zero-session=s1\r\n\
    Connection: Upgrade\r\n\
    Upgrade: websocket\r\n\
    Sec-WebSocket-Version: 13\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

async fn response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "connection closed before response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn gateway(backend: &EchoBackend) -> Gateway {
    let records: StoreSeed =
        toml::from_str(&seed(&[backend.port()], "websockets = true")).unwrap();
    Gateway::start_with(records, Settings::default()).await
}

#[tokio::test]
async fn authorized_upgrade_is_tunnelled_until_stopped() {
    let backend = EchoBackend::start().await;
    let gw = gateway(&backend).await;
    let tunnels = gw.proxy.websockets().clone();

    let mut stream = TcpStream::connect(gw.addr).await.unwrap();
    stream.write_all(UPGRADE.as_bytes()).await.unwrap();

    let head = response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
    assert_eq!(tunnels.open_count(), 1);

    assert_eq!(tunnels.stop_all(), 1);

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let registry = &tunnels;
    eventually("tunnel count", move || async move { registry.open_count() == 0 }).await;
}

#[tokio::test]
async fn upgrade_without_session_is_not_tunnelled() {
    let backend = EchoBackend::start().await;
    let gw = gateway(&backend).await;

    let mut stream = TcpStream::connect(gw.addr).await.unwrap();
    let anonymous = UPGRADE.replace("Cookie: zero-session=s1\r\n", "");
    stream.write_all(anonymous.as_bytes()).await.unwrap();

    let head = response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 401"), "unexpected head: {head}");
    assert_eq!(gw.proxy.websockets().open_count(), 0);
}
