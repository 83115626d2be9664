//! Backend pools and request forwarding.
//!
//! Every host gets one [`DomainPool`] holding an instance per backend server
//! and mode. Pools are rebuilt wholesale with the host table; instances are
//! never mutated after construction.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::GatewayError;
use crate::proxy::host::Host;
use crate::proxy::websocket::{is_upgrade, WebSocketRegistry};
use crate::store::{ClientCertificate, Node, Protocol, Server, User};

pub type BackendClient = Client<HttpsConnector<HttpConnector>, Body>;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_PORT: &str = "x-forwarded-port";
pub const X_FORWARDED_USER: &str = "x-forwarded-user";
pub const X_FORWARDED_USER_ID: &str = "x-forwarded-user-id";

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceMode {
    Http,
    WebSocket,
    /// Whitelisted-path bypass, forwarded without identity.
    Isolated,
}

/// Identity and addressing attached to a forwarded request.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub client_ip: IpAddr,
    pub user: Option<User>,
}

pub struct BackendInstance {
    pub mode: InstanceMode,

    /// Front-side listener protocol, sent as `X-Forwarded-Proto`.
    pub protocol: Protocol,

    /// Front-side listener port, sent as `X-Forwarded-Port`.
    pub port: u16,

    /// `scheme://hostname:port` of the backend server.
    pub target: Uri,

    host: Arc<Host>,
    client: BackendClient,
}

impl BackendInstance {
    fn new(
        mode: InstanceMode,
        node: &Node,
        host: &Arc<Host>,
        server: &Server,
        client: &BackendClient,
    ) -> Result<Self, GatewayError> {
        let target = Uri::builder()
            .scheme(server.protocol.as_str())
            .authority(format!("{}:{}", server.hostname, server.port))
            .path_and_query("/")
            .build()?;

        Ok(Self {
            mode,
            protocol: node.listen_protocol(),
            port: node.listen_port(),
            target,
            host: Arc::clone(host),
            client: client.clone(),
        })
    }

    /// Forward `req` and stream the backend response back.
    ///
    /// WebSocket instances keep the upgrade headers and splice the upgraded
    /// connections through `websockets` once the backend answers 101.
    pub async fn forward(
        &self,
        mut req: Request<Body>,
        ctx: &ForwardContext,
        websockets: &Arc<WebSocketRegistry>,
    ) -> Result<Response<Body>, GatewayError> {
        let upgrade = self.mode == InstanceMode::WebSocket && is_upgrade(req.headers());
        let upgrade_value = req.headers().get(header::UPGRADE).cloned();
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

        let original_host = req
            .headers()
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                req.uri()
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        let uri = self.target_uri(req.uri())?;
        *req.uri_mut() = uri;
        *req.version_mut() = axum::http::Version::HTTP_11;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        headers.remove(X_FORWARDED_USER);
        headers.remove(X_FORWARDED_USER_ID);

        if let Ok(value) = HeaderValue::from_str(&ctx.client_ip.to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = &original_host {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(self.protocol.as_str()),
        );
        headers.insert(X_FORWARDED_PORT, HeaderValue::from(self.port));

        if let Some(usr) = &ctx.user {
            if let Ok(value) = HeaderValue::from_str(&usr.username) {
                headers.insert(X_FORWARDED_USER, value);
            }
            if let Ok(value) = HeaderValue::from_str(&usr.id) {
                headers.insert(X_FORWARDED_USER_ID, value);
            }
        }

        match self.host.domain.host.as_deref().filter(|h| !h.is_empty()) {
            Some(rewrite) => {
                let value = HeaderValue::from_str(rewrite).map_err(axum::http::Error::from)?;
                headers.insert(header::HOST, value);
            }
            None => {
                if let Some(host) = original_host {
                    headers.insert(header::HOST, host);
                }
            }
        }

        if let (Some(_), Some(value)) = (&client_upgrade, upgrade_value) {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, value);
        }

        tracing::debug!(
            backend = %self.target,
            mode = ?self.mode,
            uri = %req.uri(),
            "Forwarding request"
        );

        let mut resp = self.client.request(req).await?;

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let backend_upgrade = hyper::upgrade::on(&mut resp);
                websockets.spawn_tunnel(client_upgrade, backend_upgrade, self.target.to_string());
            }
        } else {
            strip_hop_by_hop(resp.headers_mut());
        }

        Ok(resp.map(Body::new))
    }

    fn target_uri(&self, original: &Uri) -> Result<Uri, GatewayError> {
        let path = original
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        let mut parts = self.target.clone().into_parts();
        parts.path_and_query = Some(path);
        Uri::from_parts(parts).map_err(|e| GatewayError::Http(e.into()))
    }
}

/// Remove hop-by-hop headers, including those named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Backend instances of one domain.
#[derive(Default)]
pub struct DomainPool {
    pub http: Vec<Arc<BackendInstance>>,
    pub websocket: Vec<Arc<BackendInstance>>,
    pub isolated: Vec<Arc<BackendInstance>>,
}

impl DomainPool {
    pub fn instances(&self, mode: InstanceMode) -> &[Arc<BackendInstance>] {
        match mode {
            InstanceMode::Http => &self.http,
            InstanceMode::WebSocket => &self.websocket,
            InstanceMode::Isolated => &self.isolated,
        }
    }

    /// A uniformly random instance of `mode`.
    pub fn pick(&self, mode: InstanceMode) -> Option<Arc<BackendInstance>> {
        let instances = self.instances(mode);
        if instances.is_empty() {
            return None;
        }
        Some(Arc::clone(&instances[fastrand::usize(..instances.len())]))
    }
}

/// Build the pools for every host.
///
/// Hosts carrying a client certificate get their own mTLS client; all other
/// instances share `shared`.
pub fn build_pools(
    hosts: &HashMap<String, Arc<Host>>,
    node: &Node,
    shared: &BackendClient,
) -> Result<HashMap<String, DomainPool>, GatewayError> {
    let mut pools = HashMap::with_capacity(hosts.len());

    for (domain, host) in hosts {
        let client = match &host.client_certificate {
            Some(cert) => build_client(Some(cert))?,
            None => shared.clone(),
        };

        let mut pool = DomainPool::default();
        for server in &host.service.servers {
            pool.http.push(Arc::new(BackendInstance::new(
                InstanceMode::Http,
                node,
                host,
                server,
                &client,
            )?));
            if host.service.websockets {
                pool.websocket.push(Arc::new(BackendInstance::new(
                    InstanceMode::WebSocket,
                    node,
                    host,
                    server,
                    &client,
                )?));
            }
            pool.isolated.push(Arc::new(BackendInstance::new(
                InstanceMode::Isolated,
                node,
                host,
                server,
                &client,
            )?));
        }

        pools.insert(domain.clone(), pool);
    }

    Ok(pools)
}

/// HTTP/HTTPS client for backends, optionally presenting a client certificate.
pub fn build_client(cert: Option<&ClientCertificate>) -> Result<BackendClient, GatewayError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots);

    let tls = match cert {
        Some(cert) => {
            let (chain, key) = parse_client_certificate(cert)?;
            builder.with_client_auth_cert(chain, key)?
        }
        None => builder.with_no_client_auth(),
    };

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .build();

    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

fn parse_client_certificate(
    cert: &ClientCertificate,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), GatewayError> {
    let chain = rustls_pemfile::certs(&mut BufReader::new(cert.certificate.as_bytes()))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(cert.key.as_bytes()))?
        .ok_or_else(|| GatewayError::Certificate("client certificate has no private key".into()))?;

    if chain.is_empty() {
        return Err(GatewayError::Certificate(
            "client certificate has no certificates".into(),
        ));
    }
    Ok((chain, key))
}

/// Target of an instance without the trailing slash, for diagnostics.
pub fn describe(instance: &BackendInstance) -> String {
    instance.target.to_string().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Service;

    fn host(websockets: bool, servers: usize, rewrite: Option<&str>) -> Arc<Host> {
        let mut srvc: Service = toml::from_str(r#"id = "svc""#).unwrap();
        srvc.websockets = websockets;
        srvc.servers = (0..servers)
            .map(|i| Server {
                protocol: Protocol::Http,
                hostname: "127.0.0.1".into(),
                port: 9000 + i as u16,
            })
            .collect();
        let domain = crate::store::Domain {
            domain: "app.example.com".into(),
            host: rewrite.map(str::to_string),
        };
        Arc::new(Host::new(srvc, domain, vec![], None, None))
    }

    fn node() -> Node {
        toml::from_str(r#"id = "n1""#).unwrap()
    }

    fn pools(host: Arc<Host>) -> HashMap<String, DomainPool> {
        let mut hosts = HashMap::new();
        hosts.insert("app.example.com".to_string(), host);
        build_pools(&hosts, &node(), &build_client(None).unwrap()).unwrap()
    }

    #[test]
    fn websocket_instances_follow_service_flag() {
        let with = pools(host(true, 2, None));
        let pool = &with["app.example.com"];
        assert_eq!(pool.http.len(), 2);
        assert_eq!(pool.websocket.len(), 2);
        assert_eq!(pool.isolated.len(), 2);

        let without = pools(host(false, 2, None));
        assert!(without["app.example.com"].websocket.is_empty());
        assert!(without["app.example.com"].pick(InstanceMode::WebSocket).is_none());
    }

    #[test]
    fn instances_carry_listener_values() {
        let pools = pools(host(false, 1, None));
        let inst = pools["app.example.com"].pick(InstanceMode::Http).unwrap();
        assert_eq!(inst.protocol, Protocol::Https);
        assert_eq!(inst.port, 443);
        assert_eq!(describe(&inst), "http://127.0.0.1:9000");
    }

    #[test]
    fn target_uri_keeps_path_and_query() {
        let pools = pools(host(false, 1, None));
        let inst = pools["app.example.com"].pick(InstanceMode::Http).unwrap();
        let uri = inst
            .target_uri(&"/a/b?c=d".parse::<Uri>().unwrap())
            .unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/a/b?c=d");
    }

    #[test]
    fn strips_hop_by_hop_and_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn pick_is_uniform_enough() {
        let pools = pools(host(false, 2, None));
        let pool = &pools["app.example.com"];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(pool.pick(InstanceMode::Http).unwrap().target.to_string());
        }
        assert_eq!(seen.len(), 2);
    }
}
