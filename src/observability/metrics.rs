//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): dispatcher outcomes by `outcome`
//! - `gateway_proxy_rebuild_failures_total` (counter): failed host table rebuilds
//! - `gateway_router_restarts_total` (counter): listener restarts
//! - `gateway_proxy_hosts` (gauge): hosts in the published generation
//! - `gateway_websocket_tunnels` (gauge): open WebSocket tunnels
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until an
//!   exporter is installed
//! - The Prometheus exporter serves its own scrape endpoint

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const REBUILD_FAILURES_TOTAL: &str = "gateway_proxy_rebuild_failures_total";
pub const ROUTER_RESTARTS_TOTAL: &str = "gateway_router_restarts_total";
pub const PROXY_HOSTS: &str = "gateway_proxy_hosts";
pub const WEBSOCKET_TUNNELS: &str = "gateway_websocket_tunnels";

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to start metrics endpoint"),
    }
}

/// Count a dispatcher outcome such as `forwarded`, `not_found` or `unhandled`.
pub fn record_request(outcome: &'static str) {
    metrics::counter!(REQUESTS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_rebuild_failure() {
    metrics::counter!(REBUILD_FAILURES_TOTAL).increment(1);
}

pub fn record_restart() {
    metrics::counter!(ROUTER_RESTARTS_TOTAL).increment(1);
}

pub fn set_proxy_hosts(count: usize) {
    metrics::gauge!(PROXY_HOSTS).set(count as f64);
}

pub fn set_websocket_tunnels(count: usize) {
    metrics::gauge!(WEBSOCKET_TUNNELS).set(count as f64);
}
