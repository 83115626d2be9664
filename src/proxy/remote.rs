//! Client address resolution.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

/// Client address as seen by the whitelist check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr {
    pub ip: IpAddr,

    /// The address was read from the node's forwarded-for header.
    pub from_header: bool,

    /// False when a forwarded-for header is configured but absent or unparsable.
    /// `ip` then holds the peer address.
    pub valid: bool,
}

/// Resolve the client address of a request.
///
/// With a configured header the first entry of its comma separated list is
/// used; without one the peer address is.
pub fn resolve(headers: &HeaderMap, peer: SocketAddr, forwarded_for: Option<&str>) -> RemoteAddr {
    let Some(name) = forwarded_for.filter(|n| !n.is_empty()) else {
        return RemoteAddr {
            ip: peer.ip(),
            from_header: false,
            valid: true,
        };
    };

    let ip = headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    match ip {
        Some(ip) => RemoteAddr {
            ip,
            from_header: true,
            valid: true,
        },
        None => RemoteAddr {
            ip: peer.ip(),
            from_header: false,
            valid: false,
        },
    }
}

/// Whether the peer is on a loopback, private or link-local network.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private(IpAddr::V4(v4));
            }
            let segment = v6.segments()[0];
            v6.is_loopback() || (segment & 0xfe00) == 0xfc00 || (segment & 0xffc0) == 0xfe80
        }
    }
}
