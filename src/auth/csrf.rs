//! Cross-site request check.

use axum::http::header::{ORIGIN, REFERER};
use axum::http::request::Parts;
use axum::http::{Method, Uri};

use crate::proxy::websocket::is_upgrade;

/// Whether the request may proceed for `domain`.
///
/// Safe methods pass unless they request a protocol upgrade. Otherwise the
/// host of `Origin`, or of `Referer` when `Origin` is absent, must equal the
/// domain. Requests carrying neither header pass.
pub fn check(domain: &str, parts: &Parts) -> bool {
    let safe = matches!(
        parts.method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    );
    if safe && !is_upgrade(&parts.headers) {
        return true;
    }

    let source = parts
        .headers
        .get(ORIGIN)
        .or_else(|| parts.headers.get(REFERER));
    let Some(source) = source else {
        return true;
    };

    let host = source
        .to_str()
        .ok()
        .and_then(|s| s.parse::<Uri>().ok())
        .and_then(|uri| uri.host().map(str::to_ascii_lowercase));

    let domain = domain.split(':').next().unwrap_or(domain);
    match host {
        Some(host) => host.eq_ignore_ascii_case(domain),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(method: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri("/");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn safe_methods_pass() {
        assert!(check("app.example.com", &parts("GET", &[("origin", "https://evil.com")])));
    }

    #[test]
    fn matching_origin_passes() {
        let p = parts("POST", &[("origin", "https://App.example.com:8443")]);
        assert!(check("app.example.com", &p));
    }

    #[test]
    fn foreign_origin_fails() {
        assert!(!check("app.example.com", &parts("POST", &[("origin", "https://evil.com")])));
        assert!(!check("app.example.com", &parts("DELETE", &[("origin", "null")])));
    }

    #[test]
    fn referer_is_used_without_origin() {
        let p = parts("POST", &[("referer", "https://app.example.com/page?x=1")]);
        assert!(check("app.example.com", &p));
        let p = parts("POST", &[("referer", "https://other.example.com/")]);
        assert!(!check("app.example.com", &p));
    }

    #[test]
    fn upgrade_requires_matching_origin() {
        let p = parts(
            "GET",
            &[
                ("connection", "Upgrade"),
                ("upgrade", "websocket"),
                ("origin", "https://evil.com"),
            ],
        );
        assert!(!check("app.example.com", &p));
    }

    #[test]
    fn missing_headers_pass() {
        assert!(check("app.example.com", &parts("POST", &[])));
    }
}
