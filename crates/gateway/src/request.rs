//! The request as seen by the admission pipeline.

use std::net::IpAddr;

use http::{HeaderMap, HeaderName, HeaderValue, Method, request::Parts};

/// Header consulted for the client address behind a local proxy.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Method, path, query, headers and peer address of an inbound request.
///
/// The body is not needed for admission and is left to the forwarding layer.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    /// HTTP method.
    pub method: Method,
    /// Path without the query string.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    /// Request headers.
    pub headers: HeaderMap,
    /// Address of the directly connected peer.
    pub peer_addr: Option<IpAddr>,
}

impl AdmissionRequest {
    /// Creates a request for `method` on `uri`, which may carry a query string.
    #[must_use]
    pub fn new(method: Method, uri: &str) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (uri.to_owned(), None),
        };
        Self { method, path, query, headers: HeaderMap::new(), peer_addr: None }
    }

    /// Builds a request from the head of an `http` request.
    #[must_use]
    pub fn from_parts(parts: &Parts, peer_addr: Option<IpAddr>) -> Self {
        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_owned(),
            query: parts.uri.query().map(str::to_owned),
            headers: parts.headers.clone(),
            peer_addr,
        }
    }

    /// Adds a header. Names or values that are not valid HTTP are ignored.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            },
            _ => tracing::debug!(name, "dropping invalid header"),
        }
        self
    }

    /// Sets the peer address.
    #[must_use]
    pub fn with_peer_addr(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// First value of header `name`, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// First value of query parameter `name`.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then(|| value.to_owned())
        })
    }

    /// The client address.
    ///
    /// `X-Forwarded-For` is only trusted when the peer is a loopback proxy,
    /// and a loopback value in it is ignored so it cannot be used to pose as
    /// a local caller.
    #[must_use]
    pub fn client_ip(&self) -> Option<IpAddr> {
        if self.peer_addr.is_some_and(|ip| ip.is_loopback()) {
            if let Some(first) = self.header(FORWARDED_FOR).and_then(|v| v.split(',').next()) {
                let first = first.trim();
                if is_localhost_address(first) {
                    tracing::warn!(forwarded = first, "ignoring loopback X-Forwarded-For");
                } else if let Ok(ip) = first.parse() {
                    return Some(ip);
                }
            }
        } else if self.headers.contains_key(FORWARDED_FOR) {
            tracing::warn!(peer = ?self.peer_addr, "ignoring X-Forwarded-For from non-loopback peer");
        }
        self.peer_addr
    }
}

/// Whether `ip` names the local host.
#[must_use]
pub fn is_localhost_address(ip: &str) -> bool {
    ip == "::1" || ip.starts_with("127.") || ip.eq_ignore_ascii_case("localhost")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_uri_is_split() {
        let request = AdmissionRequest::new(Method::GET, "/svc/orders?v=2&debug");
        assert_eq!(request.path, "/svc/orders");
        assert_eq!(request.query_param("v").as_deref(), Some("2"));
        assert_eq!(request.query_param("debug").as_deref(), Some(""));
        assert_eq!(request.query_param("missing"), None);
    }

    #[test]
    fn test_from_parts() {
        let (parts, ()) = http::Request::builder()
            .method(Method::POST)
            .uri("http://gw/svc/a?x=1")
            .header("Authorization", "k")
            .body(())
            .unwrap()
            .into_parts();
        let request = AdmissionRequest::from_parts(&parts, Some(LOOPBACK));
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.path, "/svc/a");
        assert_eq!(request.query.as_deref(), Some("x=1"));
        assert_eq!(request.header("authorization"), Some("k"));
    }

    #[test]
    fn test_forwarded_for_trusted_from_loopback() {
        let request = AdmissionRequest::new(Method::GET, "/")
            .with_peer_addr(LOOPBACK)
            .with_header("X-Forwarded-For", "203.0.113.9, 10.0.0.1");
        assert_eq!(request.client_ip(), Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_forwarded_for_ignored_from_remote_peer() {
        let peer: IpAddr = "198.51.100.4".parse().unwrap();
        let request = AdmissionRequest::new(Method::GET, "/")
            .with_peer_addr(peer)
            .with_header("X-Forwarded-For", "203.0.113.9");
        assert_eq!(request.client_ip(), Some(peer));
    }

    #[test]
    fn test_loopback_forwarded_for_is_rejected() {
        let request = AdmissionRequest::new(Method::GET, "/")
            .with_peer_addr(LOOPBACK)
            .with_header("X-Forwarded-For", "127.0.0.1");
        assert_eq!(request.client_ip(), Some(LOOPBACK));
    }

    #[test]
    fn test_is_localhost_address() {
        assert!(is_localhost_address("127.0.0.1"));
        assert!(is_localhost_address("127.1.2.3"));
        assert!(is_localhost_address("::1"));
        assert!(is_localhost_address("LocalHost"));
        assert!(!is_localhost_address("192.168.1.1"));
        assert!(!is_localhost_address("::2"));
        assert!(!is_localhost_address(""));
    }
}
