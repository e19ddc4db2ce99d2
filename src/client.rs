use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

const UNKNOWN_ADDRESS: &str = "unknown";

/// What the admission pipeline needs to know about an inbound request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub headers: HeaderMap,
    pub peer: Option<SocketAddr>,
    pub path: String,
}

impl RequestMeta {
    pub fn new(headers: HeaderMap, peer: Option<SocketAddr>, path: impl Into<String>) -> Self {
        Self {
            headers,
            peer,
            path: path.into(),
        }
    }

    /// Originating address: first `X-Forwarded-For` hop, then `X-Real-IP`,
    /// then the transport peer.
    pub fn client_address(&self) -> String {
        let forwarded = self
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| ip.parse::<IpAddr>().is_ok());
        if let Some(ip) = forwarded {
            debug!(ip = %ip, "client address from X-Forwarded-For");
            return ip.to_string();
        }

        let real_ip = self
            .headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| ip.parse::<IpAddr>().is_ok());
        if let Some(ip) = real_ip {
            debug!(ip = %ip, "client address from X-Real-IP");
            return ip.to_string();
        }

        match self.peer {
            Some(addr) => addr.ip().to_string(),
            None => UNKNOWN_ADDRESS.to_string(),
        }
    }
}

/// Quota identity: one address within one endpoint category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub address: String,
    pub category: String,
}

impl ClientKey {
    pub fn new(address: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            category: category.into(),
        }
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.category, self.address)
    }
}
