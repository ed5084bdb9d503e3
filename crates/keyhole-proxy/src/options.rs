use std::net::SocketAddr;
use std::time::Duration;

use crate::errors::ProxyError;

pub const DEFAULT_STREAM_LARGE_BODIES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Listener address for the plaintext proxy endpoint.
    pub addr: SocketAddr,
    /// Bodies of at least this many bytes are streamed through instead of
    /// buffered; addons then see the body as a reader, not as bytes.
    pub stream_large_bodies: usize,
    /// Disable verification of origin certificates.
    pub insecure_skip_verify_tls: bool,
    /// Upper bound on a request or response head.
    pub max_head_bytes: usize,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub origin_dial: Duration,
    pub idle_keepalive: Duration,
    pub tls_handshake: Duration,
    pub upstream_proxy_connect: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9080".parse().expect("default addr must parse"),
            stream_large_bodies: DEFAULT_STREAM_LARGE_BODIES,
            insecure_skip_verify_tls: false,
            max_head_bytes: 64 * 1024,
            timeouts: Timeouts::default(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            origin_dial: Duration::from_secs(30),
            idle_keepalive: Duration::from_secs(90),
            tls_handshake: Duration::from_secs(10),
            upstream_proxy_connect: Duration::from_secs(60),
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.stream_large_bodies == 0 {
            return Err(ProxyError::InvalidConfig(
                "stream_large_bodies must be greater than zero".to_string(),
            ));
        }
        if self.max_head_bytes == 0 {
            return Err(ProxyError::InvalidConfig(
                "max_head_bytes must be greater than zero".to_string(),
            ));
        }
        let timeouts = [
            self.timeouts.origin_dial,
            self.timeouts.idle_keepalive,
            self.timeouts.tls_handshake,
            self.timeouts.upstream_proxy_connect,
        ];
        if timeouts.iter().any(Duration::is_zero) {
            return Err(ProxyError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
