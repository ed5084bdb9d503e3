use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use uuid::Uuid;

/// An accepted client socket's identity. The engine task owns the socket
/// itself; this records what addons are allowed to see, plus the
/// exactly-once disconnect latch.
#[derive(Debug)]
pub struct ClientConn {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    tls: AtomicBool,
    disconnected: AtomicBool,
}

impl ClientConn {
    pub(crate) fn new(peer_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            tls: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    /// True once TLS negotiation with the client completed.
    pub fn tls(&self) -> bool {
        self.tls.load(Ordering::Acquire)
    }

    pub(crate) fn set_tls(&self) {
        self.tls.store(true, Ordering::Release);
    }

    /// Latch the disconnect; returns true only for the first caller.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }
}

/// Final TLS parameters negotiated with the origin, recorded once the
/// handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSnapshot {
    pub sni: String,
    pub version: Option<String>,
    pub cipher_suite: Option<String>,
    pub alpn: Option<String>,
}

/// An origin connection's identity and handshake outcome.
#[derive(Debug)]
pub struct ServerConn {
    pub id: Uuid,
    pub address: String,
    tls_state: OnceLock<TlsSnapshot>,
    disconnected: AtomicBool,
}

impl ServerConn {
    pub(crate) fn new(address: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            address,
            tls_state: OnceLock::new(),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Negotiated origin TLS state; `None` until the handshake completed, or
    /// forever for plain connections.
    pub fn tls_state(&self) -> Option<&TlsSnapshot> {
        self.tls_state.get()
    }

    pub(crate) fn record_tls_state(&self, snapshot: TlsSnapshot) {
        let _ = self.tls_state.set(snapshot);
    }

    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }
}

/// One client connection paired with at most one origin connection.
#[derive(Debug)]
pub struct ConnContext {
    pub client: Arc<ClientConn>,
    server: Mutex<Option<Arc<ServerConn>>>,
    close_after_response: AtomicBool,
}

impl ConnContext {
    pub(crate) fn new(client: Arc<ClientConn>) -> Self {
        Self {
            client,
            server: Mutex::new(None),
            close_after_response: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> Option<Arc<ServerConn>> {
        self.server.lock().expect("conn context lock").clone()
    }

    /// Attach the current origin connection, returning the one it replaced.
    pub(crate) fn set_server(&self, server: Arc<ServerConn>) -> Option<Arc<ServerConn>> {
        self.server
            .lock()
            .expect("conn context lock")
            .replace(server)
    }

    /// Keepalive short-circuit: set on explicit upstream `Connection: close`
    /// (or the client's own close intent); the socket is torn down after the
    /// current response is flushed.
    pub fn close_after_response(&self) -> bool {
        self.close_after_response.load(Ordering::Acquire)
    }

    pub(crate) fn set_close_after_response(&self) {
        self.close_after_response.store(true, Ordering::Release);
    }
}
