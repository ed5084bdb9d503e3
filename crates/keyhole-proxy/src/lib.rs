mod addon;
mod body;
mod client_hello;
mod connect;
mod connection;
mod engine;
mod errors;
mod flow;
mod head;
mod helper;
mod intercept;
mod options;
mod proxy;
mod tls;
mod upstream;

pub use addon::{Addon, BodyStream, HookAction, HookFuture, LogAddon};
pub use client_hello::ClientHelloSummary;
pub use connection::{ClientConn, ConnContext, ServerConn, TlsSnapshot};
pub use errors::ProxyError;
pub use flow::{Flow, FlowDone, FlowSummary, Request, Response};
pub use helper::log_error;
pub use intercept::{InterceptDecision, InterceptHub};
pub use options::{Options, Timeouts, DEFAULT_STREAM_LARGE_BODIES};
pub use proxy::Proxy;

pub use keyhole_ca::{CaLoader, CertificateAuthority, DirLoader, MemLoader};
