use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Instant;

use futures::FutureExt;
use tokio::io::AsyncRead;

use crate::connection::{ClientConn, ConnContext, ServerConn};
use crate::flow::Flow;

pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Streamed body handed through `stream_*_modifier` hooks; modifiers wrap
/// the reader and return the composition.
pub type BodyStream<'a> = Box<dyn AsyncRead + Send + Unpin + 'a>;

/// Outcome of a `request` or `response` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Park the flow on the interception rendezvous until an external
    /// controller posts a change/drop decision.
    Intercept,
}

/// A pluggable observer/mutator notified at flow lifecycle points. Every
/// hook has a no-op default; implementors override what they need. Hooks run
/// on every registered addon in registration order.
pub trait Addon: Send + Sync + 'static {
    fn client_connected(&self, _client: &ClientConn) {}
    fn client_disconnected(&self, _client: &ClientConn) {}
    fn server_connected(&self, _ctx: &ConnContext) {}
    fn server_disconnected(&self, _ctx: &ConnContext) {}
    fn tls_established_server(&self, _ctx: &ConnContext) {}

    fn requestheaders<'a>(&'a self, _flow: &'a mut Flow) -> HookFuture<'a, ()> {
        Box::pin(async {})
    }

    fn request<'a>(&'a self, _flow: &'a mut Flow) -> HookFuture<'a, HookAction> {
        Box::pin(async { HookAction::Continue })
    }

    fn responseheaders<'a>(&'a self, _flow: &'a mut Flow) -> HookFuture<'a, ()> {
        Box::pin(async {})
    }

    fn response<'a>(&'a self, _flow: &'a mut Flow) -> HookFuture<'a, HookAction> {
        Box::pin(async { HookAction::Continue })
    }

    fn stream_request_modifier<'a>(&self, reader: BodyStream<'a>) -> BodyStream<'a> {
        reader
    }

    fn stream_response_modifier<'a>(&self, reader: BodyStream<'a>) -> BodyStream<'a> {
        reader
    }
}

/// Ordered fan-out of lifecycle events to the registered addons. A panicking
/// addon is recovered, logged, and skipped for that hook only.
pub(crate) struct AddonPipeline {
    addons: Vec<Box<dyn Addon>>,
}

impl AddonPipeline {
    pub(crate) fn new(addons: Vec<Box<dyn Addon>>) -> Self {
        Self { addons }
    }

    pub(crate) fn client_connected(&self, client: &ClientConn) {
        for addon in &self.addons {
            guard_sync("client_connected", || addon.client_connected(client));
        }
    }

    /// Idempotent client teardown: fires `client_disconnected` once, then
    /// transitively closes the attached server connection.
    pub(crate) fn notify_client_closed(&self, ctx: &ConnContext) {
        if ctx.client.mark_disconnected() {
            for addon in &self.addons {
                guard_sync("client_disconnected", || {
                    addon.client_disconnected(&ctx.client)
                });
            }
        }
        if let Some(server) = ctx.server() {
            self.notify_server_closed(ctx, &server);
        }
    }

    pub(crate) fn server_connected(&self, ctx: &ConnContext) {
        for addon in &self.addons {
            guard_sync("server_connected", || addon.server_connected(ctx));
        }
    }

    pub(crate) fn notify_server_closed(&self, ctx: &ConnContext, server: &ServerConn) {
        if server.mark_disconnected() {
            for addon in &self.addons {
                guard_sync("server_disconnected", || addon.server_disconnected(ctx));
            }
        }
    }

    pub(crate) fn tls_established_server(&self, ctx: &ConnContext) {
        for addon in &self.addons {
            guard_sync("tls_established_server", || {
                addon.tls_established_server(ctx)
            });
        }
    }

    pub(crate) async fn requestheaders(&self, flow: &mut Flow) {
        for addon in &self.addons {
            guard_async("requestheaders", (), addon.requestheaders(flow)).await;
        }
    }

    pub(crate) async fn request(&self, flow: &mut Flow) -> HookAction {
        let mut action = HookAction::Continue;
        for addon in &self.addons {
            if guard_async("request", HookAction::Continue, addon.request(flow)).await
                == HookAction::Intercept
            {
                action = HookAction::Intercept;
            }
        }
        action
    }

    pub(crate) async fn responseheaders(&self, flow: &mut Flow) {
        for addon in &self.addons {
            guard_async("responseheaders", (), addon.responseheaders(flow)).await;
        }
    }

    pub(crate) async fn response(&self, flow: &mut Flow) -> HookAction {
        let mut action = HookAction::Continue;
        for addon in &self.addons {
            if guard_async("response", HookAction::Continue, addon.response(flow)).await
                == HookAction::Intercept
            {
                action = HookAction::Intercept;
            }
        }
        action
    }

    pub(crate) fn wrap_request_stream<'a>(&'a self, reader: BodyStream<'a>) -> BodyStream<'a> {
        self.addons
            .iter()
            .fold(reader, |reader, addon| addon.stream_request_modifier(reader))
    }

    pub(crate) fn wrap_response_stream<'a>(&'a self, reader: BodyStream<'a>) -> BodyStream<'a> {
        self.addons
            .iter()
            .fold(reader, |reader, addon| addon.stream_response_modifier(reader))
    }
}

fn guard_sync<R>(hook: &'static str, callback: impl FnOnce() -> R) -> Option<R> {
    match std::panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(hook, "addon panicked; skipping hook");
            None
        }
    }
}

async fn guard_async<T>(
    hook: &'static str,
    fallback: T,
    future: impl Future<Output = T>,
) -> T {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(value) => value,
        Err(_) => {
            tracing::error!(hook, "addon panicked; skipping hook");
            fallback
        }
    }
}

/// Built-in addon logging connection events and per-request latency once the
/// flow's done signal closes.
#[derive(Debug, Default)]
pub struct LogAddon;

impl Addon for LogAddon {
    fn client_connected(&self, client: &ClientConn) {
        tracing::info!(client_addr = %client.peer_addr, "client connect");
    }

    fn client_disconnected(&self, client: &ClientConn) {
        tracing::info!(client_addr = %client.peer_addr, "client disconnect");
    }

    fn server_connected(&self, ctx: &ConnContext) {
        if let Some(server) = ctx.server() {
            tracing::info!(
                client_addr = %ctx.client.peer_addr,
                server_addr = %server.address,
                "server connect"
            );
        }
    }

    fn server_disconnected(&self, ctx: &ConnContext) {
        if let Some(server) = ctx.server() {
            tracing::info!(
                client_addr = %ctx.client.peer_addr,
                server_addr = %server.address,
                "server disconnect"
            );
        }
    }

    fn requestheaders<'a>(&'a self, flow: &'a mut Flow) -> HookFuture<'a, ()> {
        let start = Instant::now();
        let client_addr = flow.conn.client.peer_addr;
        let method = flow.request.method.clone();
        let url = flow.request.url.to_string();
        let done = flow.done();
        Box::pin(async move {
            tokio::spawn(async move {
                match done.wait().await {
                    Some(summary) => {
                        tracing::info!(
                            %client_addr,
                            method,
                            url,
                            status = summary.status.unwrap_or(0),
                            content_len = summary.content_length,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "request completed"
                        );
                    }
                    None => {
                        tracing::debug!(%client_addr, method, url, "request abandoned");
                    }
                }
            });
        })
    }
}
