use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use keyhole_ca::CertificateAuthority;
use tokio::net::{TcpListener, TcpStream};

use crate::addon::{Addon, AddonPipeline};
use crate::connect;
use crate::connection::{ClientConn, ConnContext};
use crate::engine::{self, write_simple_response, Scheme};
use crate::errors::ProxyError;
use crate::head::parse_request_head;
use crate::helper::{log_error, read_until_pattern, BufferedConn};
use crate::intercept::InterceptHub;
use crate::options::Options;
use crate::upstream::UpstreamLink;

/// Shared handles every connection task clones.
pub(crate) struct Runtime {
    pub(crate) options: Options,
    pub(crate) ca: Arc<CertificateAuthority>,
    pub(crate) addons: AddonPipeline,
    pub(crate) hub: Arc<InterceptHub>,
}

/// The proxy core: one plaintext listener accepting absolute-form requests
/// and CONNECT tunnels, a CA for on-the-fly leaf issuance, and the ordered
/// addon pipeline. Addons are registered before `run` and are immutable
/// afterwards.
pub struct Proxy {
    runtime: Arc<Runtime>,
}

impl Proxy {
    pub fn new(
        options: Options,
        ca: CertificateAuthority,
        addons: Vec<Box<dyn Addon>>,
    ) -> Result<Self, ProxyError> {
        options.validate()?;
        Ok(Self {
            runtime: Arc::new(Runtime {
                options,
                ca: Arc::new(ca),
                addons: AddonPipeline::new(addons),
                hub: Arc::new(InterceptHub::new()),
            }),
        })
    }

    /// Rendezvous used by an external controller to resolve intercepted
    /// flows.
    pub fn intercept_hub(&self) -> Arc<InterceptHub> {
        Arc::clone(&self.runtime.hub)
    }

    pub fn ca(&self) -> Arc<CertificateAuthority> {
        Arc::clone(&self.runtime.ca)
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.runtime.options.addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "proxy listening");
        self.run_with_listener(listener).await
    }

    /// Accept loop over an already-bound listener; handy for tests that bind
    /// port zero themselves.
    pub async fn run_with_listener(self, listener: TcpListener) -> Result<(), ProxyError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let runtime = Arc::clone(&self.runtime);
            tokio::spawn(async move {
                handle_client(runtime, stream, peer).await;
            });
        }
    }
}

async fn handle_client(rt: Arc<Runtime>, stream: TcpStream, peer: SocketAddr) {
    let ctx = Arc::new(ConnContext::new(Arc::new(ClientConn::new(peer))));
    rt.addons.client_connected(&ctx.client);

    if let Err(error) = drive_client(&rt, &ctx, stream).await {
        log_error("connection", &error);
    }

    // Exactly-once teardown; transitively closes the server side.
    rt.addons.notify_client_closed(&ctx);
}

async fn drive_client(
    rt: &Arc<Runtime>,
    ctx: &Arc<ConnContext>,
    stream: TcpStream,
) -> io::Result<()> {
    let mut client = BufferedConn::new(stream);

    let read = tokio::time::timeout(
        rt.options.timeouts.idle_keepalive,
        read_until_pattern(&mut client, b"\r\n\r\n", rt.options.max_head_bytes),
    )
    .await;
    let head_bytes = match read {
        Err(_) => return Ok(()),
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(bytes))) => bytes,
        Ok(Err(error)) => return Err(error),
    };

    let head = match parse_request_head(&head_bytes) {
        Ok(head) => head,
        Err(error) => {
            tracing::debug!(error = %error, "client protocol error");
            write_simple_response(&mut client, 400, "Bad Request", "malformed request").await?;
            return Ok(());
        }
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        connect::handle_connect(rt, ctx, client, head).await
    } else {
        // The link is dropped without closing here: teardown notifies the
        // client first, then transitively the server side.
        let mut link = UpstreamLink::dynamic();
        engine::serve_flows(rt, ctx, &mut client, &mut link, Scheme::Http, Some(head)).await
    }
}
