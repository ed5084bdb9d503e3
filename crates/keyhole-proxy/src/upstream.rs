use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, TlsConnector};

use crate::connection::{ConnContext, ServerConn};
use crate::head::parse_response_head;
use crate::helper::{proxy_from_env, read_until_pattern, BufferedConn};
use crate::proxy::Runtime;
use crate::tls::default_client_config;

/// Origin-facing stream, plain or TLS-wrapped.
pub(crate) enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

pub(crate) struct DialedOrigin {
    pub(crate) stream: TcpStream,
    pub(crate) via_proxy: bool,
}

/// Dial `host:port` honoring `HTTPS_PROXY`/`HTTP_PROXY`/`NO_PROXY`. For an
/// https destination behind an env proxy, a nested CONNECT is issued and the
/// returned stream is already positioned to speak to the true origin; any
/// non-200 proxy status propagates as a failure carrying the status reason.
pub(crate) async fn dial_origin(
    host: &str,
    port: u16,
    scheme: &str,
    timeouts: &crate::options::Timeouts,
) -> io::Result<DialedOrigin> {
    match proxy_from_env(scheme, host) {
        Some(proxy_authority) => {
            let stream =
                tokio::time::timeout(timeouts.origin_dial, TcpStream::connect(&proxy_authority))
                    .await
                    .map_err(|_| dial_timeout())??;
            if scheme == "https" {
                let stream = tokio::time::timeout(
                    timeouts.upstream_proxy_connect,
                    connect_through_proxy(stream, host, port),
                )
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "upstream proxy CONNECT timed out")
                })??;
                Ok(DialedOrigin {
                    stream,
                    via_proxy: true,
                })
            } else {
                Ok(DialedOrigin {
                    stream,
                    via_proxy: true,
                })
            }
        }
        None => {
            let stream = tokio::time::timeout(timeouts.origin_dial, TcpStream::connect((host, port)))
                .await
                .map_err(|_| dial_timeout())??;
            Ok(DialedOrigin {
                stream,
                via_proxy: false,
            })
        }
    }
}

async fn connect_through_proxy(stream: TcpStream, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut conn = BufferedConn::new(stream);
    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    conn.stream.write_all(connect.as_bytes()).await?;

    let head = read_until_pattern(&mut conn, b"\r\n\r\n", 16 * 1024)
        .await?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream proxy closed during CONNECT",
            )
        })?;
    let response = parse_response_head(&head, "CONNECT")?;
    if response.status != 200 {
        let reason = if response.reason.is_empty() {
            "unknown status code".to_string()
        } else {
            response.reason
        };
        return Err(io::Error::other(format!(
            "upstream proxy refused CONNECT: {reason}"
        )));
    }
    // The TLS origin will not speak until spoken to, so nothing can be
    // buffered past the proxy's response head.
    Ok(conn.stream)
}

fn dial_timeout() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "origin dial i/o timeout")
}

/// The one upstream HTTP/1.1 connection a ConnContext drives. Intercepted
/// HTTPS pins the TLS stream established during interception; plain proxying
/// dials lazily and replaces the connection when the authority changes.
pub(crate) struct UpstreamLink {
    conn: Option<BufferedConn<UpstreamStream>>,
    server: Option<Arc<ServerConn>>,
    authority: Option<String>,
    absolute_form: bool,
    pinned: bool,
}

impl UpstreamLink {
    pub(crate) fn pinned(stream: client::TlsStream<TcpStream>, server: Arc<ServerConn>) -> Self {
        Self {
            conn: Some(BufferedConn::new(UpstreamStream::Tls(Box::new(stream)))),
            server: Some(server),
            authority: None,
            absolute_form: false,
            pinned: true,
        }
    }

    pub(crate) fn dynamic() -> Self {
        Self {
            conn: None,
            server: None,
            authority: None,
            absolute_form: false,
            pinned: false,
        }
    }

    /// Whether requests must use the absolute form (plain HTTP relayed
    /// through an environment proxy).
    pub(crate) fn absolute_form(&self) -> bool {
        self.absolute_form
    }

    pub(crate) fn conn(&mut self) -> Option<&mut BufferedConn<UpstreamStream>> {
        self.conn.as_mut()
    }

    /// Connection for `host:port`, reusing the current one when it still
    /// points at the same authority.
    pub(crate) async fn ensure(
        &mut self,
        rt: &Runtime,
        ctx: &ConnContext,
        scheme: &str,
        host: &str,
        port: u16,
    ) -> io::Result<&mut BufferedConn<UpstreamStream>> {
        if self.pinned {
            return self.conn.as_mut().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotConnected,
                    "intercepted upstream connection is gone",
                )
            });
        }

        let authority = format!("{host}:{port}");
        if self.conn.is_some() && self.authority.as_deref() == Some(authority.as_str()) {
            return Ok(self.conn.as_mut().expect("connection checked above"));
        }

        self.close(rt, ctx);

        let dialed = dial_origin(host, port, scheme, &rt.options.timeouts).await?;
        let stream = if scheme == "https" {
            let config = default_client_config(rt.options.insecure_skip_verify_tls);
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "invalid upstream server name")
                })?;
            let connector = TlsConnector::from(Arc::new(config));
            let tls = tokio::time::timeout(
                rt.options.timeouts.tls_handshake,
                connector.connect(server_name, dialed.stream),
            )
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout"))??;
            UpstreamStream::Tls(Box::new(tls))
        } else {
            UpstreamStream::Plain(dialed.stream)
        };

        let server = Arc::new(ServerConn::new(authority.clone()));
        ctx.set_server(Arc::clone(&server));
        rt.addons.server_connected(ctx);

        self.conn = Some(BufferedConn::new(stream));
        self.server = Some(server);
        self.authority = Some(authority);
        self.absolute_form = dialed.via_proxy && scheme == "http";
        Ok(self.conn.as_mut().expect("connection just stored"))
    }

    /// Drop the current connection and fire `server_disconnected` once.
    pub(crate) fn close(&mut self, rt: &Runtime, ctx: &ConnContext) {
        self.conn = None;
        self.authority = None;
        self.absolute_form = false;
        if let Some(server) = self.server.take() {
            rt.addons.notify_server_closed(ctx, &server);
        }
    }
}
