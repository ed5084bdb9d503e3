use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::client_hello::{looks_like_tls, parse_client_hello, required_record_len};
use crate::connection::{ConnContext, ServerConn};
use crate::engine::{self, write_simple_response, Scheme};
use crate::head::{parse_connect_target, RequestHead};
use crate::helper::{log_error, transfer, BufferedConn, IO_CHUNK_SIZE};
use crate::proxy::Runtime;
use crate::tls::{accept_client, handshake_origin, origin_snapshot, ReplayStream};
use crate::upstream::{dial_origin, UpstreamLink};

/// CONNECT path: dial the origin, reply 200, peek the first client bytes and
/// hand off to TLS interception or a cleartext byte tunnel.
pub(crate) async fn handle_connect(
    rt: &Arc<Runtime>,
    ctx: &Arc<ConnContext>,
    mut client: BufferedConn<TcpStream>,
    head: RequestHead,
) -> io::Result<()> {
    let (host, port) = match parse_connect_target(&head.target) {
        Ok(target) => target,
        Err(error) => {
            tracing::debug!(error = %error, target = %head.target, "bad CONNECT target");
            write_simple_response(&mut client, 400, "Bad Request", "invalid CONNECT target")
                .await?;
            return Ok(());
        }
    };

    let dialed = match dial_origin(&host, port, "https", &rt.options.timeouts).await {
        Ok(dialed) => dialed,
        Err(error) => {
            tracing::error!(error = %error, host = %host, port, "CONNECT dial failed");
            write_simple_response(&mut client, 502, "Bad Gateway", &error.to_string()).await?;
            return Ok(());
        }
    };

    let server = Arc::new(ServerConn::new(format!("{host}:{port}")));
    ctx.set_server(Arc::clone(&server));
    rt.addons.server_connected(ctx);

    client
        .stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let origin_tcp = dialed.stream;

    // Peek enough to classify the tunnel without consuming it.
    if !fill_peek(rt, &mut client, 3).await? {
        return Ok(());
    }
    if !looks_like_tls(&client.read_buf) {
        return run_cleartext_tunnel(rt, client, origin_tcp).await;
    }

    loop {
        match required_record_len(&client.read_buf) {
            Some(needed) if client.read_buf.len() >= needed => break,
            Some(needed) if needed > rt.options.max_head_bytes => {
                return run_cleartext_tunnel(rt, client, origin_tcp).await;
            }
            _ => {
                let target = required_record_len(&client.read_buf).unwrap_or(5);
                if !fill_peek(rt, &mut client, target).await? {
                    return Ok(());
                }
            }
        }
    }

    let hello = match parse_client_hello(&client.read_buf) {
        Ok(hello) => hello,
        Err(error) => {
            tracing::debug!(error = %error, "unparseable ClientHello; tunneling raw");
            return run_cleartext_tunnel(rt, client, origin_tcp).await;
        }
    };
    let sni = hello.sni.clone().unwrap_or_else(|| host.clone());

    // Origin first: no leaf certificate is issued until the origin
    // handshake outcome is known.
    let origin_tls = match handshake_origin(
        origin_tcp,
        &sni,
        &hello,
        rt.options.insecure_skip_verify_tls,
        rt.options.timeouts.tls_handshake,
    )
    .await
    {
        Ok(stream) => stream,
        Err(error) => {
            log_error("origin TLS handshake", &error);
            return Ok(());
        }
    };
    server.record_tls_state(origin_snapshot(&origin_tls, &sni));
    rt.addons.tls_established_server(ctx);

    let leaf = match rt.ca.generate_cert(&sni) {
        Ok(leaf) => leaf,
        Err(error) => {
            log_error("leaf issuance", &error);
            return Ok(());
        }
    };

    ctx.client.set_tls();
    let replay = ReplayStream::new(std::mem::take(&mut client.read_buf), client.stream);
    let client_tls = match accept_client(
        replay,
        Arc::clone(&leaf.server_config),
        rt.options.timeouts.tls_handshake,
    )
    .await
    {
        Ok(stream) => stream,
        Err(error) => {
            log_error("client TLS accept", &error);
            return Ok(());
        }
    };

    let mut client_conn = BufferedConn::new(client_tls);
    let mut link = UpstreamLink::pinned(origin_tls, Arc::clone(&server));
    engine::serve_flows(rt, ctx, &mut client_conn, &mut link, Scheme::Https, None).await
}

async fn fill_peek(
    rt: &Arc<Runtime>,
    client: &mut BufferedConn<TcpStream>,
    target: usize,
) -> io::Result<bool> {
    while client.read_buf.len() < target {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = tokio::time::timeout(
            rt.options.timeouts.idle_keepalive,
            client.stream.read(&mut chunk),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"))??;
        if read == 0 {
            return Ok(false);
        }
        client.read_buf.extend_from_slice(&chunk[..read]);
    }
    Ok(true)
}

async fn run_cleartext_tunnel(
    rt: &Arc<Runtime>,
    mut client: BufferedConn<TcpStream>,
    mut origin: TcpStream,
) -> io::Result<()> {
    let peeked = std::mem::take(&mut client.read_buf);
    if !peeked.is_empty() {
        origin.write_all(&peeked).await?;
    }
    match transfer(
        &mut client.stream,
        &mut origin,
        rt.options.timeouts.idle_keepalive,
    )
    .await
    {
        Ok((from_client, from_server)) => {
            tracing::debug!(from_client, from_server, "tunnel closed");
            Ok(())
        }
        Err(error) => {
            log_error("tunnel copy", &error);
            Ok(())
        }
    }
}
