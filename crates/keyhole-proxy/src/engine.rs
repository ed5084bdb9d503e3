use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Uri};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::addon::HookAction;
use crate::body::{write_chunked, BodySource};
use crate::connection::ConnContext;
use crate::flow::{Flow, Request, Response};
use crate::head::{
    parse_request_head, parse_response_head, serialize_request_head, serialize_response_head,
    BodyMode, RequestHead,
};
use crate::helper::{read_until_pattern, reader_to_buffer, BufferedBody, BufferedConn};
use crate::intercept::InterceptDecision;
use crate::proxy::Runtime;
use crate::upstream::UpstreamLink;

const NOT_A_PROXY_BODY: &str =
    "this endpoint is an HTTP(S) proxy; configure it as a proxy instead of requesting it directly";

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowEnd {
    KeepAlive,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecisionOutcome {
    Continue,
    ReplacedResponse,
    Canceled,
}

/// HTTP/1.1 request loop over one client connection. Flows run strictly in
/// request order; the next head is not parsed until the current response is
/// fully written.
pub(crate) async fn serve_flows<C>(
    rt: &Arc<Runtime>,
    ctx: &Arc<ConnContext>,
    client: &mut BufferedConn<C>,
    upstream: &mut UpstreamLink,
    scheme: Scheme,
    mut first: Option<RequestHead>,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let head = match first.take() {
            Some(head) => head,
            None => {
                let read = tokio::time::timeout(
                    rt.options.timeouts.idle_keepalive,
                    read_until_pattern(client, b"\r\n\r\n", rt.options.max_head_bytes),
                )
                .await;
                let bytes = match read {
                    Err(_) => return Ok(()), // idle keepalive expired
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Ok(Some(bytes))) => bytes,
                    Ok(Err(error)) => return Err(error),
                };
                match parse_request_head(&bytes) {
                    Ok(head) => head,
                    Err(error) => {
                        tracing::debug!(error = %error, "client protocol error");
                        write_simple_response(client, 400, "Bad Request", "malformed request")
                            .await?;
                        return Ok(());
                    }
                }
            }
        };

        match serve_one_flow(rt, ctx, client, upstream, scheme, head).await? {
            FlowEnd::KeepAlive => continue,
            FlowEnd::Close => return Ok(()),
        }
    }
}

async fn serve_one_flow<C>(
    rt: &Arc<Runtime>,
    ctx: &Arc<ConnContext>,
    client: &mut BufferedConn<C>,
    upstream: &mut UpstreamLink,
    scheme: Scheme,
    head: RequestHead,
) -> io::Result<FlowEnd>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    tracing::debug!(
        method = %head.method,
        target = %head.target,
        version = head.version.as_str(),
        "flow start"
    );
    if head.method.eq_ignore_ascii_case("CONNECT") {
        write_simple_response(client, 400, "Bad Request", "nested CONNECT is not supported")
            .await?;
        return Ok(FlowEnd::Close);
    }

    let url = match build_url(scheme, &head, ctx) {
        Ok(url) => url,
        Err(detail) => {
            write_simple_response(client, 400, "Bad Request", detail).await?;
            return Ok(FlowEnd::Close);
        }
    };

    let client_wants_close = head.connection_close;
    let mut flow = Flow::new(
        Request {
            method: head.method.clone(),
            url,
            headers: head.headers.clone(),
            body: None,
        },
        Arc::clone(ctx),
    );

    rt.addons.requestheaders(&mut flow).await;

    let mut dispatched = false;
    let mut upstream_failure: Option<String> = None;

    match head.body_mode {
        BodyMode::None => {
            let action = rt.addons.request(&mut flow).await;
            if action == HookAction::Intercept {
                match wait_for_decision(rt, &mut flow, Some(client)).await {
                    DecisionOutcome::Canceled => return Ok(FlowEnd::Close),
                    DecisionOutcome::Continue | DecisionOutcome::ReplacedResponse => {}
                }
            }
            if flow.response.is_none() {
                match dispatch_buffered(rt, ctx, upstream, &flow, scheme).await {
                    Ok(()) => dispatched = true,
                    Err(error) => {
                        tracing::error!(error = %error, "upstream dispatch failed");
                        upstream.close(rt, ctx);
                        upstream_failure = Some(error.to_string());
                    }
                }
            }
        }
        mode => {
            let mut source = BodySource::new(&mut *client, mode);
            match reader_to_buffer(&mut source, rt.options.stream_large_bodies).await {
                Err(error) => {
                    drop(source);
                    tracing::debug!(error = %error, "request body read failed");
                    write_simple_response(client, 400, "Bad Request", "invalid request body")
                        .await?;
                    return Ok(FlowEnd::Close);
                }
                Ok(BufferedBody::Complete(bytes)) => {
                    drop(source);
                    flow.request.body = Some(bytes);
                    let action = rt.addons.request(&mut flow).await;
                    if action == HookAction::Intercept {
                        match wait_for_decision(rt, &mut flow, Some(client)).await {
                            DecisionOutcome::Canceled => return Ok(FlowEnd::Close),
                            DecisionOutcome::Continue | DecisionOutcome::ReplacedResponse => {}
                        }
                    }
                    if flow.response.is_none() {
                        match dispatch_buffered(rt, ctx, upstream, &flow, scheme).await {
                            Ok(()) => dispatched = true,
                            Err(error) => {
                                tracing::error!(error = %error, "upstream dispatch failed");
                                upstream.close(rt, ctx);
                                upstream_failure = Some(error.to_string());
                            }
                        }
                    }
                }
                Ok(BufferedBody::Streamed(prefix)) => {
                    // Large request: addons see no body; the stream modifiers
                    // get their chance during the upstream copy.
                    let action = rt.addons.request(&mut flow).await;
                    if action == HookAction::Intercept {
                        // The client socket is owned by the body stream, so
                        // cancel-on-disconnect is unavailable here.
                        match wait_for_decision::<C>(rt, &mut flow, None).await {
                            DecisionOutcome::Canceled => return Ok(FlowEnd::Close),
                            DecisionOutcome::Continue | DecisionOutcome::ReplacedResponse => {}
                        }
                    }
                    if flow.response.is_none() {
                        match dispatch_streamed(rt, ctx, upstream, &flow, scheme, prefix, source)
                            .await
                        {
                            Ok(()) => dispatched = true,
                            Err(error) => {
                                // The request body is partially consumed, so
                                // the client framing cannot be trusted.
                                tracing::error!(error = %error, "upstream dispatch failed");
                                upstream.close(rt, ctx);
                                write_simple_response(client, 502, "Bad Gateway", &error.to_string())
                                    .await?;
                                flow.complete();
                                return Ok(FlowEnd::Close);
                            }
                        }
                    } else {
                        // A synthetic response arrived while the body was
                        // half-read; the connection cannot be reused.
                        drop(source);
                        ctx.set_close_after_response();
                    }
                }
            }
        }
    }

    if let Some(detail) = upstream_failure {
        // Raw 502 without response hooks; the flow still completes so done
        // waiters resolve.
        flow.response = Some(Response::bad_gateway().with_body(detail));
        write_buffered_response(client, ctx, &mut flow).await?;
        flow.complete();
        return Ok(end_for(ctx, client_wants_close));
    }

    response_phase(rt, ctx, client, upstream, &mut flow, &head.method, dispatched, client_wants_close)
        .await
}

#[allow(clippy::too_many_arguments)]
async fn response_phase<C>(
    rt: &Arc<Runtime>,
    ctx: &Arc<ConnContext>,
    client: &mut BufferedConn<C>,
    upstream: &mut UpstreamLink,
    flow: &mut Flow,
    method: &str,
    dispatched: bool,
    client_wants_close: bool,
) -> io::Result<FlowEnd>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    if client_wants_close {
        ctx.set_close_after_response();
    }

    let mut response_mode = BodyMode::None;
    let mut upstream_done = true;
    if dispatched {
        let conn = upstream
            .conn()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "upstream vanished"))?;
        let read = tokio::time::timeout(
            rt.options.timeouts.idle_keepalive,
            read_until_pattern(conn, b"\r\n\r\n", rt.options.max_head_bytes),
        )
        .await;
        let head_bytes = match read {
            Ok(Ok(Some(bytes))) => Some(bytes),
            Ok(Ok(None)) => None,
            Ok(Err(error)) => {
                tracing::error!(error = %error, "upstream response head read failed");
                None
            }
            Err(_) => None,
        };
        let parsed = head_bytes.and_then(|bytes| match parse_response_head(&bytes, method) {
            Ok(parsed) => Some(parsed),
            Err(error) => {
                tracing::error!(error = %error, "upstream response head parse failed");
                None
            }
        });
        match parsed {
            Some(resp_head) => {
                if resp_head.connection_close {
                    ctx.set_close_after_response();
                }
                response_mode = resp_head.body_mode;
                upstream_done = false;
                flow.response = Some(Response {
                    status: resp_head.status,
                    reason: resp_head.reason,
                    headers: resp_head.headers,
                    body: None,
                    decoded: false,
                });
            }
            None => {
                upstream.close(rt, ctx);
                flow.response =
                    Some(Response::bad_gateway().with_body("upstream sent no valid response"));
                write_buffered_response(client, ctx, flow).await?;
                flow.complete();
                return Ok(end_for(ctx, client_wants_close));
            }
        }
    }

    rt.addons.responseheaders(flow).await;

    if dispatched && !upstream_done && response_mode != BodyMode::None {
        let conn = upstream
            .conn()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "upstream vanished"))?;
        let mut source = BodySource::new(conn, response_mode);
        match reader_to_buffer(&mut source, rt.options.stream_large_bodies).await {
            Err(error) => {
                drop(source);
                tracing::error!(error = %error, "upstream response body read failed");
                upstream.close(rt, ctx);
                flow.response =
                    Some(Response::bad_gateway().with_body("upstream body read failed"));
                write_buffered_response(client, ctx, flow).await?;
                flow.complete();
                return Ok(end_for(ctx, client_wants_close));
            }
            Ok(BufferedBody::Complete(bytes)) => {
                drop(source);
                if let Some(response) = flow.response.as_mut() {
                    response.body = Some(bytes);
                }
                if run_response_hooks(rt, flow, client).await == DecisionOutcome::Canceled {
                    return Ok(FlowEnd::Close);
                }
                write_buffered_response(client, ctx, flow).await?;
            }
            Ok(BufferedBody::Streamed(prefix)) => {
                // Addons that want the body as bytes see none here.
                let action = rt.addons.response(flow).await;
                let mut replaced = false;
                if action == HookAction::Intercept {
                    match wait_for_decision::<C>(rt, flow, None).await {
                        DecisionOutcome::Canceled => return Ok(FlowEnd::Close),
                        DecisionOutcome::ReplacedResponse => replaced = true,
                        DecisionOutcome::Continue => {}
                    }
                }
                if replaced {
                    // The original upstream body is unread; the connection
                    // cannot carry another exchange.
                    drop(source);
                    upstream.close(rt, ctx);
                    ctx.set_close_after_response();
                    write_buffered_response(client, ctx, flow).await?;
                } else {
                    write_streamed_response(rt, ctx, client, flow, prefix, source).await?;
                }
            }
        }
    } else {
        if run_response_hooks(rt, flow, client).await == DecisionOutcome::Canceled {
            return Ok(FlowEnd::Close);
        }
        write_buffered_response(client, ctx, flow).await?;
    }

    flow.complete();
    Ok(end_for(ctx, client_wants_close))
}

/// Response hook fan-out plus the optional interception rendezvous, with
/// client-disconnect cancellation.
async fn run_response_hooks<C>(
    rt: &Arc<Runtime>,
    flow: &mut Flow,
    client: &mut BufferedConn<C>,
) -> DecisionOutcome
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let action = rt.addons.response(flow).await;
    if action == HookAction::Intercept {
        return wait_for_decision(rt, flow, Some(client)).await;
    }
    DecisionOutcome::Continue
}

/// Park the flow on the interception rendezvous until the external
/// controller posts a decision. When the client socket is available, a read
/// returning EOF cancels the rendezvous; stray pipelined bytes are kept for
/// the next head parse.
async fn wait_for_decision<C>(
    rt: &Arc<Runtime>,
    flow: &mut Flow,
    client: Option<&mut BufferedConn<C>>,
) -> DecisionOutcome
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut rx = rt.hub.register(flow.id);
    let decision = match client {
        None => rx.await.ok(),
        Some(conn) => {
            let mut probe = [0_u8; 256];
            loop {
                tokio::select! {
                    decision = &mut rx => break decision.ok(),
                    read = conn.stream.read(&mut probe) => match read {
                        Ok(0) | Err(_) => {
                            rt.hub.cancel(flow.id);
                            break None;
                        }
                        Ok(read) => conn.read_buf.extend_from_slice(&probe[..read]),
                    }
                }
            }
        }
    };

    match decision {
        None => DecisionOutcome::Canceled,
        Some(InterceptDecision::ChangeRequest {
            method,
            url,
            headers,
            body,
        }) => {
            flow.request.method = method;
            flow.request.url = url;
            flow.request.headers = headers;
            flow.request.body = body;
            DecisionOutcome::Continue
        }
        Some(InterceptDecision::ChangeResponse {
            status,
            headers,
            body,
        }) => {
            let reason = http::StatusCode::from_u16(status)
                .ok()
                .and_then(|code| code.canonical_reason())
                .unwrap_or("")
                .to_string();
            flow.response = Some(Response {
                status,
                reason,
                headers,
                body: Some(body),
                decoded: false,
            });
            DecisionOutcome::ReplacedResponse
        }
        Some(InterceptDecision::DropRequest) | Some(InterceptDecision::DropResponse) => {
            flow.response = Some(Response::bad_gateway());
            DecisionOutcome::ReplacedResponse
        }
    }
}

async fn dispatch_buffered(
    rt: &Arc<Runtime>,
    ctx: &Arc<ConnContext>,
    upstream: &mut UpstreamLink,
    flow: &Flow,
    scheme: Scheme,
) -> io::Result<()> {
    let (scheme_str, host, port) = upstream_target(&flow.request, scheme)?;
    upstream.ensure(rt, ctx, scheme_str, &host, port).await?;
    let absolute = upstream.absolute_form();
    let conn = upstream
        .conn()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "upstream vanished"))?;

    let headers = outbound_headers(
        &flow.request,
        flow.request.body.as_ref().map(Bytes::len),
        false,
    );
    let head = serialize_request_head(
        &flow.request.method,
        &outbound_target(&flow.request, absolute),
        &headers,
    );
    conn.stream.write_all(&head).await?;
    if let Some(body) = flow.request.body.as_ref() {
        conn.stream.write_all(body).await?;
    }
    conn.stream.flush().await?;
    Ok(())
}

async fn dispatch_streamed<C>(
    rt: &Arc<Runtime>,
    ctx: &Arc<ConnContext>,
    upstream: &mut UpstreamLink,
    flow: &Flow,
    scheme: Scheme,
    prefix: Bytes,
    source: BodySource<'_, C>,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (scheme_str, host, port) = upstream_target(&flow.request, scheme)?;
    upstream.ensure(rt, ctx, scheme_str, &host, port).await?;
    let absolute = upstream.absolute_form();
    let conn = upstream
        .conn()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "upstream vanished"))?;

    let headers = outbound_headers(&flow.request, None, true);
    let head = serialize_request_head(
        &flow.request.method,
        &outbound_target(&flow.request, absolute),
        &headers,
    );
    conn.stream.write_all(&head).await?;

    let chained = std::io::Cursor::new(prefix).chain(source);
    let mut reader = rt.addons.wrap_request_stream(Box::new(chained));
    write_chunked(reader.as_mut(), &mut conn.stream).await?;
    Ok(())
}

async fn write_streamed_response<C, U>(
    rt: &Arc<Runtime>,
    ctx: &Arc<ConnContext>,
    client: &mut BufferedConn<C>,
    flow: &mut Flow,
    prefix: Bytes,
    source: BodySource<'_, U>,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + Unpin + Send,
{
    let response = flow
        .response
        .as_ref()
        .ok_or_else(|| io::Error::other("streamed response without head"))?;

    let mut headers = response.headers.clone();
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    if ctx.close_after_response() {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let head = serialize_response_head(response.status, &response.reason, &headers);
    client.stream.write_all(&head).await?;

    let chained = std::io::Cursor::new(prefix).chain(source);
    let mut reader = rt.addons.wrap_response_stream(Box::new(chained));
    write_chunked(reader.as_mut(), &mut client.stream).await?;
    Ok(())
}

async fn write_buffered_response<C>(
    client: &mut BufferedConn<C>,
    ctx: &ConnContext,
    flow: &mut Flow,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let response = flow.response.get_or_insert_with(Response::bad_gateway);

    let mut headers = response.headers.clone();
    headers.remove(TRANSFER_ENCODING);
    let body_len = response.body.as_ref().map(Bytes::len).unwrap_or(0);
    let carries_body =
        !(response.status < 200 || response.status == 204 || response.status == 304);
    if carries_body {
        headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&body_len.to_string())
                .expect("decimal length is a valid header value"),
        );
    } else {
        headers.remove(CONTENT_LENGTH);
    }
    if ctx.close_after_response() {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let reason = if response.reason.is_empty() {
        http::StatusCode::from_u16(response.status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("")
            .to_string()
    } else {
        response.reason.clone()
    };

    let head = serialize_response_head(response.status, &reason, &headers);
    client.stream.write_all(&head).await?;
    if carries_body {
        if let Some(body) = response.body.as_ref() {
            client.stream.write_all(body).await?;
        }
    }
    client.stream.flush().await?;
    Ok(())
}

pub(crate) async fn write_simple_response<S>(
    client: &mut BufferedConn<S>,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    client.stream.write_all(response.as_bytes()).await?;
    client.stream.flush().await
}

fn end_for(ctx: &ConnContext, client_wants_close: bool) -> FlowEnd {
    if ctx.close_after_response() || client_wants_close {
        FlowEnd::Close
    } else {
        FlowEnd::KeepAlive
    }
}

fn build_url(scheme: Scheme, head: &RequestHead, ctx: &ConnContext) -> Result<Uri, &'static str> {
    match scheme {
        Scheme::Https => {
            let authority = head
                .headers
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .or_else(|| ctx.server().map(|server| server.address.clone()))
                .ok_or("missing Host header")?;
            let rendered = if head.target.starts_with('/') {
                format!("https://{authority}{}", head.target)
            } else if head.target == "*" {
                format!("https://{authority}/")
            } else {
                head.target.clone()
            };
            rendered.parse().map_err(|_| "invalid request target")
        }
        Scheme::Http => {
            let uri: Uri = head.target.parse().map_err(|_| NOT_A_PROXY_BODY)?;
            if uri.scheme_str().is_none() || uri.authority().is_none() {
                return Err(NOT_A_PROXY_BODY);
            }
            Ok(uri)
        }
    }
}

fn upstream_target(
    request: &Request,
    scheme: Scheme,
) -> io::Result<(&'static str, String, u16)> {
    let scheme_str = match request.url.scheme_str() {
        Some("https") => "https",
        Some("http") => "http",
        None => scheme.as_str(),
        Some(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported request scheme",
            ));
        }
    };
    let host = request
        .url
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request URL has no host"))?
        .trim_matches(['[', ']'])
        .to_string();
    let port = request
        .url
        .port_u16()
        .unwrap_or(if scheme_str == "https" { 443 } else { 80 });
    Ok((scheme_str, host, port))
}

fn outbound_target(request: &Request, absolute_form: bool) -> String {
    if absolute_form {
        request.url.to_string()
    } else {
        request
            .url
            .path_and_query()
            .map(|value| value.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    }
}

/// Outbound header map: hop-by-hop headers stripped, body framing rewritten
/// to match what is actually sent, Host restored from the URL authority.
fn outbound_headers(
    request: &Request,
    buffered_len: Option<usize>,
    streamed: bool,
) -> HeaderMap {
    let mut headers = request.headers.clone();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }

    if streamed {
        headers.remove(CONTENT_LENGTH);
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    } else {
        match buffered_len {
            Some(length) => {
                headers.insert(
                    CONTENT_LENGTH,
                    HeaderValue::from_str(&length.to_string())
                        .expect("decimal length is a valid header value"),
                );
            }
            None => {
                headers.remove(CONTENT_LENGTH);
            }
        }
    }

    if !headers.contains_key(HOST) {
        if let Some(authority) = request.url.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(HOST, value);
            }
        }
    }
    headers
}
