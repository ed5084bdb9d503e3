use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Error texts that mean a peer went away in one of the usual ways. These are
/// logged at debug level; everything else is an error worth looking at.
const NORMAL_DISCONNECT_MARKERS: &[&str] = &[
    "connection reset by peer",
    "broken pipe",
    "i/o timeout",
    "timed out",
    "TLS handshake timeout",
    "read/write on closed pipe",
    "connection refused",
    "use of closed network connection",
    "unexpected end of file",
    "unexpected eof",
];

/// Log `error` under `context`, classifying benign transport disconnects down
/// to debug level. Returns true when the error was unexpected.
pub fn log_error(context: &'static str, error: &dyn std::fmt::Display) -> bool {
    let text = error.to_string();
    let benign = NORMAL_DISCONNECT_MARKERS
        .iter()
        .any(|marker| text.contains(marker));
    if benign {
        tracing::debug!(context, error = %text, "transport disconnect");
        false
    } else {
        tracing::error!(context, error = %text, "network error");
        true
    }
}

/// A stream plus a staging buffer for head parsing. Bytes land in `read_buf`
/// until a message boundary is found; body readers drain the buffer before
/// touching the stream again.
pub(crate) struct BufferedConn<S> {
    pub(crate) stream: S,
    pub(crate) read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

pub(crate) async fn read_until_pattern<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    pattern: &[u8],
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some(start) = find_subsequence(&conn.read_buf, pattern) {
            let end = start + pattern.len();
            let bytes = conn.read_buf.drain(..end).collect::<Vec<_>>();
            return Ok(Some(bytes));
        }

        if conn.read_buf.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message head exceeded configured limit",
            ));
        }

        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            if conn.read_buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before message boundary was reached",
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..read]);
    }
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Outcome of buffering a body against the streaming threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferedBody {
    /// The whole body fit strictly below the limit.
    Complete(Bytes),
    /// The limit was reached; `prefix` holds the bytes read so far and the
    /// rest must be streamed from the source.
    Streamed(Bytes),
}

/// Read up to `limit` bytes from `reader`. Reaching the limit exactly means
/// the body is not buffered: the prefix is returned for streaming instead.
pub(crate) async fn reader_to_buffer<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    limit: usize,
) -> io::Result<BufferedBody> {
    let mut buffered = Vec::with_capacity(limit.min(IO_CHUNK_SIZE));
    let mut chunk = [0_u8; IO_CHUNK_SIZE];

    while buffered.len() < limit {
        let want = (limit - buffered.len()).min(IO_CHUNK_SIZE);
        let read = reader.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Ok(BufferedBody::Complete(Bytes::from(buffered)));
        }
        buffered.extend_from_slice(&chunk[..read]);
    }

    Ok(BufferedBody::Streamed(Bytes::from(buffered)))
}

/// Full-duplex copy with half-close discipline: EOF in one direction shuts
/// down the peer's write side while the opposite direction keeps flowing.
/// Returns bytes copied (a→b, b→a) once both directions terminate.
pub(crate) async fn transfer<A, B>(
    side_a: &mut A,
    side_b: &mut B,
    idle: Duration,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut a_to_b = [0_u8; IO_CHUNK_SIZE];
    let mut b_to_a = [0_u8; IO_CHUNK_SIZE];
    let mut bytes_from_a = 0_u64;
    let mut bytes_from_b = 0_u64;
    let mut a_closed = false;
    let mut b_closed = false;

    while !(a_closed && b_closed) {
        tokio::select! {
            result = read_with_timeout(side_a, &mut a_to_b, idle), if !a_closed => {
                let read = result?;
                if read == 0 {
                    a_closed = true;
                    let _ = side_b.shutdown().await;
                } else {
                    side_b.write_all(&a_to_b[..read]).await?;
                    bytes_from_a += read as u64;
                }
            }
            result = read_with_timeout(side_b, &mut b_to_a, idle), if !b_closed => {
                let read = result?;
                if read == 0 {
                    b_closed = true;
                    let _ = side_a.shutdown().await;
                } else {
                    side_a.write_all(&b_to_a[..read]).await?;
                    bytes_from_b += read as u64;
                }
            }
        }
    }

    Ok((bytes_from_a, bytes_from_b))
}

pub(crate) async fn read_with_timeout<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> io::Result<usize> {
    tokio::time::timeout(timeout, reader.read(buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"))?
}

/// Resolve the proxy to use for an outbound dial from the environment,
/// honoring `NO_PROXY`. Returns the proxy authority (`host:port`).
pub(crate) fn proxy_from_env(scheme: &str, host: &str) -> Option<String> {
    if no_proxy_matches(host) {
        return None;
    }
    let raw = match scheme {
        "https" => env_first(&["HTTPS_PROXY", "https_proxy"]),
        _ => env_first(&["HTTP_PROXY", "http_proxy"]),
    }?;
    proxy_authority(&raw)
}

fn env_first(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

fn no_proxy_matches(host: &str) -> bool {
    let Ok(no_proxy) = std::env::var("NO_PROXY").or_else(|_| std::env::var("no_proxy")) else {
        return false;
    };
    for entry in no_proxy.split(',') {
        let entry = entry.trim().trim_start_matches('.');
        if entry.is_empty() {
            continue;
        }
        if entry == "*" || host == entry || host.ends_with(&format!(".{entry}")) {
            return true;
        }
    }
    false
}

fn proxy_authority(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let authority = without_scheme
        .split(['/', '?'])
        .next()
        .unwrap_or(without_scheme);
    if authority.is_empty() {
        return None;
    }
    if authority.contains(':') {
        Some(authority.to_string())
    } else {
        Some(format!("{authority}:80"))
    }
}
