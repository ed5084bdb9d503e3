use std::io::{self, Read};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Uri};
use tokio::sync::watch;
use uuid::Uuid;

use crate::connection::ConnContext;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Absolute form after reconstruction, scheme and authority included.
    pub url: Uri,
    pub headers: HeaderMap,
    /// Absent until buffered; stays absent for streamed bodies.
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Whether `replace_to_decoded_body` already ran.
    pub decoded: bool,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: HeaderMap::new(),
            body: None,
            decoded: false,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub(crate) fn bad_gateway() -> Self {
        Self::new(502, "Bad Gateway")
    }

    /// Decode `Content-Encoding: gzip|deflate|br` in place: the body becomes
    /// the plaintext, the encoding header is cleared, and Content-Length is
    /// recomputed. No-op when the response carries no encoded body.
    pub fn replace_to_decoded_body(&mut self) -> io::Result<()> {
        let Some(body) = self.body.clone() else {
            return Ok(());
        };
        let Some(encoding) = self
            .headers
            .get(http::header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_ascii_lowercase())
        else {
            return Ok(());
        };

        let decoded = match encoding.as_str() {
            "identity" => body.to_vec(),
            "gzip" | "x-gzip" => decompress_gzip(body.as_ref())?,
            "deflate" => decompress_deflate(body.as_ref())?,
            "br" => decompress_brotli(body.as_ref())?,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported content-encoding: {other}"),
                ));
            }
        };

        self.headers.remove(http::header::CONTENT_ENCODING);
        let length = HeaderValue::from_str(&decoded.len().to_string())
            .expect("decimal length is a valid header value");
        self.headers.insert(http::header::CONTENT_LENGTH, length);
        self.body = Some(Bytes::from(decoded));
        self.decoded = true;
        Ok(())
    }
}

/// Completion record published through the done signal, consumed by addons
/// that report request latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSummary {
    pub status: Option<u16>,
    pub content_length: usize,
}

/// Awaitable side of a flow's done signal.
#[derive(Debug, Clone)]
pub struct FlowDone {
    rx: watch::Receiver<bool>,
    summary: Arc<OnceLock<FlowSummary>>,
}

impl FlowDone {
    /// Resolves when the flow completes; `None` when the flow was abandoned
    /// without completing.
    pub async fn wait(mut self) -> Option<FlowSummary> {
        loop {
            if *self.rx.borrow() {
                return self.summary.get().cloned();
            }
            if self.rx.changed().await.is_err() {
                return self.summary.get().cloned();
            }
        }
    }
}

/// One request/response exchange within a connection context.
pub struct Flow {
    pub id: Uuid,
    pub request: Request,
    pub response: Option<Response>,
    pub conn: Arc<ConnContext>,
    done_tx: watch::Sender<bool>,
    summary: Arc<OnceLock<FlowSummary>>,
}

impl Flow {
    pub(crate) fn new(request: Request, conn: Arc<ConnContext>) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            request,
            response: None,
            conn,
            done_tx,
            summary: Arc::new(OnceLock::new()),
        }
    }

    pub fn done(&self) -> FlowDone {
        FlowDone {
            rx: self.done_tx.subscribe(),
            summary: Arc::clone(&self.summary),
        }
    }

    /// Close the done signal. Idempotent: only the first call publishes a
    /// summary and wakes waiters.
    pub(crate) fn complete(&mut self) {
        let summary = FlowSummary {
            status: self.response.as_ref().map(|response| response.status),
            content_length: self
                .response
                .as_ref()
                .and_then(|response| response.body.as_ref())
                .map(Bytes::len)
                .unwrap_or(0),
        };
        if self.summary.set(summary).is_ok() {
            self.done_tx.send_replace(true);
        }
    }
}

fn decompress_gzip(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = flate2::read::MultiGzDecoder::new(input);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn decompress_deflate(input: &[u8]) -> io::Result<Vec<u8>> {
    // HTTP deflate is zlib-wrapped, but some origins send raw streams.
    let mut out = Vec::new();
    match flate2::read::ZlibDecoder::new(input).read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(_) => {
            out.clear();
            flate2::read::DeflateDecoder::new(input).read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

fn decompress_brotli(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = brotli::Decompressor::new(input, 4096);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
