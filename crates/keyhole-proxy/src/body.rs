use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::head::BodyMode;
use crate::helper::{find_subsequence, BufferedConn, IO_CHUNK_SIZE};

const CHUNK_LINE_LIMIT: usize = 8 * 1024;

/// Reader over a message body with the transfer framing removed: chunked
/// bodies come out de-chunked, length-delimited bodies stop at the length,
/// close-delimited bodies run to EOF. EOF from this reader means the body is
/// complete and the underlying connection is positioned at the next message.
pub(crate) struct BodySource<'a, S> {
    conn: &'a mut BufferedConn<S>,
    state: SourceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Exact { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    UntilEof,
    Done,
}

impl<'a, S: AsyncRead + Unpin> BodySource<'a, S> {
    pub(crate) fn new(conn: &'a mut BufferedConn<S>, mode: BodyMode) -> Self {
        let state = match mode {
            BodyMode::None => SourceState::Done,
            BodyMode::ContentLength(0) => SourceState::Done,
            BodyMode::ContentLength(length) => SourceState::Exact { remaining: length },
            BodyMode::Chunked => SourceState::ChunkSize,
            BodyMode::CloseDelimited => SourceState::UntilEof,
        };
        Self { conn, state }
    }

    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let mut buf = ReadBuf::new(&mut chunk);
        match Pin::new(&mut self.conn.stream).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled();
                self.conn.read_buf.extend_from_slice(filled);
                Poll::Ready(Ok(filled.len()))
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn emit(&mut self, out: &mut ReadBuf<'_>, limit: u64) -> usize {
        let take = (self.conn.read_buf.len())
            .min(out.remaining())
            .min(limit as usize);
        out.put_slice(&self.conn.read_buf[..take]);
        self.conn.read_buf.drain(..take);
        take
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BodySource<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match this.state {
                SourceState::Done => return Poll::Ready(Ok(())),
                SourceState::Exact { remaining } => {
                    if this.conn.read_buf.is_empty() {
                        match this.poll_fill(cx) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(unexpected_eof(
                                    "connection closed before body completed",
                                )));
                            }
                            Poll::Ready(Ok(_)) => {}
                            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    let taken = this.emit(out, remaining) as u64;
                    this.state = if taken == remaining {
                        SourceState::Done
                    } else {
                        SourceState::Exact {
                            remaining: remaining - taken,
                        }
                    };
                    return Poll::Ready(Ok(()));
                }
                SourceState::ChunkSize => {
                    match find_subsequence(&this.conn.read_buf, b"\r\n") {
                        Some(line_end) => {
                            let length = match parse_chunk_len(&this.conn.read_buf[..line_end]) {
                                Ok(length) => length,
                                Err(error) => return Poll::Ready(Err(error)),
                            };
                            this.conn.read_buf.drain(..line_end + 2);
                            this.state = if length == 0 {
                                SourceState::Trailers
                            } else {
                                SourceState::ChunkData { remaining: length }
                            };
                        }
                        None => {
                            if this.conn.read_buf.len() > CHUNK_LINE_LIMIT {
                                return Poll::Ready(Err(invalid_data(
                                    "chunk size line exceeded limit",
                                )));
                            }
                            match this.poll_fill(cx) {
                                Poll::Ready(Ok(0)) => {
                                    return Poll::Ready(Err(unexpected_eof(
                                        "connection closed inside chunked body",
                                    )));
                                }
                                Poll::Ready(Ok(_)) => {}
                                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                                Poll::Pending => return Poll::Pending,
                            }
                        }
                    }
                }
                SourceState::ChunkData { remaining } => {
                    if this.conn.read_buf.is_empty() {
                        match this.poll_fill(cx) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(unexpected_eof(
                                    "connection closed inside chunked body",
                                )));
                            }
                            Poll::Ready(Ok(_)) => {}
                            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    let taken = this.emit(out, remaining) as u64;
                    this.state = if taken == remaining {
                        SourceState::ChunkDataEnd
                    } else {
                        SourceState::ChunkData {
                            remaining: remaining - taken,
                        }
                    };
                    return Poll::Ready(Ok(()));
                }
                SourceState::ChunkDataEnd => {
                    if this.conn.read_buf.len() < 2 {
                        match this.poll_fill(cx) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(unexpected_eof(
                                    "connection closed inside chunked body",
                                )));
                            }
                            Poll::Ready(Ok(_)) => {}
                            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                            Poll::Pending => return Poll::Pending,
                        }
                        continue;
                    }
                    if &this.conn.read_buf[..2] != b"\r\n" {
                        return Poll::Ready(Err(invalid_data("invalid chunk terminator")));
                    }
                    this.conn.read_buf.drain(..2);
                    this.state = SourceState::ChunkSize;
                }
                SourceState::Trailers => {
                    match find_subsequence(&this.conn.read_buf, b"\r\n") {
                        Some(0) => {
                            this.conn.read_buf.drain(..2);
                            this.state = SourceState::Done;
                        }
                        Some(line_end) => {
                            // Trailer fields are dropped from the decoded stream.
                            this.conn.read_buf.drain(..line_end + 2);
                        }
                        None => {
                            if this.conn.read_buf.len() > CHUNK_LINE_LIMIT {
                                return Poll::Ready(Err(invalid_data(
                                    "chunked trailers exceeded limit",
                                )));
                            }
                            match this.poll_fill(cx) {
                                Poll::Ready(Ok(0)) => {
                                    return Poll::Ready(Err(unexpected_eof(
                                        "connection closed inside chunked trailers",
                                    )));
                                }
                                Poll::Ready(Ok(_)) => {}
                                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                                Poll::Pending => return Poll::Pending,
                            }
                        }
                    }
                }
                SourceState::UntilEof => {
                    if this.conn.read_buf.is_empty() {
                        match this.poll_fill(cx) {
                            Poll::Ready(Ok(0)) => {
                                this.state = SourceState::Done;
                                return Poll::Ready(Ok(()));
                            }
                            Poll::Ready(Ok(_)) => {}
                            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    this.emit(out, u64::MAX);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text =
        std::str::from_utf8(line).map_err(|_| invalid_data("chunk size line is not UTF-8"))?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| invalid_data("invalid chunk size"))
}

/// Re-chunk a decoded body stream onto `sink`; returns the payload byte
/// count. Streamed bodies are always forwarded chunked, so a modifier that
/// changes the length never conflicts with declared framing.
pub(crate) async fn write_chunked<R, W>(reader: &mut R, sink: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    let mut total = 0_u64;
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        sink.write_all(format!("{read:x}\r\n").as_bytes()).await?;
        sink.write_all(&chunk[..read]).await?;
        sink.write_all(b"\r\n").await?;
        total += read as u64;
    }
    sink.write_all(b"0\r\n\r\n").await?;
    sink.flush().await?;
    Ok(total)
}

fn invalid_data(detail: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail)
}

fn unexpected_eof(detail: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, detail)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::{write_chunked, BodySource};
    use crate::head::BodyMode;
    use crate::helper::BufferedConn;

    async fn drain<S: tokio::io::AsyncRead + Unpin>(source: &mut BodySource<'_, S>) -> Vec<u8> {
        let mut out = Vec::new();
        source.read_to_end(&mut out).await.expect("drain body");
        out
    }

    #[tokio::test]
    async fn exact_body_stops_at_declared_length() {
        let mut conn = BufferedConn::new(std::io::Cursor::new(b"hello world".to_vec()));
        let mut source = BodySource::new(&mut conn, BodyMode::ContentLength(5));
        assert_eq!(drain(&mut source).await, b"hello");
        assert_eq!(conn.read_buf, b" world");
    }

    #[tokio::test]
    async fn chunked_body_is_dechunked_and_positions_past_trailers() {
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT".to_vec();
        let mut conn = BufferedConn::new(std::io::Cursor::new(wire));
        let mut source = BodySource::new(&mut conn, BodyMode::Chunked);
        assert_eq!(drain(&mut source).await, b"hello world");
        assert_eq!(conn.read_buf, b"NEXT");
    }

    #[tokio::test]
    async fn chunk_extensions_are_tolerated() {
        let wire = b"5;ext=1\r\nhello\r\n0\r\n\r\n".to_vec();
        let mut conn = BufferedConn::new(std::io::Cursor::new(wire));
        let mut source = BodySource::new(&mut conn, BodyMode::Chunked);
        assert_eq!(drain(&mut source).await, b"hello");
    }

    #[tokio::test]
    async fn close_delimited_body_runs_to_eof() {
        let mut conn = BufferedConn::new(std::io::Cursor::new(b"everything".to_vec()));
        let mut source = BodySource::new(&mut conn, BodyMode::CloseDelimited);
        assert_eq!(drain(&mut source).await, b"everything");
    }

    #[tokio::test]
    async fn truncated_exact_body_errors() {
        let mut conn = BufferedConn::new(std::io::Cursor::new(b"abc".to_vec()));
        let mut source = BodySource::new(&mut conn, BodyMode::ContentLength(10));
        let mut out = Vec::new();
        let error = source
            .read_to_end(&mut out)
            .await
            .expect_err("truncated body must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn rechunked_output_round_trips_through_the_decoder() {
        let payload = vec![b'z'; 20_000];
        let mut encoded = Vec::new();
        let mut reader = std::io::Cursor::new(payload.clone());
        let written = write_chunked(&mut reader, &mut encoded)
            .await
            .expect("write chunked");
        assert_eq!(written, payload.len() as u64);

        let mut conn = BufferedConn::new(std::io::Cursor::new(encoded));
        let mut source = BodySource::new(&mut conn, BodyMode::Chunked);
        assert_eq!(drain(&mut source).await, payload);
    }
}
