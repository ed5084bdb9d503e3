use std::io;

use http::header::{HeaderMap, HeaderName, HeaderValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) version: HttpVersion,
    pub(crate) headers: HeaderMap,
    pub(crate) body_mode: BodyMode,
    pub(crate) connection_close: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub(crate) version: HttpVersion,
    pub(crate) status: u16,
    pub(crate) reason: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body_mode: BodyMode,
    pub(crate) connection_close: bool,
}

pub(crate) fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| invalid_data("request head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| invalid_data("request line is missing"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| invalid_data("request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| invalid_data("request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| invalid_data("HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(invalid_data("request line had too many fields"));
    }
    let version = parse_version(version_text)?;

    let headers = parse_headers(lines)?;
    let body_mode = request_body_mode(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

pub(crate) fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| invalid_data("response head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| invalid_data("response status line is missing"))?;
    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| invalid_data("response version is missing"))?;
    let status_text = parts
        .next()
        .ok_or_else(|| invalid_data("response status is missing"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let version = parse_version(version_text)?;
    let status = status_text
        .parse::<u16>()
        .map_err(|_| invalid_data("invalid response status code"))?;

    let headers = parse_headers(lines)?;
    let mut connection_close = is_connection_close(version, &headers);
    let body_mode = response_body_mode(&headers, request_method, status)?;
    if body_mode == BodyMode::CloseDelimited {
        connection_close = true;
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        body_mode,
        connection_close,
    })
}

fn parse_version(text: &str) -> io::Result<HttpVersion> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(invalid_data("only HTTP/1.0 and HTTP/1.1 are supported")),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid_data("malformed header line"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| invalid_data("invalid header name"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| invalid_data("invalid header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn request_body_mode(headers: &HeaderMap) -> io::Result<BodyMode> {
    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    if let Some(length) = content_length(headers)? {
        return Ok(if length == 0 {
            BodyMode::None
        } else {
            BodyMode::ContentLength(length)
        });
    }
    Ok(BodyMode::None)
}

fn response_body_mode(
    headers: &HeaderMap,
    request_method: &str,
    status: u16,
) -> io::Result<BodyMode> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyMode::None);
    }
    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    if let Some(length) = content_length(headers)? {
        return Ok(if length == 0 {
            BodyMode::None
        } else {
            BodyMode::ContentLength(length)
        });
    }
    Ok(BodyMode::CloseDelimited)
}

fn content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    let mut value = None;
    for header in headers.get_all(http::header::CONTENT_LENGTH) {
        let text = header
            .to_str()
            .map_err(|_| invalid_data("invalid Content-Length value"))?;
        let parsed = text
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid_data("invalid Content-Length value"))?;
        if let Some(previous) = value {
            if previous != parsed {
                return Err(invalid_data("conflicting Content-Length values"));
            }
        }
        value = Some(parsed);
    }
    Ok(value)
}

pub(crate) fn has_header_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

pub(crate) fn is_connection_close(version: HttpVersion, headers: &HeaderMap) -> bool {
    if has_header_token(headers, "connection", "close") {
        return true;
    }
    version == HttpVersion::Http10 && !has_header_token(headers, "connection", "keep-alive")
}

/// Split a CONNECT authority (`host:port`, IPv6 hosts bracketed) into host
/// and port; the port defaults to 443.
pub(crate) fn parse_connect_target(target: &str) -> io::Result<(String, u16)> {
    if target.is_empty() {
        return Err(invalid_data("CONNECT target is empty"));
    }

    if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| invalid_data("unterminated IPv6 CONNECT target"))?;
        let port = match rest.strip_prefix(':') {
            Some(port_text) => parse_port(port_text)?,
            None if rest.is_empty() => 443,
            None => return Err(invalid_data("malformed CONNECT target")),
        };
        return Ok((host.to_string(), port));
    }

    match target.rsplit_once(':') {
        Some((host, port_text)) if !host.is_empty() => Ok((host.to_string(), parse_port(port_text)?)),
        _ => Ok((target.to_string(), 443)),
    }
}

fn parse_port(text: &str) -> io::Result<u16> {
    text.parse::<u16>()
        .map_err(|_| invalid_data("invalid CONNECT port"))
}

pub(crate) fn serialize_request_head(method: &str, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(method.as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    serialize_headers(&mut head, headers);
    head.extend_from_slice(b"\r\n");
    head
}

pub(crate) fn serialize_response_head(status: u16, reason: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(status.to_string().as_bytes());
    if !reason.is_empty() {
        head.push(b' ');
        head.extend_from_slice(reason.as_bytes());
    }
    head.extend_from_slice(b"\r\n");
    serialize_headers(&mut head, headers);
    head.extend_from_slice(b"\r\n");
    head
}

fn serialize_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

fn invalid_data(detail: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail)
}
