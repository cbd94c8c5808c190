//! HTTP/1.1 request and response model.
//!
//! # Design
//! `Request` is immutable once parsed and is owned by the connection task
//! that read it. `Response` is plain data with public fields so handlers and
//! completion callers can build it directly; the connection task owns the
//! framing (`Content-Length`, `Connection`) when it serializes the response
//! with [`Response::encode`].
//!
//! Parsing is incremental: [`parse_request`] reports `Partial` until a whole
//! request (head plus body) is buffered, so the connection task can keep
//! reading without re-implementing framing rules.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// HTTP method of a request or route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            "OPTIONS" => Ok(Method::Options),
            other => Err(ServerError::MalformedRequest(format!(
                "unsupported method {other:?}"
            ))),
        }
    }
}

/// Protocol version from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// Header list with case-insensitive names.
///
/// Keeps insertion order and the caller's spelling of each name so responses
/// go out exactly as the handler built them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set `name` to `value`, replacing any entry with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a repeated field by folding it into the existing value.
    fn fold(&mut self, name: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(entry) => {
                entry.1.push_str(", ");
                entry.1.push_str(value);
            }
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// An inbound HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: HashMap<String, String>,
    version: Version,
    headers: Headers,
    body: Vec<u8>,
}

impl Request {
    /// Parse a buffer that holds exactly one request.
    ///
    /// Unlike [`parse_request`], a body shorter than the declared length or
    /// trailing bytes after the request are errors.
    pub fn from_bytes(raw: &[u8]) -> ServerResult<Request> {
        match parse_request(raw, usize::MAX)? {
            Parsed::Complete(request, consumed) if consumed == raw.len() => Ok(request),
            Parsed::Complete(_, consumed) => Err(ServerError::MalformedRequest(format!(
                "{} bytes after end of request",
                raw.len() - consumed
            ))),
            Parsed::Partial => Err(ServerError::MalformedRequest(
                "incomplete request or body shorter than declared length".into(),
            )),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Path component of the request target, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the client allows the connection to stay open afterwards.
    pub fn keep_alive(&self) -> bool {
        let connection = self.headers.get("connection").map(str::to_ascii_lowercase);
        let has = |token: &str| {
            connection
                .as_deref()
                .map(|v| v.split(',').any(|t| t.trim() == token))
                .unwrap_or(false)
        };
        match self.version {
            Version::Http11 => !has("close"),
            Version::Http10 => has("keep-alive"),
        }
    }
}

/// Outcome of feeding buffered bytes to [`parse_request`].
#[derive(Debug)]
pub enum Parsed {
    /// A full request and the number of bytes it occupied.
    Complete(Request, usize),
    /// More bytes are needed.
    Partial,
}

/// Parse one request from the front of `buf`.
///
/// `limit` bounds the head, and separately the body as framed on the wire.
pub fn parse_request(buf: &[u8], limit: usize) -> ServerResult<Parsed> {
    let head_end = match find(buf, b"\r\n\r\n") {
        Some(pos) => pos,
        None if buf.len() > limit => return Err(ServerError::RequestTooLarge { limit }),
        None => return Ok(Parsed::Partial),
    };
    if head_end > limit {
        return Err(ServerError::RequestTooLarge { limit });
    }
    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| malformed("request head is not valid UTF-8"))?;
    let mut lines = head.split("\r\n");

    let start_line = lines.next().unwrap_or_default();
    let mut parts = start_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err(malformed(format!("bad request line {start_line:?}"))),
    };
    let method: Method = method.parse()?;
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        other => return Err(malformed(format!("unsupported version {other:?}"))),
    };
    if !target.starts_with('/') {
        return Err(malformed(format!("unsupported request target {target:?}")));
    }
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (target, HashMap::new()),
    };

    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| malformed(format!("header line without colon {line:?}")))?;
        if !is_token(name) {
            return Err(malformed(format!("invalid header name {name:?}")));
        }
        let value = value.trim_matches(|c: char| c == ' ' || c == '\t');
        if value.chars().any(|c| c.is_control() && c != '\t') {
            return Err(malformed(format!("control character in header {name:?}")));
        }
        headers.fold(name, value);
    }

    let body_start = head_end + 4;
    let framed = match (headers.get("transfer-encoding"), headers.get("content-length")) {
        (Some(_), Some(_)) => {
            return Err(malformed("both Content-Length and Transfer-Encoding present"))
        }
        (Some(te), None) => {
            if !te.trim().eq_ignore_ascii_case("chunked") {
                return Err(malformed(format!("unsupported transfer coding {te:?}")));
            }
            let framed = &buf[body_start..];
            match decode_chunked(framed, limit)? {
                Some((_, consumed)) if consumed > limit => {
                    return Err(ServerError::RequestTooLarge { limit })
                }
                None if framed.len() > limit => return Err(ServerError::RequestTooLarge { limit }),
                decoded => decoded,
            }
        }
        (None, Some(len)) => {
            let len: usize = len
                .trim()
                .parse()
                .map_err(|_| malformed(format!("invalid Content-Length {len:?}")))?;
            if len > limit {
                return Err(ServerError::RequestTooLarge { limit });
            }
            if buf.len() - body_start < len {
                None
            } else {
                Some((buf[body_start..body_start + len].to_vec(), len))
            }
        }
        (None, None) => Some((Vec::new(), 0)),
    };

    let Some((body, body_len)) = framed else {
        return Ok(Parsed::Partial);
    };
    let request = Request {
        method,
        path: path.to_string(),
        query,
        version,
        headers,
        body,
    };
    Ok(Parsed::Complete(request, body_start + body_len))
}

/// Decode a chunked body; returns the body and the encoded length consumed.
fn decode_chunked(buf: &[u8], limit: usize) -> ServerResult<Option<(Vec<u8>, usize)>> {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let Some(line_len) = find(&buf[pos..], b"\r\n") else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&buf[pos..pos + line_len])
            .map_err(|_| malformed("chunk size line is not valid UTF-8"))?;
        let size_str = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| malformed(format!("invalid chunk size {size_str:?}")))?;
        pos += line_len + 2;

        if size == 0 {
            // Skip trailer fields up to the terminating empty line.
            loop {
                let Some(trailer_len) = find(&buf[pos..], b"\r\n") else {
                    return Ok(None);
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Ok(Some((body, pos)));
                }
            }
        }

        if size > limit.saturating_sub(body.len()) {
            return Err(ServerError::RequestTooLarge { limit });
        }
        let Some(end) = pos.checked_add(size).and_then(|end| end.checked_add(2)) else {
            return Err(malformed("chunk size too large"));
        };
        if buf.len() < end {
            return Ok(None);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size;
        if &buf[pos..end] != b"\r\n" {
            return Err(malformed("chunk data not followed by CRLF"));
        }
        pos += 2;
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn malformed(msg: impl Into<String>) -> ServerError {
    ServerError::MalformedRequest(msg.into())
}

/// RFC 7230 `token`: the allowed alphabet for methods and header names.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

/// An outgoing HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// A `text/plain` response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into().into_bytes())
    }

    /// A plain-text response whose body is the status' reason phrase.
    pub fn error(status: u16) -> Self {
        Self::text(status, reason_phrase(status))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize to HTTP/1.1 wire bytes.
    ///
    /// Framing headers set by the caller are replaced: the body is always
    /// sent with `Content-Length`, and `Connection: close` is added when
    /// `close` is set.
    pub fn encode(&self, close: bool) -> ServerResult<Vec<u8>> {
        self.encode_framed(close, true)
    }

    /// Like [`Response::encode`] but without the body, for replies to `HEAD`.
    /// `Content-Length` still reports the length of the body.
    pub fn encode_head(&self, close: bool) -> ServerResult<Vec<u8>> {
        self.encode_framed(close, false)
    }

    fn encode_framed(&self, close: bool, with_body: bool) -> ServerResult<Vec<u8>> {
        if !(100..=599).contains(&self.status) {
            return Err(ServerError::InvalidResponse(format!(
                "status {} out of range",
                self.status
            )));
        }
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            if !is_token(name) {
                return Err(ServerError::InvalidResponse(format!(
                    "invalid header name {name:?}"
                )));
            }
            if value.chars().any(|c| c.is_control() && c != '\t') {
                return Err(ServerError::InvalidResponse(format!(
                    "control character in header {name:?}"
                )));
            }
            if is_framing_header(name) {
                continue;
            }
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        if close {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
        if with_body {
            out.extend_from_slice(&self.body);
        }
        Ok(out)
    }
}

fn is_framing_header(name: &str) -> bool {
    ["content-length", "transfer-encoding", "connection"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Canonical reason phrase, empty for codes without one.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Content Too Large",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Content",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
