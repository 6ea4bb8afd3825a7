//! Minimal HTTP/1.x message model used by the relay.
//!
//! Message heads are kept as the raw bytes received. Changes to a request are
//! staged as [`Modification`]s at byte [`Span`]s of the head and applied when the
//! request is written, so the received bytes are never edited in place.

mod reader;

pub use reader::MessageReader;

use crate::error::{Error, Result};
use crate::resolver::{split_host_port, RequestTarget};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Upper bound for a request or response head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Largest request body held in memory before forwarding.
pub const MAX_BUFFERED_BODY: usize = 16 * 1024 * 1024;
const MAX_HEADERS: usize = 128;

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// A byte range of a message head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

type Writer = Box<dyn Fn(&mut BytesMut) + Send + Sync>;

/// Bytes that replace a span of the head when the message is written.
pub struct Modification {
    span: Span,
    writer: Writer,
}

impl Modification {
    pub fn span(&self) -> Span {
        self.span
    }
}

impl std::fmt::Debug for Modification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Modification")
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Request {
    head: Bytes,
    method: String,
    uri: String,
    minor_version: u8,
    headers: Vec<(String, String)>,
    target: RequestTarget,
    proxy_authorization: Span,
    keep_alive: bool,
    framing: BodyFraming,
    body: Bytes,
    modifications: Vec<Modification>,
}

impl Request {
    /// Parse a complete request head (terminating empty line included).
    pub fn parse(head: Bytes) -> Result<Self> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut raw_headers);
        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(Error::MalformedRequest("incomplete request head".into()))
            }
            Err(e) => return Err(Error::MalformedRequest(e.to_string())),
        }

        let method = parsed.method.unwrap_or_default().to_string();
        let uri = parsed.path.unwrap_or_default().to_string();
        let minor_version = parsed.version.unwrap_or(1);
        let headers = collect_headers(parsed.headers);

        let is_connect = method.eq_ignore_ascii_case("CONNECT");
        let target = parse_target(is_connect, &uri, header(&headers, "host"))?;
        let framing = if is_chunked(&headers) {
            BodyFraming::Chunked
        } else {
            match content_length(&headers)? {
                Some(n) if n > 0 => BodyFraming::Length(n),
                _ => BodyFraming::None,
            }
        };
        let keep_alive = keep_alive(minor_version, &headers);
        let proxy_authorization = find_header_line(&head, "proxy-authorization")
            .unwrap_or_else(|| Span::new(end_of_headers(&head), 0));

        Ok(Self {
            head,
            method,
            uri,
            minor_version,
            headers,
            target,
            proxy_authorization,
            keep_alive,
            framing,
            body: Bytes::new(),
            modifications: Vec::new(),
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn minor_version(&self) -> u8 {
        self.minor_version
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn target(&self) -> &RequestTarget {
        &self.target
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    /// The existing `Proxy-Authorization` line, or an empty span at the end of the headers.
    pub fn proxy_authorization_span(&self) -> Span {
        self.proxy_authorization
    }

    pub fn has_proxy_authorization(&self) -> bool {
        !self.proxy_authorization.is_empty()
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn expects_continue(&self) -> bool {
        self.framing != BodyFraming::None
            && self
                .header("expect")
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    }

    pub fn head(&self) -> &Bytes {
        &self.head
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Attach the raw body bytes (chunk framing included) read after the head.
    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// Stage a rewrite of `span`. A later modification of the same span replaces it.
    pub fn add_modification<F>(&mut self, span: Span, writer: F)
    where
        F: Fn(&mut BytesMut) + Send + Sync + 'static,
    {
        debug_assert!(span.end() <= self.head.len());
        self.modifications.retain(|m| m.span != span);
        self.modifications.push(Modification {
            span,
            writer: Box::new(writer),
        });
        self.modifications.sort_by_key(|m| m.span.start);
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    /// The request as it will be sent: head with modifications applied, then body.
    pub fn to_bytes(&self) -> Bytes {
        let mut out =
            BytesMut::with_capacity(self.head.len() + self.body.len() + 128);
        let mut pos = 0;
        for modification in &self.modifications {
            let span = modification.span;
            if span.start < pos {
                // Overlapping spans cannot both apply; keep the first.
                continue;
            }
            out.put_slice(&self.head[pos..span.start]);
            (modification.writer)(&mut out);
            pos = span.end();
        }
        out.put_slice(&self.head[pos..]);
        out.put_slice(&self.body);
        out.freeze()
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&self.to_bytes()).await?;
        out.flush().await
    }
}

#[derive(Debug)]
pub struct Response {
    head: Bytes,
    status: u16,
    minor_version: u8,
    headers: Vec<(String, String)>,
    keep_alive: bool,
    framing: BodyFraming,
}

impl Response {
    /// Parse a complete response head received for a request with `request_method`.
    pub fn parse(head: Bytes, request_method: &str) -> Result<Self> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut raw_headers);
        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(Error::MalformedResponse("incomplete response head".into()))
            }
            Err(e) => return Err(Error::MalformedResponse(e.to_string())),
        }

        let status = parsed.code.unwrap_or_default();
        let minor_version = parsed.version.unwrap_or(1);
        let headers = collect_headers(parsed.headers);

        let bodyless = request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&status)
            || status == 204
            || status == 304
            || (request_method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&status));
        let framing = if bodyless {
            BodyFraming::None
        } else if is_chunked(&headers) {
            BodyFraming::Chunked
        } else {
            let length = content_length(&headers)
                .map_err(|_| Error::MalformedResponse("invalid Content-Length".into()))?;
            match length {
                Some(0) => BodyFraming::None,
                Some(n) => BodyFraming::Length(n),
                None => BodyFraming::UntilClose,
            }
        };
        let keep_alive = framing != BodyFraming::UntilClose && keep_alive(minor_version, &headers);

        Ok(Self {
            head,
            status,
            minor_version,
            headers,
            keep_alive,
            framing,
        })
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn minor_version(&self) -> u8 {
        self.minor_version
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn head(&self) -> &Bytes {
        &self.head
    }

    /// Realm of the `Basic` challenge in `Proxy-Authenticate`, or of the first challenge.
    pub fn proxy_authenticate_realm(&self) -> Option<String> {
        let challenges: Vec<&str> = self
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("proxy-authenticate"))
            .map(|(_, value)| value.as_str())
            .collect();
        challenges
            .iter()
            .find(|c| {
                c.split_whitespace()
                    .next()
                    .is_some_and(|scheme| scheme.eq_ignore_ascii_case("basic"))
            })
            .or_else(|| challenges.first())
            .and_then(|c| parse_realm(c))
    }
}

/// A small `Connection: close` error response.
pub fn error_response(status: u16, message: &str) -> Bytes {
    let reason = match status {
        400 => "Bad Request",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    };
    let body = format!("{status} {reason}: {message}\r\n");
    Bytes::from(format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    ))
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn header_tokens<'a>(headers: &'a [(String, String)], name: &'a str) -> impl Iterator<Item = &'a str> {
    headers
        .iter()
        .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(','))
        .map(str::trim)
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    header_tokens(headers, "transfer-encoding").any(|t| t.eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &[(String, String)]) -> Result<Option<u64>> {
    match header(headers, "content-length") {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| Error::MalformedRequest(format!("invalid Content-Length: {value}"))),
    }
}

fn keep_alive(minor_version: u8, headers: &[(String, String)]) -> bool {
    let tokens = header_tokens(headers, "connection").chain(header_tokens(headers, "proxy-connection"));
    let mut keep = minor_version >= 1;
    for token in tokens {
        if token.eq_ignore_ascii_case("close") {
            return false;
        }
        if token.eq_ignore_ascii_case("keep-alive") {
            keep = true;
        }
    }
    keep
}

fn parse_target(is_connect: bool, uri: &str, host: Option<&str>) -> Result<RequestTarget> {
    let bad = || Error::MalformedRequest(format!("cannot determine target of '{uri}'"));

    if is_connect {
        let (host, port) = split_host_port(uri).ok_or_else(bad)?;
        return Ok(RequestTarget {
            host: host.to_string(),
            port: port.unwrap_or(443),
            uri: None,
        });
    }

    let lower = uri.to_ascii_lowercase();
    let (authority, default_port) = if lower.starts_with("http://") {
        (&uri["http://".len()..], 80)
    } else if lower.starts_with("https://") {
        (&uri["https://".len()..], 443)
    } else {
        (host.ok_or_else(bad)?, 80)
    };
    let authority = authority
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    let (host, port) = split_host_port(authority).ok_or_else(bad)?;

    Ok(RequestTarget {
        host: host.to_string(),
        port: port.unwrap_or(default_port),
        uri: Some(uri.to_string()),
    })
}

/// Span of the first header line named `name` (CRLF included).
fn find_header_line(head: &[u8], name: &str) -> Option<Span> {
    let mut lines = LineSpans::new(head);
    lines.next(); // request or status line
    for span in lines {
        let line = &head[span.start..span.end()];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
        if line.len() > name.len()
            && line[..name.len()].eq_ignore_ascii_case(name.as_bytes())
            && line[name.len()] == b':'
        {
            return Some(span);
        }
    }
    None
}

/// Offset of the empty line that terminates the head.
fn end_of_headers(head: &[u8]) -> usize {
    if head.ends_with(b"\r\n\r\n") {
        head.len() - 2
    } else {
        head.len().saturating_sub(1)
    }
}

struct LineSpans<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> LineSpans<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl Iterator for LineSpans<'_> {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(self.data.len(), |i| start + i + 1);
        self.pos = end;
        Some(Span::new(start, end - start))
    }
}

fn parse_realm(challenge: &str) -> Option<String> {
    let lower = challenge.to_ascii_lowercase();
    let idx = lower.find("realm=")?;
    let value = &challenge[idx + "realm=".len()..];
    if let Some(quoted) = value.strip_prefix('"') {
        let end = quoted.find('"')?;
        Some(quoted[..end].to_string())
    } else {
        Some(
            value
                .split([',', ' '])
                .next()
                .unwrap_or_default()
                .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> Request {
        Request::parse(Bytes::copy_from_slice(raw.as_bytes())).unwrap()
    }

    #[test]
    fn test_parse_absolute_form_request() {
        let req = request("GET http://example.com:8080/index.html HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        assert_eq!(req.method(), "GET");
        assert!(!req.is_connect());
        assert_eq!(req.target().host, "example.com");
        assert_eq!(req.target().port, 8080);
        assert_eq!(
            req.target().uri.as_deref(),
            Some("http://example.com:8080/index.html")
        );
        assert!(req.keep_alive());
        assert_eq!(req.framing(), BodyFraming::None);
    }

    #[test]
    fn test_parse_connect_request() {
        let req = request("CONNECT [::1]:443 HTTP/1.1\r\nHost: [::1]:443\r\n\r\n");
        assert!(req.is_connect());
        assert_eq!(req.target().host, "::1");
        assert_eq!(req.target().port, 443);
        assert_eq!(req.target().uri, None);
    }

    #[test]
    fn test_origin_form_uses_host_header() {
        let req = request("GET /a HTTP/1.0\r\nHost: origin.test\r\n\r\n");
        assert_eq!(req.target().host, "origin.test");
        assert_eq!(req.target().port, 80);
        assert!(!req.keep_alive());

        let missing = Request::parse(Bytes::from_static(b"GET /a HTTP/1.1\r\n\r\n"));
        assert!(matches!(missing, Err(Error::MalformedRequest(_))));
    }

    #[test]
    fn test_proxy_authorization_span() {
        let raw = "GET http://a/ HTTP/1.1\r\nHost: a\r\nProxy-Authorization: Basic old\r\nAccept: */*\r\n\r\n";
        let req = request(raw);
        let span = req.proxy_authorization_span();
        assert!(req.has_proxy_authorization());
        assert_eq!(
            &raw[span.start..span.end()],
            "Proxy-Authorization: Basic old\r\n"
        );

        let raw = "GET http://a/ HTTP/1.1\r\nHost: a\r\n\r\n";
        let req = request(raw);
        let span = req.proxy_authorization_span();
        assert!(!req.has_proxy_authorization());
        assert_eq!(span, Span::new(raw.len() - 2, 0));
    }

    #[test]
    fn test_modification_inserts_and_overwrites() {
        let mut req = request("GET http://a/ HTTP/1.1\r\nHost: a\r\n\r\n");
        let span = req.proxy_authorization_span();
        req.add_modification(span, |out| out.extend_from_slice(b"Proxy-Authorization: Basic one\r\n"));
        req.add_modification(span, |out| out.extend_from_slice(b"Proxy-Authorization: Basic two\r\n"));

        assert_eq!(req.modifications().len(), 1);
        assert_eq!(
            req.to_bytes().as_ref(),
            b"GET http://a/ HTTP/1.1\r\nHost: a\r\nProxy-Authorization: Basic two\r\n\r\n"
        );
        // The received head is untouched.
        assert_eq!(req.head().as_ref(), b"GET http://a/ HTTP/1.1\r\nHost: a\r\n\r\n");
    }

    #[test]
    fn test_empty_modification_removes_header() {
        let mut req = request("GET http://a/ HTTP/1.1\r\nProxy-Authorization: Basic old\r\nHost: a\r\n\r\n");
        let span = req.proxy_authorization_span();
        req.add_modification(span, |_| {});
        assert_eq!(
            req.to_bytes().as_ref(),
            b"GET http://a/ HTTP/1.1\r\nHost: a\r\n\r\n"
        );
    }

    #[test]
    fn test_modification_replaces_existing_header() {
        let mut req = request(
            "POST http://a/ HTTP/1.1\r\nProxy-Authorization: Basic old\r\nContent-Length: 2\r\n\r\n",
        );
        req.set_body(Bytes::from_static(b"hi"));
        let span = req.proxy_authorization_span();
        req.add_modification(span, |out| out.extend_from_slice(b"Proxy-Authorization: Basic new\r\n"));

        assert_eq!(
            req.to_bytes().as_ref(),
            b"POST http://a/ HTTP/1.1\r\nProxy-Authorization: Basic new\r\nContent-Length: 2\r\n\r\nhi"
        );
    }

    #[test]
    fn test_request_framing() {
        let req = request("POST http://a/ HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n");
        assert_eq!(req.framing(), BodyFraming::Length(5));
        assert!(req.expects_continue());

        let req = request("POST http://a/ HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert_eq!(req.framing(), BodyFraming::Chunked);

        let bad = Request::parse(Bytes::from_static(
            b"POST http://a/ HTTP/1.1\r\nContent-Length: x\r\n\r\n",
        ));
        assert!(matches!(bad, Err(Error::MalformedRequest(_))));
    }

    #[test]
    fn test_request_connection_tokens() {
        let req = request("GET http://a/ HTTP/1.1\r\nProxy-Connection: close\r\n\r\n");
        assert!(!req.keep_alive());
        let req = request("GET http://a/ HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(req.keep_alive());
    }

    #[test]
    fn test_response_framing_and_keep_alive() {
        let resp = Response::parse(
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n"),
            "GET",
        )
        .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.framing(), BodyFraming::Length(3));
        assert!(resp.keep_alive());

        let resp =
            Response::parse(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"), "GET").unwrap();
        assert_eq!(resp.framing(), BodyFraming::UntilClose);
        assert!(!resp.keep_alive());

        let resp = Response::parse(
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n"),
            "HEAD",
        )
        .unwrap();
        assert_eq!(resp.framing(), BodyFraming::None);

        let resp = Response::parse(
            Bytes::from_static(b"HTTP/1.1 200 Connection established\r\n\r\n"),
            "CONNECT",
        )
        .unwrap();
        assert_eq!(resp.framing(), BodyFraming::None);
        assert!(resp.keep_alive());

        let resp = Response::parse(
            Bytes::from_static(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n"),
            "GET",
        )
        .unwrap();
        assert!(!resp.keep_alive());
    }

    #[test]
    fn test_proxy_authenticate_realm() {
        let resp = Response::parse(
            Bytes::from_static(
                b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Negotiate\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n",
            ),
            "GET",
        )
        .unwrap();
        assert_eq!(resp.status(), 407);
        assert_eq!(resp.proxy_authenticate_realm().as_deref(), Some("proxy"));

        let resp = Response::parse(
            Bytes::from_static(
                b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: basic realm=corp, charset=\"UTF-8\"\r\n\r\n",
            ),
            "GET",
        )
        .unwrap();
        assert_eq!(resp.proxy_authenticate_realm().as_deref(), Some("corp"));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = error_response(502, "upstream unreachable");
        let text = std::str::from_utf8(&resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("502 Bad Gateway: upstream unreachable\r\n"));
    }
}
