use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeadError {
    #[error("head bytes were not valid UTF-8")]
    InvalidUtf8,
    #[error("request line is missing")]
    MissingRequestLine,
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed status line")]
    MalformedStatusLine,
    #[error("invalid status code")]
    InvalidStatusCode,
    #[error("only HTTP/1.0 and HTTP/1.1 are supported")]
    UnsupportedVersion,
    #[error("malformed header line")]
    MalformedHeader,
    #[error("invalid Content-Length value")]
    InvalidContentLength,
    #[error("invalid CONNECT authority")]
    InvalidAuthority,
    #[error("invalid CONNECT port")]
    InvalidPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    fn parse(text: &str) -> Result<Self, HeadError> {
        match text {
            "HTTP/1.0" => Ok(Self::Http10),
            "HTTP/1.1" => Ok(Self::Http11),
            _ => Err(HeadError::UnsupportedVersion),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header list that keeps the exact on-wire name casing.
///
/// Lookups are case-insensitive; mutation keeps the casing the caller
/// supplies, so a rewritten entry can carry either canonical or original
/// spelling depending on who wrote it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    entries: Vec<Header>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    /// Replaces every entry for `name` with a single one, spelled as given.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries
            .retain(|header| !header.name.eq_ignore_ascii_case(&name));
        self.entries.push(Header {
            name,
            value: value.into(),
        });
    }

    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|header| !header.name.eq_ignore_ascii_case(name));
    }

    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.values(name)
            .flat_map(|value| value.split(','))
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrites every name to its canonical MIME spelling, the way a
    /// canonicalising parser would have stored it.
    pub fn canonicalize(&mut self) {
        for header in &mut self.entries {
            header.name = canonical_header_name(&header.name);
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for header in &self.entries {
            map.entry(header.name.clone())
                .or_default()
                .push(header.value.clone());
        }
        map
    }
}

/// Canonical MIME casing: `x-weird-header` becomes `X-Weird-Header`.
/// Names containing non-token bytes are returned unchanged.
pub fn canonical_header_name(name: &str) -> String {
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return name.to_string();
    }

    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for byte in name.bytes() {
        let ch = if upper_next {
            byte.to_ascii_uppercase()
        } else {
            byte.to_ascii_lowercase()
        };
        upper_next = byte == b'-';
        out.push(ch as char);
    }
    out
}

fn is_token_byte(byte: u8) -> bool {
    matches!(byte,
        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9'
        | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: HeaderBlock,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

impl RequestHead {
    pub fn host(&self) -> Option<&str> {
        self.headers.get("Host")
    }

    pub fn is_absolute_target(&self) -> bool {
        split_absolute_url(&self.target).is_some()
    }

    /// Rewrites an origin-form target to absolute form against the tunnel
    /// authority; absolute targets are left alone.
    pub fn make_absolute(&mut self, scheme: &str, authority: &str) {
        if self.is_absolute_target() {
            return;
        }
        self.target = format!("{scheme}://{authority}{}", self.target);
    }

    pub fn path(&self) -> &str {
        match split_absolute_url(&self.target) {
            Some((_, _, path)) => path,
            None => &self.target,
        }
    }

    /// Authority the request addresses: from an absolute target when
    /// present, from the Host header otherwise.
    pub fn authority(&self) -> Option<&str> {
        match split_absolute_url(&self.target) {
            Some((_, authority, _)) => Some(authority),
            None => self.host(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason: String,
    pub headers: HeaderBlock,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

impl ResponseHead {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            version: HttpVersion::Http11,
            status_code,
            reason: reason.into(),
            headers: HeaderBlock::new(),
            body_mode: BodyMode::None,
            connection_close: false,
        }
    }

    pub fn status_line(&self) -> String {
        if self.reason.is_empty() {
            format!("{} {}", self.version.as_str(), self.status_code)
        } else {
            format!("{} {} {}", self.version.as_str(), self.status_code, self.reason)
        }
    }
}

pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead, HeadError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(HeadError::MissingRequestLine)?;
    if request_line.is_empty() {
        return Err(HeadError::MissingRequestLine);
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(HeadError::MalformedRequestLine)?;
    let target = parts.next().ok_or(HeadError::MalformedRequestLine)?;
    let version_text = parts.next().ok_or(HeadError::MalformedRequestLine)?;
    if parts.next().is_some() {
        return Err(HeadError::MalformedRequestLine);
    }
    let version = HttpVersion::parse(version_text)?;

    let headers = parse_header_lines(lines)?;
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

pub fn parse_response_head(raw: &[u8], request_method: &str) -> Result<ResponseHead, HeadError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or(HeadError::MalformedStatusLine)?;

    let mut parts = status_line.split_whitespace();
    let version_text = parts.next().ok_or(HeadError::MalformedStatusLine)?;
    let status_text = parts.next().ok_or(HeadError::MalformedStatusLine)?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let version = HttpVersion::parse(version_text)?;
    let status_code = status_text
        .parse::<u16>()
        .map_err(|_| HeadError::InvalidStatusCode)?;

    let headers = parse_header_lines(lines)?;
    let mut connection_close = is_connection_close(version, &headers);
    let body_mode = response_body_mode(&headers, request_method, status_code)?;
    if body_mode == BodyMode::CloseDelimited {
        connection_close = true;
    }

    Ok(ResponseHead {
        version,
        status_code,
        reason,
        headers,
        body_mode,
        connection_close,
    })
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<HeaderBlock, HeadError> {
    let mut headers = HeaderBlock::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(HeadError::MalformedHeader)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HeadError::MalformedHeader);
        }
        headers.push(name, value.trim());
    }
    Ok(headers)
}

fn request_body_mode(headers: &HeaderBlock) -> Result<BodyMode, HeadError> {
    if headers.has_token("Transfer-Encoding", "chunked") {
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
    headers: &HeaderBlock,
    request_method: &str,
    status_code: u16,
) -> Result<BodyMode, HeadError> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304
    {
        return Ok(BodyMode::None);
    }

    if headers.has_token("Transfer-Encoding", "chunked") {
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

fn content_length(headers: &HeaderBlock) -> Result<Option<u64>, HeadError> {
    let mut value = None;
    for candidate in headers.values("Content-Length") {
        let parsed = candidate
            .parse::<u64>()
            .map_err(|_| HeadError::InvalidContentLength)?;
        value = Some(parsed);
    }
    Ok(value)
}

fn is_connection_close(version: HttpVersion, headers: &HeaderBlock) -> bool {
    if headers.has_token("Connection", "close") {
        return true;
    }
    version == HttpVersion::Http10 && !headers.has_token("Connection", "keep-alive")
}

pub fn is_websocket_handshake(headers: &HeaderBlock) -> bool {
    headers.has_token("Connection", "Upgrade") && headers.has_token("Upgrade", "websocket")
}

pub fn encode_request_head(head: &RequestHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!("{} {} {}\r\n", head.method, head.target, head.version.as_str()).as_bytes(),
    );
    encode_headers(&head.headers, &mut out);
    out
}

pub fn encode_response_head(head: &ResponseHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(head.status_line().as_bytes());
    out.extend_from_slice(b"\r\n");
    encode_headers(&head.headers, &mut out);
    out
}

fn encode_headers(headers: &HeaderBlock, out: &mut Vec<u8>) {
    for header in headers.iter() {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: Option<u16>,
}

impl ConnectTarget {
    pub fn authority_or(&self, default_port: u16) -> String {
        let port = self.port.unwrap_or(default_port);
        if self.host.contains(':') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }
}

/// Splits a CONNECT authority into host and optional port. IPv6 hosts use
/// the bracketed form.
pub fn parse_connect_authority(authority: &str) -> Result<ConnectTarget, HeadError> {
    if authority.is_empty() {
        return Err(HeadError::InvalidAuthority);
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let bracket_close = rest.find(']').ok_or(HeadError::InvalidAuthority)?;
        let host = &rest[..bracket_close];
        if host.is_empty() {
            return Err(HeadError::InvalidAuthority);
        }
        let suffix = &rest[bracket_close + 1..];
        let port = match suffix.strip_prefix(':') {
            None if suffix.is_empty() => None,
            None => return Err(HeadError::InvalidAuthority),
            Some(port_text) => {
                Some(port_text.parse::<u16>().map_err(|_| HeadError::InvalidPort)?)
            }
        };
        return Ok(ConnectTarget {
            host: host.to_string(),
            port,
        });
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(HeadError::InvalidAuthority);
            }
            let port = port_text.parse::<u16>().map_err(|_| HeadError::InvalidPort)?;
            Ok(ConnectTarget {
                host: host.to_string(),
                port: Some(port),
            })
        }
        Some(_) => Err(HeadError::InvalidAuthority),
        None => Ok(ConnectTarget {
            host: authority.to_string(),
            port: None,
        }),
    }
}

pub fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            return &rest[..close];
        }
    }
    match authority.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => authority,
    }
}

/// Splits `scheme://authority/path` into its parts. Returns `None` for
/// origin-form targets.
pub fn split_absolute_url(url: &str) -> Option<(&str, &str, &str)> {
    let scheme_end = url.find("://")?;
    let scheme = &url[..scheme_end];
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
        return None;
    }
    let rest = &url[scheme_end + 3..];
    match rest.find('/') {
        Some(path_start) => Some((scheme, &rest[..path_start], &rest[path_start..])),
        None => Some((scheme, rest, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        canonical_header_name, encode_response_head, is_websocket_handshake,
        parse_connect_authority, parse_request_head, parse_response_head, split_absolute_url,
        strip_port, BodyMode, HeadError, HeaderBlock, HttpVersion,
    };

    #[test]
    fn parses_request_head_with_original_casing() {
        let head = parse_request_head(
            b"GET /q HTTP/1.1\r\nHost: a.example\r\nX-weird: 1\r\n\r\n",
        )
        .expect("must parse");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/q");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.headers.get("x-weird"), Some("1"));
        assert!(head
            .headers
            .iter()
            .any(|header| header.name == "X-weird"));
        assert_eq!(head.body_mode, BodyMode::None);
        assert!(!head.connection_close);
    }

    #[test]
    fn rejects_request_line_with_extra_fields() {
        let error =
            parse_request_head(b"GET / HTTP/1.1 extra\r\n\r\n").expect_err("must fail");
        assert_eq!(error, HeadError::MalformedRequestLine);
    }

    #[test]
    fn chunked_transfer_encoding_wins_over_content_length() {
        let head = parse_request_head(
            b"POST / HTTP/1.1\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .expect("must parse");
        assert_eq!(head.body_mode, BodyMode::Chunked);
    }

    #[test]
    fn head_response_has_no_body_regardless_of_content_length() {
        let head = parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n",
            "HEAD",
        )
        .expect("must parse");
        assert_eq!(head.body_mode, BodyMode::None);
    }

    #[test]
    fn response_without_length_is_close_delimited() {
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\n\r\n", "GET").expect("must parse");
        assert_eq!(head.body_mode, BodyMode::CloseDelimited);
        assert!(head.connection_close);
    }

    #[test]
    fn http10_defaults_to_connection_close() {
        let head = parse_response_head(
            b"HTTP/1.0 200 OK\r\nContent-Length: 1\r\n\r\n",
            "GET",
        )
        .expect("must parse");
        assert!(head.connection_close);
    }

    #[test]
    fn canonical_casing_matches_mime_convention() {
        assert_eq!(canonical_header_name("x-weird"), "X-Weird");
        assert_eq!(canonical_header_name("content-TYPE"), "Content-Type");
        assert_eq!(canonical_header_name("ETag"), "Etag");
        assert_eq!(canonical_header_name("bad header"), "bad header");
    }

    #[test]
    fn header_block_set_replaces_all_spellings() {
        let mut headers = HeaderBlock::new();
        headers.push("connection", "keep-alive");
        headers.push("Connection", "keep-alive");
        headers.set("Connection", "close");
        assert_eq!(headers.values("connection").count(), 1);
        assert_eq!(headers.get("Connection"), Some("close"));
    }

    #[test]
    fn websocket_handshake_detection_is_token_wise() {
        let mut headers = HeaderBlock::new();
        headers.push("Connection", "keep-alive, Upgrade");
        headers.push("Upgrade", "WebSocket");
        assert!(is_websocket_handshake(&headers));

        let mut plain = HeaderBlock::new();
        plain.push("Connection", "keep-alive");
        assert!(!is_websocket_handshake(&plain));
    }

    #[test]
    fn connect_authority_forms() {
        let with_port = parse_connect_authority("a.example:443").expect("must parse");
        assert_eq!(with_port.host, "a.example");
        assert_eq!(with_port.port, Some(443));

        let bare = parse_connect_authority("a.example").expect("must parse");
        assert_eq!(bare.port, None);
        assert_eq!(bare.authority_or(80), "a.example:80");

        let ipv6 = parse_connect_authority("[2001:db8::1]:8443").expect("must parse");
        assert_eq!(ipv6.host, "2001:db8::1");
        assert_eq!(ipv6.port, Some(8443));

        let error = parse_connect_authority("2001:db8::1:443").expect_err("must fail");
        assert_eq!(error, HeadError::InvalidAuthority);
    }

    #[test]
    fn strip_port_handles_ipv6_brackets() {
        assert_eq!(strip_port("a.example:443"), "a.example");
        assert_eq!(strip_port("a.example"), "a.example");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
    }

    #[test]
    fn absolute_url_splitting() {
        assert_eq!(
            split_absolute_url("http://a.example/x?y=1"),
            Some(("http", "a.example", "/x?y=1"))
        );
        assert_eq!(
            split_absolute_url("https://a.example"),
            Some(("https", "a.example", ""))
        );
        assert_eq!(split_absolute_url("/x"), None);
    }

    #[test]
    fn encodes_response_head_verbatim() {
        let mut head = super::ResponseHead::new(200, "OK");
        head.headers.push("Content-Length", "5");
        let bytes = encode_response_head(&head);
        assert_eq!(bytes, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");
    }
}
