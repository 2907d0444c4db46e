use crate::{
    errors::{self, BadRequest, RejectionReason},
    http::{
        target::{self, Target, TargetForm},
        types::{contains_token, is_token, trim_ows, Header, Method, Version},
    },
    limits::ReqLimits,
};
use bytes::{Buf, Bytes, BytesMut};
use memchr::memchr;
use std::{mem, ops::Range};

/// Parsed request line and header section.
///
/// Produced once per request by the connection and handed to the handler
/// through [`HttpContext::request`](crate::HttpContext::request). Header
/// names and values point into the bytes received from the peer.
///
/// # Examples
///
/// For the head:
/// ```text
/// GET /api/users/../items?sort=name&debug HTTP/1.1\r
/// Host: localhost\r
/// Accept: */*\r
/// \r
/// ```
/// - [`method`](Self::method): `Method::Get`
/// - [`raw_target`](Self::raw_target): `b"/api/users/../items?sort=name&debug"`
/// - [`path`](Self::path): `"/api/items"`
/// - [`query`](Self::query): `"?sort=name&debug"`
/// - [`header_str("accept")`](Self::header_str): `Some("*/*")`
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    method: Method,
    raw_target: Bytes,
    path: String,
    query: String,
    version: Version,
    pub(crate) target_form: TargetForm,

    pub(crate) headers: Vec<Header>,
    keep_alive: bool,
    upgradable: bool,
}

// Public API
impl RequestHead {
    #[inline(always)]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Target exactly as it appeared in the request line.
    #[inline(always)]
    pub fn raw_target(&self) -> &[u8] {
        &self.raw_target
    }

    /// Percent-decoded path with `.` and `..` segments removed.
    ///
    /// `%2F` is kept encoded. Empty for `*` and authority-form targets.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string including the leading `?`, or an empty string.
    #[inline(always)]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Iterates the `key=value` pairs of the query. A key without `=` yields
    /// an empty value.
    pub fn query_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.query
            .strip_prefix('?')
            .unwrap_or_default()
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// All headers in the order they were received.
    #[inline(always)]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Returns the first header value with case-insensitive name matching.
    /// Uses linear search.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
            .map(|h| h.value.as_ref())
    }

    /// Same as [`header`](Self::header), `None` if the value is not UTF-8.
    #[inline]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        simdutf8::basic::from_utf8(self.header(name)?).ok()
    }

    /// Every value of the header `name`, in order.
    #[inline]
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name.as_bytes()))
            .map(|h| h.value.as_ref())
    }

    /// Whether the peer asked to keep the connection open after this exchange.
    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Whether the request carries `Connection: upgrade` and may be upgraded.
    #[inline(always)]
    pub const fn is_upgradable(&self) -> bool {
        self.upgradable
    }
}

impl RequestHead {
    #[inline]
    pub(crate) fn remove_header(&mut self, name: &str) {
        self.headers
            .retain(|h| !h.name.eq_ignore_ascii_case(name.as_bytes()));
    }

    #[inline]
    pub(crate) fn has_token(&self, name: &str, token: &str) -> bool {
        self.header_all(name)
            .any(|value| contains_token(value, token.as_bytes()))
    }
}

//

/// Outcome of feeding bytes to [`HeadParser::parse`].
#[derive(Debug)]
pub(crate) enum Parsed {
    /// The head is not complete yet.
    Partial,
    Head(RequestHead),
    /// `PRI * HTTP/2.0`, the client speaks HTTP/2 with prior knowledge.
    Http2Preface,
}

#[derive(Debug)]
struct RequestLine {
    method: Method,
    target_range: Range<usize>,
    target: Target,
    version: Version,
}

enum LineOutcome {
    Partial,
    Done,
    Http2Preface,
}

#[derive(Debug)]
enum State {
    RequestLine { scanned: usize },
    Headers(RequestLine),
}

/// Incremental request head parser.
///
/// Bytes stay in the connection buffer until the head is complete; the
/// parser only remembers how far it has scanned and where the fields are.
/// Every limit is checked against the bytes seen so far.
#[derive(Debug)]
pub(crate) struct HeadParser {
    state: State,
    line_start: usize,
    section: HeaderSection,
    fields: Vec<(Range<usize>, Range<usize>)>,
}

impl HeadParser {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            state: State::RequestLine { scanned: 0 },
            line_start: 0,
            section: HeaderSection::default(),
            fields: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.state = State::RequestLine { scanned: 0 };
        self.line_start = 0;
        self.section = HeaderSection::default();
        self.fields.clear();
    }

    /// Consumes the head from `buf` once it is complete. Body bytes that
    /// follow it are left in place.
    pub(crate) fn parse(
        &mut self,
        buf: &mut BytesMut,
        limits: &ReqLimits,
    ) -> Result<Parsed, BadRequest> {
        if let State::RequestLine { scanned } = self.state {
            match self.parse_request_line(buf, scanned, limits)? {
                LineOutcome::Partial => return Ok(Parsed::Partial),
                LineOutcome::Http2Preface => return Ok(Parsed::Http2Preface),
                LineOutcome::Done => {}
            }
        }

        loop {
            let start = self.line_start;
            let Some(len) = self.section.next_line(&buf[start..], limits)? else {
                return Ok(Parsed::Partial);
            };

            let line = strip_terminator(&buf[start..start + len])
                .ok_or(BadRequest::new(RejectionReason::MalformedHeaders))?;

            if line.is_empty() {
                return self.finish(buf, start + len, limits).map(Parsed::Head);
            }

            self.section.count_field(limits)?;

            let (name, value) = parse_field(line, limits.allow_non_ascii_header_values)?;
            self.fields.push((shift(name, start), shift(value, start)));
            self.line_start = start + len;
        }
    }
}

// Parse first line
impl HeadParser {
    fn parse_request_line(
        &mut self,
        buf: &mut BytesMut,
        mut scanned: usize,
        limits: &ReqLimits,
    ) -> Result<LineOutcome, BadRequest> {
        if skip_blank_lines(buf) {
            scanned = 0;
        }

        let max = limits.max_request_line_size;
        let end = match memchr(b'\n', &buf[scanned..]) {
            Some(pos) => scanned + pos + 1,
            None => {
                if buf.len() >= max {
                    return Err(BadRequest::new(RejectionReason::RequestLineTooLong));
                }

                self.state = State::RequestLine { scanned: buf.len() };
                return Ok(LineOutcome::Partial);
            }
        };

        if end > max {
            return Err(BadRequest::new(RejectionReason::RequestLineTooLong));
        }

        let raw_line = &buf[..end];
        let invalid = || BadRequest::invalid_request_line(raw_line);
        let line = strip_terminator(raw_line).ok_or_else(invalid)?;

        let mut parts = line.splitn(3, |&b| b == b' ');
        let (Some(method), Some(raw_target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        if !is_token(method) || raw_target.is_empty() || version.contains(&b' ') {
            return Err(invalid());
        }

        if method == b"PRI" && raw_target == b"*" && version == b"HTTP/2.0" {
            return Ok(LineOutcome::Http2Preface);
        }

        let version = match Version::from_bytes(version) {
            Some(version) => version,
            None if version.is_empty() => return Err(invalid()),
            None => return Err(BadRequest::unrecognized_version(version)),
        };

        let method = Method::from_token(method);
        let target = target::parse(&method, raw_target, limits.allow_latin1_request_target)?;

        let target_start = method.as_str().len() + 1;
        self.state = State::Headers(RequestLine {
            method,
            target_range: target_start..target_start + raw_target.len(),
            target,
            version,
        });
        self.line_start = end;

        Ok(LineOutcome::Done)
    }
}

// Finish the head
impl HeadParser {
    fn finish(
        &mut self,
        buf: &mut BytesMut,
        end: usize,
        limits: &ReqLimits,
    ) -> Result<RequestHead, BadRequest> {
        let state = mem::replace(&mut self.state, State::RequestLine { scanned: 0 });
        let State::Headers(line) = state else {
            return Err(BadRequest::new(RejectionReason::MalformedHeaders));
        };

        let bytes = buf.split_to(end).freeze();
        let headers = self
            .fields
            .drain(..)
            .map(|(name, value)| Header::new(bytes.slice(name), bytes.slice(value)))
            .collect();
        self.reset();

        let mut head = RequestHead {
            method: line.method,
            raw_target: bytes.slice(line.target_range),
            path: line.target.path.clone(),
            query: line.target.query.clone(),
            version: line.version,
            target_form: line.target.form,

            headers,
            keep_alive: false,
            upgradable: false,
        };

        head.check_host(&line.target, limits)?;

        head.keep_alive = match head.version {
            Version::Http11 => !head.has_token("connection", "close"),
            Version::Http10 => head.has_token("connection", "keep-alive"),
        };
        head.upgradable = head.has_token("connection", "upgrade")
            && (head.version == Version::Http11 || limits.allow_http10_upgrade);

        Ok(head)
    }
}

impl RequestHead {
    fn check_host(&mut self, target: &Target, limits: &ReqLimits) -> Result<(), BadRequest> {
        let mut hosts = self
            .headers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.name.eq_ignore_ascii_case(b"host"))
            .map(|(i, _)| i);
        let first = hosts.next();

        if hosts.next().is_some() {
            return Err(BadRequest::new(RejectionReason::DuplicateHostHeader));
        }

        if let (true, Some(authority)) = (
            limits.allow_host_header_override && target.form == TargetForm::Absolute,
            &target.authority,
        ) {
            let host = target::strip_default_port(authority, target.default_port);
            let value = Bytes::copy_from_slice(host.as_bytes());

            match first {
                Some(i) => self.headers[i].value = value,
                None => self
                    .headers
                    .push(Header::new(Bytes::from_static(b"Host"), value)),
            }

            return Ok(());
        }

        let Some(i) = first else {
            return match self.version {
                Version::Http11 => Err(BadRequest::new(RejectionReason::MissingHostHeader)),
                Version::Http10 => Ok(()),
            };
        };

        let host = &self.headers[i].value;
        if !target::is_valid_host(host) {
            return Err(BadRequest::invalid_host(host));
        }

        let matches = match (target.form, &target.authority) {
            (TargetForm::Authority, Some(authority)) => {
                host.eq_ignore_ascii_case(authority.as_bytes())
            }
            (TargetForm::Absolute, Some(authority)) => {
                target::host_matches(host, authority, target.default_port)
            }
            _ => true,
        };

        if !matches {
            return Err(BadRequest::invalid_host(host));
        }

        Ok(())
    }
}

// Header lines

/// Size and count accounting of a header section or trailer block.
#[derive(Debug, Default)]
pub(crate) struct HeaderSection {
    count: usize,
    total: usize,
    scanned: usize,
}

impl HeaderSection {
    /// Length of the next complete line of `buf`, terminator included.
    ///
    /// Fails as soon as the bytes seen exceed the total size limit, even if
    /// the line is not complete yet.
    pub(crate) fn next_line(
        &mut self,
        buf: &[u8],
        limits: &ReqLimits,
    ) -> Result<Option<usize>, BadRequest> {
        let max = limits.max_request_headers_total_size;

        let Some(pos) = memchr(b'\n', &buf[self.scanned..]) else {
            if self.total + buf.len() > max {
                return Err(BadRequest::new(RejectionReason::HeadersTooLarge));
            }

            self.scanned = buf.len();
            return Ok(None);
        };

        let len = self.scanned + pos + 1;
        self.scanned = 0;
        self.total += len;

        if self.total > max {
            return Err(BadRequest::new(RejectionReason::HeadersTooLarge));
        }

        Ok(Some(len))
    }

    #[inline]
    pub(crate) fn count_field(&mut self, limits: &ReqLimits) -> Result<(), BadRequest> {
        self.count += 1;

        if self.count > limits.max_request_header_count {
            return Err(BadRequest::new(RejectionReason::TooManyHeaders));
        }

        Ok(())
    }
}

/// Splits `name: value` and validates both parts. Ranges are relative to `line`.
pub(crate) fn parse_field(
    line: &[u8],
    allow_non_ascii: bool,
) -> Result<(Range<usize>, Range<usize>), BadRequest> {
    if let [b' ' | b'\t', ..] = line {
        return Err(BadRequest::malformed_header(errors::LINE_FOLDING));
    }

    let Some(colon) = memchr(b':', line) else {
        return Err(BadRequest::malformed_header(errors::MISSING_COLON));
    };

    let name = &line[..colon];
    if name.iter().any(|&b| b == b' ' || b == b'\t') {
        return Err(BadRequest::malformed_header(errors::WHITESPACE_IN_NAME));
    }

    if !is_token(name) {
        return Err(BadRequest::invalid_header(
            RejectionReason::InvalidHeaderName,
            line,
        ));
    }

    let raw_value = &line[colon + 1..];
    let value = trim_ows(raw_value);
    let value_start = colon + 1 + (raw_value.len() - trim_ows_start(raw_value).len());

    let valid = value.iter().all(|&b| match b {
        b'\t' | 0x20..=0x7E => true,
        0x80..=0xFF => allow_non_ascii,
        _ => false,
    });

    if !valid {
        return Err(BadRequest::invalid_header(
            RejectionReason::InvalidHeaderValue,
            line,
        ));
    }

    Ok((0..colon, value_start..value_start + value.len()))
}

#[inline]
fn trim_ows_start(mut src: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = src {
        src = rest;
    }
    src
}

/// Removes `\n` or `\r\n`. A `\r` anywhere else makes the line invalid.
#[inline]
pub(crate) fn strip_terminator(line: &[u8]) -> Option<&[u8]> {
    let line = line.strip_suffix(b"\n")?;
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    match memchr(b'\r', line) {
        Some(_) => None,
        None => Some(line),
    }
}

// Empty lines between requests are not an error.
#[inline]
fn skip_blank_lines(buf: &mut BytesMut) -> bool {
    let mut skipped = false;

    loop {
        match &buf[..] {
            [b'\n', ..] => buf.advance(1),
            [b'\r', b'\n', ..] => buf.advance(2),
            _ => return skipped,
        }

        skipped = true;
    }
}

#[inline(always)]
fn shift(range: Range<usize>, by: usize) -> Range<usize> {
    range.start + by..range.end + by
}
