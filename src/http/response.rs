//! Response head and body framing
//!
//! [`Response`] is the part the application sees: status and headers, mutable
//! until the head goes out. [`ResponseWriter`] decides the body framing at
//! that moment and serializes everything into the connection output buffer.

use crate::{
    errors::UsageError,
    http::types::{contains_token, is_token, slice_to_u64, Method, StatusCode, Version},
    limits::{HeaderEncoding, RespLimits},
};
use bytes::BytesMut;

// Headers computed by the writer; application values only fill their slot.
const MANAGED: [&str; 5] = [
    "content-length",
    "transfer-encoding",
    "connection",
    "date",
    "server",
];

/// Status and headers of the response to the current request.
///
/// Reached through [`HttpContext::response_mut`](crate::HttpContext::response_mut).
/// Everything is mutable until the first body byte or an explicit flush
/// sends the head; later changes fail with [`UsageError::HeadersReadOnly`].
///
/// `Content-Length`, `Transfer-Encoding`, `Connection`, `Date` and `Server`
/// are written by the server. Setting one of them replaces the computed value
/// (and for the first two, chooses the body framing).
///
/// # Examples
/// ```
/// use maker_h1::{Response, StatusCode, UsageError};
///
/// fn not_found(resp: &mut Response) -> Result<(), UsageError> {
///     resp.set_status(StatusCode::NotFound)?
///         .header("content-type", "text/plain")?
///         .header("cache-control", "no-store")?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    state: ResponseState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    Open,
    Started,
    Upgraded,
}

impl Response {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Vec::new(),
            state: ResponseState::Open,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.status = StatusCode::Ok;
        self.headers.clear();
        self.state = ResponseState::Open;
    }

    #[inline]
    pub(crate) fn mark_upgraded(&mut self) {
        self.state = ResponseState::Upgraded;
    }

    #[inline]
    pub(crate) fn is_upgraded(&self) -> bool {
        self.state == ResponseState::Upgraded
    }

    #[inline]
    fn check_open(&self) -> Result<(), UsageError> {
        match self.state {
            ResponseState::Open => Ok(()),
            ResponseState::Started => Err(UsageError::HeadersReadOnly),
            ResponseState::Upgraded => Err(UsageError::ResponseAfterUpgrade),
        }
    }
}

impl Response {
    #[inline]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the status code. Defaults to `200 OK`.
    pub fn set_status(&mut self, status: StatusCode) -> Result<&mut Self, UsageError> {
        self.check_open()?;
        self.status = status;
        Ok(self)
    }

    /// Appends a header, keeping the ones already set under the same name.
    ///
    /// # Errors
    /// - [`UsageError::HeadersReadOnly`] once the head was sent
    /// - [`UsageError::InvalidHeaderName`] if `name` is not a token
    /// - [`UsageError::InvalidHeaderValue`] if `value` contains CR, LF or NUL
    pub fn header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, UsageError> {
        self.check_open()?;

        let (name, value) = (name.into(), value.into());
        validate(&name, &value)?;

        self.headers.push((name, value));
        Ok(self)
    }

    /// Replaces every header named `name` with a single value.
    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, UsageError> {
        self.check_open()?;

        let (name, value) = (name.into(), value.into());
        validate(&name, &value)?;

        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value));
        Ok(self)
    }

    pub fn remove_header(&mut self, name: &str) -> Result<&mut Self, UsageError> {
        self.check_open()?;
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        Ok(self)
    }

    /// First value set for `name`, case-insensitive.
    #[inline]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Headers in insertion order.
    #[inline]
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Whether the head has been sent.
    #[inline]
    pub fn has_started(&self) -> bool {
        self.state != ResponseState::Open
    }
}

#[inline]
fn validate(name: &str, value: &str) -> Result<(), UsageError> {
    if !is_token(name.as_bytes()) {
        return Err(UsageError::InvalidHeaderName);
    }

    if value.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0)) {
        return Err(UsageError::InvalidHeaderValue);
    }

    Ok(())
}

//

/// Body framing chosen when the head is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutFraming {
    Length(u64),
    Chunked,
    /// No length known on HTTP/1.0: the body ends with the connection.
    UntilClose,
    /// 1xx, 204 and 304.
    NoBody,
    /// Response to HEAD; body bytes are counted and dropped.
    Discard,
}

/// Serializes one response into the connection output buffer.
#[derive(Debug)]
pub(crate) struct ResponseWriter {
    version: Version,
    is_head: bool,
    keep_alive: bool,
    framing: Option<OutFraming>,
    written: u64,
    finished: bool,
}

impl ResponseWriter {
    #[inline]
    pub(crate) fn new(version: Version, method: &Method, keep_alive: bool) -> Self {
        Self {
            version,
            is_head: *method == Method::Head,
            keep_alive,
            framing: None,
            written: 0,
            finished: false,
        }
    }

    /// Closes the connection after this response. No effect once the head is out.
    #[inline]
    pub(crate) fn disable_keep_alive(&mut self) {
        if self.framing.is_none() {
            self.keep_alive = false;
        }
    }

    #[inline]
    pub(crate) const fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub(crate) const fn has_started(&self) -> bool {
        self.framing.is_some()
    }

    /// Writes the head now, framing the body as unknown length.
    #[inline]
    pub(crate) fn start(
        &mut self,
        resp: &mut Response,
        out: &mut BytesMut,
        date: &[u8],
        limits: &RespLimits,
    ) -> Result<(), UsageError> {
        if resp.is_upgraded() {
            return Err(UsageError::ResponseAfterUpgrade);
        }

        if self.framing.is_none() {
            self.write_head(resp, out, date, limits, false)?;
        }

        Ok(())
    }

    /// Appends body bytes, writing the head first if needed.
    pub(crate) fn write(
        &mut self,
        resp: &mut Response,
        out: &mut BytesMut,
        data: &[u8],
        date: &[u8],
        limits: &RespLimits,
    ) -> Result<(), UsageError> {
        if resp.is_upgraded() {
            return Err(UsageError::ResponseAfterUpgrade);
        }

        if !data.is_empty() && !resp.status.allows_body() {
            return Err(UsageError::BodyNotAllowed(resp.status.as_u16()));
        }

        let framing = match self.framing {
            Some(framing) => framing,
            None => self.write_head(resp, out, date, limits, false)?,
        };

        if data.is_empty() {
            return Ok(());
        }

        let total = self.written + data.len() as u64;

        match framing {
            OutFraming::Length(expected) if total > expected => {
                return Err(UsageError::ContentLengthExceeded {
                    written: total,
                    expected,
                })
            }
            OutFraming::Length(_) | OutFraming::UntilClose => out.extend_from_slice(data),
            OutFraming::Chunked => {
                put_hex(out, data.len());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            OutFraming::Discard | OutFraming::NoBody => {}
        }

        self.written = total;
        Ok(())
    }

    /// Completes the response: writes the head if nothing was sent and the
    /// chunked terminator if the body was chunked.
    ///
    /// A declared `Content-Length` that was not reached fails with
    /// [`UsageError::ContentLengthShort`]. If the head was not written yet,
    /// the output is left untouched so a `500` can replace the response.
    pub(crate) fn finish(
        &mut self,
        resp: &mut Response,
        out: &mut BytesMut,
        date: &[u8],
        limits: &RespLimits,
    ) -> Result<(), UsageError> {
        if self.finished || resp.is_upgraded() {
            return Ok(());
        }

        let framing = match self.framing {
            Some(framing) => framing,
            None => {
                if resp.status.allows_body() && !self.is_head {
                    if let Some(expected) = declared_length(resp)?.filter(|&len| len > 0) {
                        return Err(UsageError::ContentLengthShort {
                            written: 0,
                            expected,
                        });
                    }
                }

                self.write_head(resp, out, date, limits, true)?
            }
        };

        self.finished = true;

        match framing {
            OutFraming::Chunked => out.extend_from_slice(b"0\r\n\r\n"),
            OutFraming::Length(expected) if self.written < expected => {
                return Err(UsageError::ContentLengthShort {
                    written: self.written,
                    expected,
                })
            }
            _ => {}
        }

        Ok(())
    }

    /// Error response sent for a rejected request, followed by a close.
    ///
    /// Same layout as any other response: `Content-Length: 0`,
    /// `Connection: close`, `Date`, `Server`, then `Allow` for a `405`.
    pub(crate) fn write_rejection(
        out: &mut BytesMut,
        status: StatusCode,
        allow: Option<&Method>,
        date: &[u8],
        limits: &RespLimits,
    ) {
        let mut resp = Response::new();
        resp.status = status;

        if let Some(method) = allow {
            resp.headers.push(("Allow".into(), method.as_str().into()));
        }

        let mut writer = Self::new(Version::Http11, &Method::Get, false);

        // Infallible here: managed values only, no declared length.
        if writer.finish(&mut resp, out, date, limits).is_err() {
            tracing::trace!(status = status.as_u16(), "rejection response not written");
        }
    }
}

// Write head
impl ResponseWriter {
    fn write_head(
        &mut self,
        resp: &mut Response,
        out: &mut BytesMut,
        date: &[u8],
        limits: &RespLimits,
        complete: bool,
    ) -> Result<OutFraming, UsageError> {
        let encoding = |name: &str| {
            limits
                .header_encoding
                .as_ref()
                .map_or(HeaderEncoding::Ascii, |selector| selector.select(name))
        };

        for (name, value) in &resp.headers {
            check_encoding(value, encoding(name))?;
        }

        let declared = declared_length(resp)?;
        let coding = resp.get_header("transfer-encoding");
        let connection = resp.get_header("connection");

        if connection.map_or(false, |v| contains_token(v.as_bytes(), b"close")) {
            self.keep_alive = false;
        }

        out.extend_from_slice(resp.status.status_line());

        let framing = if !resp.status.allows_body() {
            OutFraming::NoBody
        } else if self.is_head {
            put_content_length(out, declared.unwrap_or(0));
            OutFraming::Discard
        } else if let Some(coding) = coding {
            put_header(out, "Transfer-Encoding", coding.as_bytes());

            let last = coding.rsplit(',').map(str::trim).find(|c| !c.is_empty());
            match last {
                Some(c) if c.eq_ignore_ascii_case("chunked") => OutFraming::Chunked,
                _ => {
                    self.keep_alive = false;
                    OutFraming::UntilClose
                }
            }
        } else if let Some(length) = declared {
            put_content_length(out, length);
            OutFraming::Length(length)
        } else if complete {
            put_content_length(out, 0);
            OutFraming::Length(0)
        } else if self.version == Version::Http11 {
            put_header(out, "Transfer-Encoding", b"chunked");
            OutFraming::Chunked
        } else {
            self.keep_alive = false;
            OutFraming::UntilClose
        };

        let connection = if resp.status == StatusCode::SwitchingProtocols {
            Some(connection.unwrap_or("Upgrade"))
        } else if !self.keep_alive {
            Some("close")
        } else if self.version == Version::Http10 {
            Some("keep-alive")
        } else {
            connection
        };

        if let Some(value) = connection {
            put_value_header(out, "Connection", value, encoding("Connection"));
        }

        match resp.get_header("date") {
            Some(value) => put_value_header(out, "Date", value, encoding("Date")),
            None => put_header(out, "Date", date),
        }

        if let Some(value) = resp.get_header("server").or(limits.server_header.as_deref()) {
            put_value_header(out, "Server", value, encoding("Server"));
        }

        for (name, value) in &resp.headers {
            if !MANAGED.iter().any(|m| m.eq_ignore_ascii_case(name)) {
                put_value_header(out, name, value, encoding(name));
            }
        }

        out.extend_from_slice(b"\r\n");

        resp.state = ResponseState::Started;
        self.framing = Some(framing);
        Ok(framing)
    }
}

#[inline]
fn declared_length(resp: &Response) -> Result<Option<u64>, UsageError> {
    if resp.get_header("transfer-encoding").is_some() {
        return Ok(None);
    }

    resp.get_header("content-length")
        .map(|v| slice_to_u64(v.trim().as_bytes()).ok_or(UsageError::InvalidHeaderValue))
        .transpose()
}

fn check_encoding(value: &str, encoding: HeaderEncoding) -> Result<(), UsageError> {
    let invalid = value.chars().find(|&c| {
        let allowed = match encoding {
            HeaderEncoding::Ascii => c == '\t' || (' '..='~').contains(&c),
            HeaderEncoding::Latin1 => c == '\t' || (!c.is_control() && c as u32 <= 0xFF),
            HeaderEncoding::Utf8 => c == '\t' || !c.is_control(),
        };
        !allowed
    });

    match invalid {
        Some(c) => Err(UsageError::InvalidHeaderEncoding(c as u32)),
        None => Ok(()),
    }
}

#[inline]
fn put_header(out: &mut BytesMut, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

#[inline]
fn put_value_header(out: &mut BytesMut, name: &str, value: &str, encoding: HeaderEncoding) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");

    match encoding {
        HeaderEncoding::Latin1 => out.extend(value.chars().map(|c| c as u8)),
        HeaderEncoding::Ascii | HeaderEncoding::Utf8 => out.extend_from_slice(value.as_bytes()),
    }

    out.extend_from_slice(b"\r\n");
}

#[inline]
fn put_content_length(out: &mut BytesMut, length: u64) {
    let (arr, start) = number_to_bytes(length);
    put_header(out, "Content-Length", &arr[start..]);
}

#[inline]
const fn number_to_bytes(mut n: u64) -> ([u8; 20], usize) {
    let mut buffer = [b'0'; 20];
    let mut i = 20;

    if n == 0 {
        return (buffer, 19);
    }

    while n > 0 {
        i -= 1;
        buffer[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }

    (buffer, i)
}

#[inline]
fn put_hex(out: &mut BytesMut, mut n: usize) {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let mut buffer = [0u8; 16];
    let mut i = buffer.len();

    loop {
        i -= 1;
        buffer[i] = HEX[n & 0xF];
        n >>= 4;

        if n == 0 {
            break;
        }
    }

    out.extend_from_slice(&buffer[i..]);
}
