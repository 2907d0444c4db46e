use crate::http::types::{Method, StatusCode};
use std::{borrow::Cow, fmt, io};

/// Error type returned by [`Handler`](crate::Handler) implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const MAX_ESCAPED_LEN: usize = 128;

macro_rules! rejection_reasons {
    ($(
        $(#[$docs:meta])*
        $name:ident => $status:ident, $end:ident, $message:literal;
    )+) => {
        /// Why a request was rejected before or while its body was read.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum RejectionReason { $(
            $(#[$docs])*
            $name,
        )+ }

        impl RejectionReason {
            /// Status code sent back to the client.
            #[inline]
            pub const fn status(self) -> StatusCode {
                match self { $( Self::$name => StatusCode::$status, )+ }
            }

            /// Terminal reason recorded for the connection.
            #[inline]
            pub const fn end_reason(self) -> EndReason {
                match self { $( Self::$name => EndReason::$end, )+ }
            }

            #[inline]
            const fn default_message(self) -> &'static str {
                match self { $( Self::$name => $message, )+ }
            }
        }
    };
}

rejection_reasons! {
    /// The request line is not `METHOD SP TARGET SP VERSION`.
    InvalidRequestLine => BadRequest, InvalidRequestLine, "Invalid request line.";
    /// The request line did not fit in `max_request_line_size`.
    RequestLineTooLong => UriTooLong, InvalidRequestLine, "Request line too long.";
    /// The target contains forbidden bytes or has the wrong form.
    InvalidRequestTarget => BadRequest, InvalidRequestTarget, "Invalid request target.";
    /// `*` or authority-form target used with the wrong method.
    MethodNotAllowed => MethodNotAllowed, InvalidRequestLine, "Method not allowed.";
    /// Version other than `HTTP/1.0` or `HTTP/1.1`.
    UnrecognizedVersion => HttpVersionNotSupported, InvalidHttpVersion, "Unrecognized HTTP version.";
    /// Header name is empty or not a token.
    InvalidHeaderName => BadRequest, InvalidRequestHeaders, "Invalid request header name.";
    /// Header value contains NUL, control or non-ASCII bytes.
    InvalidHeaderValue => BadRequest, InvalidRequestHeaders, "Invalid request header value.";
    /// Structural problem in the header section (no colon, folding, bare CR).
    MalformedHeaders => BadRequest, InvalidRequestHeaders, "Malformed request: invalid headers.";
    /// More headers than `max_request_header_count`.
    TooManyHeaders => RequestHeaderFieldsTooLarge, InvalidRequestHeaders, "Request contains too many headers.";
    /// Header section larger than `max_request_headers_total_size`.
    HeadersTooLarge => RequestHeaderFieldsTooLarge, InvalidRequestHeaders, "Request headers too long.";
    /// HTTP/1.1 request without `Host`.
    MissingHostHeader => BadRequest, InvalidRequestHeaders, "Host header missing.";
    /// More than one `Host` header.
    DuplicateHostHeader => BadRequest, InvalidRequestHeaders, "Multiple Host headers.";
    /// `Host` is malformed or does not match an absolute-form target.
    InvalidHostHeader => BadRequest, InvalidRequestHeaders, "Invalid Host header.";
    /// HTTP/1.1 POST or PUT without any length information.
    LengthRequired => LengthRequired, InvalidRequestHeaders, "Length required.";
    /// HTTP/1.0 POST or PUT without `Content-Length`.
    LengthRequiredHttp10 => BadRequest, InvalidRequestHeaders, "Content-Length required for HTTP/1.0 POST/PUT.";
    /// `Content-Length` is not a non-negative integer.
    InvalidContentLength => BadRequest, InvalidRequestHeaders, "Invalid content length.";
    /// Several `Content-Length` headers.
    MultipleContentLengths => BadRequest, InvalidRequestHeaders, "Multiple Content-Length headers.";
    /// `Transfer-Encoding` does not end with `chunked`.
    FinalTransferCodingNotChunked => BadRequest, InvalidRequestHeaders, "The final transfer coding is not 'chunked'.";
    /// Upgrade request that also declares a body.
    UpgradeRequestCannotHavePayload => BadRequest, InvalidRequestHeaders,
        "Requests with 'Connection: Upgrade' cannot have content in the request body.";
    /// Chunk size line is not hexadecimal.
    BadChunkSize => BadRequest, InvalidBodyFraming, "Bad chunk size data.";
    /// Chunk data not followed by CRLF.
    BadChunkSuffix => BadRequest, InvalidBodyFraming, "Bad chunk suffix.";
    /// Chunk extension not terminated by CRLF.
    BadChunkExtension => BadRequest, InvalidBodyFraming, "Bad chunk extension.";
    /// Peer closed the stream before the body was complete.
    UnexpectedEndOfRequestContent => BadRequest, UnexpectedEndOfRequestContent, "Unexpected end of request content.";
    /// Body larger than the effective maximum.
    RequestBodyTooLarge => PayloadTooLarge, MaxRequestBodySizeExceeded, "Request body too large.";
    /// Request head not received within `request_headers_timeout`.
    RequestHeadersTimeout => RequestTimeout, RequestHeadersTimeout, "Reading the request headers timed out.";
    /// Body bytes arrived slower than the minimum data rate.
    RequestBodyTimeout => RequestTimeout, MinRequestBodyDataRate,
        "Reading the request body timed out due to data arriving too slowly.";
}

/// Protocol or resource-limit failure of a single request.
///
/// Produced by the head parser and the body reader. The connection turns it
/// into an error response followed by `Connection: close`; the message itself
/// is only logged and handed to the [`ConnectionObserver`](crate::ConnectionObserver).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BadRequest {
    reason: RejectionReason,
    message: Cow<'static, str>,
    allow: Option<Method>,
}

impl BadRequest {
    #[inline]
    pub(crate) fn new(reason: RejectionReason) -> Self {
        Self {
            reason,
            message: Cow::Borrowed(reason.default_message()),
            allow: None,
        }
    }

    #[inline]
    fn with_message(reason: RejectionReason, message: String) -> Self {
        Self {
            reason,
            message: Cow::Owned(message),
            allow: None,
        }
    }

    pub(crate) fn invalid_request_line(line: &[u8]) -> Self {
        let detail = escape(line);
        Self::with_message(
            RejectionReason::InvalidRequestLine,
            format!("Invalid request line: '{detail}'"),
        )
    }

    pub(crate) fn invalid_target(target: &[u8]) -> Self {
        let detail = escape(target);
        Self::with_message(
            RejectionReason::InvalidRequestTarget,
            format!("Invalid request target: '{detail}'"),
        )
    }

    pub(crate) fn unrecognized_version(version: &[u8]) -> Self {
        let detail = escape(version);
        Self::with_message(
            RejectionReason::UnrecognizedVersion,
            format!("Unrecognized HTTP version: '{detail}'"),
        )
    }

    pub(crate) fn invalid_header(reason: RejectionReason, line: &[u8]) -> Self {
        let detail = escape(line);
        Self::with_message(reason, format!("Invalid request header: '{detail}'"))
    }

    #[inline]
    pub(crate) const fn malformed_header(message: &'static str) -> Self {
        Self {
            reason: RejectionReason::MalformedHeaders,
            message: Cow::Borrowed(message),
            allow: None,
        }
    }

    pub(crate) fn invalid_host(value: &[u8]) -> Self {
        let detail = escape(value);
        Self::with_message(
            RejectionReason::InvalidHostHeader,
            format!("Invalid Host header: '{detail}'"),
        )
    }

    pub(crate) fn method_not_allowed(allow: Method) -> Self {
        Self {
            allow: Some(allow),
            ..Self::new(RejectionReason::MethodNotAllowed)
        }
    }

    pub(crate) fn length_required(method: &Method) -> Self {
        Self::with_message(
            RejectionReason::LengthRequired,
            format!("{method} request contains no Content-Length or Transfer-Encoding header."),
        )
    }

    pub(crate) fn invalid_content_length(value: &[u8]) -> Self {
        let detail = escape(value);
        Self::with_message(
            RejectionReason::InvalidContentLength,
            format!("Invalid content length: {detail}"),
        )
    }

    pub(crate) fn final_coding_not_chunked(value: &[u8]) -> Self {
        let detail = escape(value);
        Self::with_message(
            RejectionReason::FinalTransferCodingNotChunked,
            format!(
                "The message body length cannot be determined because the final transfer \
                 coding was set to '{detail}' instead of 'chunked'."
            ),
        )
    }

    pub(crate) fn body_too_large(max: u64) -> Self {
        Self::with_message(
            RejectionReason::RequestBodyTooLarge,
            format!("Request body too large. The max request body size is {max} bytes."),
        )
    }

    /// Kind of the failure.
    #[inline]
    pub const fn reason(&self) -> RejectionReason {
        self.reason
    }

    /// Status code of the error response.
    #[inline]
    pub const fn status(&self) -> StatusCode {
        self.reason.status()
    }

    /// Human-readable detail.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Method named by the `Allow` header of a `405` response.
    #[inline]
    pub const fn allow(&self) -> Option<&Method> {
        self.allow.as_ref()
    }
}

/// Invalid operation attempted by application code.
///
/// Returned synchronously; the connection itself is unaffected unless stated
/// otherwise on the variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum UsageError {
    #[error(
        "The maximum request body size cannot be modified after the app has already \
         started reading from the request body."
    )]
    BodySizeReadOnly,
    #[error("The maximum request body size cannot be modified after the request has been upgraded.")]
    BodySizeAfterUpgrade,
    #[error("Headers are read-only, response has already started.")]
    HeadersReadOnly,
    #[error("Invalid characters in header name.")]
    InvalidHeaderName,
    #[error("Header values must not contain CR, LF or NUL.")]
    InvalidHeaderValue,
    #[error("Invalid non-ASCII or control character in header: 0x{0:04X}")]
    InvalidHeaderEncoding(u32),
    #[error("Writing to the response body is invalid for responses with status code {0}.")]
    BodyNotAllowed(u16),
    /// The connection is aborted when this is returned.
    #[error("Response Content-Length mismatch: too many bytes written ({written} of {expected}).")]
    ContentLengthExceeded { written: u64, expected: u64 },
    #[error("Response Content-Length mismatch: too few bytes written ({written} of {expected}).")]
    ContentLengthShort { written: u64, expected: u64 },
    #[error("The request cannot be upgraded.")]
    NotUpgradable,
    #[error("Upgrade can only be called once per request.")]
    AlreadyUpgraded,
    #[error("Upgrade rejected: the maximum number of upgraded connections has been reached.")]
    UpgradeQuotaExceeded,
    #[error("The response cannot be written after the connection has been upgraded.")]
    ResponseAfterUpgrade,
}

/// Error observed by application code while reading or writing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    BadRequest(#[from] BadRequest),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error("connection aborted: {0}")]
    Aborted(EndReason),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Terminal reason of a connection, reported exactly once when it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EndReason {
    /// Peer closed cleanly, or keep-alive was not requested.
    Completed,
    ConnectionReset,
    InvalidRequestLine,
    InvalidRequestHeaders,
    InvalidHttpVersion,
    InvalidRequestTarget,
    InvalidBodyFraming,
    UnexpectedEndOfRequestContent,
    /// Rejected at accept time; no bytes were written.
    MaxConcurrentConnectionsExceeded,
    MaxRequestBodySizeExceeded,
    RequestHeadersTimeout,
    KeepAliveTimeout,
    MinRequestBodyDataRate,
    MinResponseDataRate,
    GracefulShutdown,
    /// Still open when the shutdown drain timeout elapsed.
    ShutdownTimeout,
    UnhandledApplicationError,
    ResponseContentLengthMismatch,
    AbortedByApp,
    OtherError,
}

impl EndReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ConnectionReset => "connection_reset",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::InvalidRequestHeaders => "invalid_request_headers",
            Self::InvalidHttpVersion => "invalid_http_version",
            Self::InvalidRequestTarget => "invalid_request_target",
            Self::InvalidBodyFraming => "invalid_body_framing",
            Self::UnexpectedEndOfRequestContent => "unexpected_end_of_request_content",
            Self::MaxConcurrentConnectionsExceeded => "max_concurrent_connections_exceeded",
            Self::MaxRequestBodySizeExceeded => "max_request_body_size_exceeded",
            Self::RequestHeadersTimeout => "request_headers_timeout",
            Self::KeepAliveTimeout => "keep_alive_timeout",
            Self::MinRequestBodyDataRate => "min_request_body_data_rate",
            Self::MinResponseDataRate => "min_response_data_rate",
            Self::GracefulShutdown => "graceful_shutdown",
            Self::ShutdownTimeout => "shutdown_timeout",
            Self::UnhandledApplicationError => "unhandled_application_error",
            Self::ResponseContentLengthMismatch => "response_content_length_mismatch",
            Self::AbortedByApp => "aborted_by_app",
            Self::OtherError => "other_error",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Printable ASCII is kept, everything else becomes `\xNN`.
pub(crate) fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().min(MAX_ESCAPED_LEN));

    for &byte in bytes {
        if out.len() >= MAX_ESCAPED_LEN {
            out.push_str("...");
            break;
        }

        match byte {
            0x20..=0x7E => out.push(byte as char),
            _ => out.push_str(&format!("\\x{byte:02X}")),
        }
    }

    out
}

pub(crate) const LINE_FOLDING: &str = "Header value line folding not supported.";
pub(crate) const WHITESPACE_IN_NAME: &str = "Whitespace is not allowed in header name.";
pub(crate) const MISSING_COLON: &str = "No ':' character found in header line.";
