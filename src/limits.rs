//! Server configuration: limits, timeouts and data rates
//!
//! # Defaults
//!
//! The defaults mirror what a general purpose HTTP/1.x server ships with:
//! generous enough for browsers and API clients, strict enough to stop
//! slowloris-style clients and header flooding.
//!
//! Every timeout is enforced by the [`Heartbeat`](crate::Heartbeat), so the
//! effective deadline is the configured value plus at most one
//! [`heartbeat_interval`](ServerLimits::heartbeat_interval).
//!
//! # Examples
//!
//! ```no_run
//! # maker_h1::impt_default_handler!{MyHandler}
//! use maker_h1::{Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .server_limits(ServerLimits {
//!             max_connections: Some(5000),
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             keep_alive_timeout: Duration::from_secs(15),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             max_request_header_count: 32,
//!             max_request_body_size: Some(1024 * 1024),
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await
//!         .unwrap();
//! }
//! ```

use std::{fmt, sync::Arc, time::Duration};

/// Process-wide limits shared by every connection of a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrently open connections (default: `None`, unbounded)
    ///
    /// A connection accepted above the quota is closed immediately, without a
    /// single byte written.
    pub max_connections: Option<u64>,

    /// Maximum number of concurrently upgraded connections (default: `None`, unbounded)
    ///
    /// Upgraded connections give their normal slot back and take one from this
    /// quota instead. When it is exhausted [`HttpContext::upgrade`](crate::HttpContext::upgrade)
    /// fails and the request continues as plain HTTP.
    pub max_upgraded_connections: Option<u64>,

    /// Interval between two timeout sweeps (default: `1 second`)
    pub heartbeat_interval: Duration,

    /// How long [`Server::shutdown`](crate::Server::shutdown) waits for open
    /// connections before aborting them (default: `30 seconds`)
    pub shutdown_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: None,
            max_upgraded_connections: None,
            heartbeat_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),

            _priv: (),
        }
    }
}

/// Connection-level timeouts
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Idle time allowed between two requests (default: `130 seconds`)
    ///
    /// Measured from the end of the previous response to the first byte of the
    /// next request. An idle connection is closed silently, no `408` is sent.
    /// Upgraded connections are never subject to it.
    pub keep_alive_timeout: Duration,

    /// Time allowed to receive a complete request head (default: `30 seconds`)
    ///
    /// Starts with the first byte of the request. Receiving more bytes does
    /// not extend it; only the complete head does. Expiry answers `408`.
    pub request_headers_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(130),
            request_headers_timeout: Duration::from_secs(30),

            _priv: (),
        }
    }
}

/// Request parsing limits
///
/// If you see these answers for legitimate traffic, one of the limits below is
/// too tight:
/// - `413 Payload Too Large`: [`max_request_body_size`](Self::max_request_body_size)
/// - `414 URI Too Long`: [`max_request_line_size`](Self::max_request_line_size)
/// - `431 Request Header Fields Too Large`: [`max_request_header_count`](Self::max_request_header_count)
///   or [`max_request_headers_total_size`](Self::max_request_headers_total_size)
///
/// All limits are checked while bytes arrive, so an oversized head is rejected
/// without being buffered first.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of the request line, terminator included (default: `8 KB`)
    pub max_request_line_size: usize,
    /// Maximum size of the header section, terminators and the final empty
    /// line included (default: `32 KB`)
    ///
    /// Also bounds chunked trailers.
    pub max_request_headers_total_size: usize,
    /// Maximum number of header lines (default: `100`)
    ///
    /// Also bounds chunked trailers.
    pub max_request_header_count: usize,

    /// Maximum request body size in bytes (default: `Some(30_000_000)`)
    ///
    /// For chunked bodies the chunk framing counts too, trailers do not.
    /// `None` disables the limit. A handler can override it per request before
    /// the first body read, see [`HttpContext::set_max_request_body_size`](crate::HttpContext::set_max_request_body_size).
    pub max_request_body_size: Option<u64>,
    /// Minimum rate at which the body must arrive (default: `240 B/s` after `5 seconds`)
    pub min_request_body_data_rate: Option<MinDataRate>,

    /// Accept request targets that decode to Latin-1 (default: `false`)
    pub allow_latin1_request_target: bool,
    /// Replace `Host` with the authority of an absolute-form target instead of
    /// requiring them to match (default: `false`)
    pub allow_host_header_override: bool,
    /// Accept bytes `0x80..=0xFF` in header values (default: `false`)
    pub allow_non_ascii_header_values: bool,
    /// Let HTTP/1.0 requests upgrade (default: `false`)
    pub allow_http10_upgrade: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_request_line_size: 8 * 1024,
            max_request_headers_total_size: 32 * 1024,
            max_request_header_count: 100,

            max_request_body_size: Some(30_000_000),
            min_request_body_data_rate: Some(MinDataRate::default()),

            allow_latin1_request_target: false,
            allow_host_header_override: false,
            allow_non_ascii_header_values: false,
            allow_http10_upgrade: false,

            _priv: (),
        }
    }
}

/// Response writing limits
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial capacity of the output buffer (default: `1024 B`)
    pub default_capacity: usize,
    /// Buffered output size that triggers a flush (default: `64 KB`)
    pub max_buffered: usize,

    /// Minimum rate at which the peer must consume output (default: `240 B/s` after `5 seconds`)
    ///
    /// Unlike the request rate, a violation aborts the connection.
    pub min_response_data_rate: Option<MinDataRate>,

    /// Allowed encoding of response header values (default: `None`, ASCII only)
    pub header_encoding: Option<HeaderEncodingSelector>,

    /// Value of the `Server` header (default: `None`, not sent)
    pub server_header: Option<String>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_buffered: 64 * 1024,
            min_response_data_rate: Some(MinDataRate::default()),
            header_encoding: None,
            server_header: None,

            _priv: (),
        }
    }
}

/// Minimum throughput, enforced once the grace period has elapsed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinDataRate {
    /// Expected throughput.
    pub bytes_per_second: f64,
    /// Time before the rate starts being checked.
    pub grace_period: Duration,
}

impl MinDataRate {
    /// # Panics
    /// In debug builds, if `bytes_per_second` is not positive.
    #[inline]
    pub fn new(bytes_per_second: f64, grace_period: Duration) -> Self {
        debug_assert!(bytes_per_second > 0.0, "data rate must be positive");

        Self {
            bytes_per_second,
            grace_period,
        }
    }
}

impl Default for MinDataRate {
    #[inline]
    fn default() -> Self {
        Self::new(240.0, Duration::from_secs(5))
    }
}

/// Character set accepted in a response header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEncoding {
    /// Visible ASCII, space and horizontal tab.
    Ascii,
    /// Characters up to `U+00FF`, written as single bytes.
    Latin1,
    /// Any character except controls, written as UTF-8.
    Utf8,
}

/// Picks the [`HeaderEncoding`] of a response header by its name.
///
/// # Examples
/// ```
/// use maker_h1::limits::{HeaderEncoding, HeaderEncodingSelector};
///
/// let selector = HeaderEncodingSelector::new(|name| {
///     if name.eq_ignore_ascii_case("content-disposition") {
///         HeaderEncoding::Utf8
///     } else {
///         HeaderEncoding::Ascii
///     }
/// });
/// assert_eq!(selector.select("Content-Disposition"), HeaderEncoding::Utf8);
/// ```
#[derive(Clone)]
pub struct HeaderEncodingSelector(Arc<dyn Fn(&str) -> HeaderEncoding + Send + Sync>);

impl HeaderEncodingSelector {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> HeaderEncoding + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    #[inline]
    pub fn select(&self, name: &str) -> HeaderEncoding {
        (self.0)(name)
    }
}

impl fmt::Debug for HeaderEncodingSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HeaderEncodingSelector(..)")
    }
}
