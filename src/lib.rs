//! maker_h1 - HTTP/1.x connection engine with heartbeat-driven timeouts
//!
//! The per-connection state machine of an HTTP/1.0 and HTTP/1.1 server:
//! incremental request parsing with limits enforced as bytes arrive, streamed
//! request and response bodies, keep-alive, protocol upgrades and graceful
//! shutdown. Every timeout is enforced by a periodic [`Heartbeat`] against a
//! pluggable [`SystemClock`], so behavior under time pressure can be tested
//! without waiting.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, chunked request and response
//!   bodies with trailers, pipelined requests answered in order, upgrades
//! - **HTTP/1.0**: `Connection: keep-alive`, bodies framed by
//!   `Content-Length` or by the end of the connection
//! - **HTTP/2**: clients opening with the HTTP/2 preface get a `GOAWAY`
//!   asking for HTTP/1.1
//!
//! # Connection lifecycle
//!
//! - Accepted streams count against a connection quota; a stream over the
//!   quota is closed without a byte written.
//! - Idle connections close silently after the keep-alive timeout. Once the
//!   first byte of a request arrives, the whole head must arrive within the
//!   request headers timeout or the client gets a `408`.
//! - Protocol errors are answered with an empty-bodied error response and
//!   `Connection: close`.
//! - A handler error or panic becomes a `500` if the response has not started,
//!   an abort otherwise.
//! - Upgraded connections move to their own quota and are exempt from the
//!   keep-alive timeout.
//! - On shutdown idle connections close at once, active ones finish their
//!   response, stragglers are aborted after the shutdown timeout.
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use maker_h1::{BoxError, Handler, HttpContext, Server};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
//!         ctx.response_mut().header("content-type", "text/plain")?;
//!         ctx.write(b"Hello World!").await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await
//!         .unwrap();
//! }
//! ```
//! Upgrading to a raw stream:
//! ```no_run
//! use maker_h1::{BoxError, Handler, HttpContext, StatusCode};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! struct EchoUpgrade;
//!
//! impl Handler for EchoUpgrade {
//!     async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
//!         if !ctx.is_upgradable() {
//!             ctx.response_mut().set_status(StatusCode::BadRequest)?;
//!             return Ok(());
//!         }
//!
//!         let mut stream = ctx.upgrade().await?;
//!         let mut buf = [0; 1024];
//!         loop {
//!             match stream.read(&mut buf).await? {
//!                 0 => return Ok(()),
//!                 n => stream.write_all(&buf[..n]).await?,
//!             }
//!         }
//!     }
//! }
//! ```
//! Advanced configuration:
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
//!             max_upgraded_connections: Some(500),
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             keep_alive_timeout: Duration::from_secs(15),
//!             request_headers_timeout: Duration::from_secs(10),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             max_request_header_count: 32,
//!             max_request_body_size: Some(16 * 1024),
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await
//!         .unwrap();
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod body;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod target;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod counter;
    pub(crate) mod heartbeat;
    pub(crate) mod manager;
    pub(crate) mod server_impl;
    pub(crate) mod timeout;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{BadRequest, BoxError, EndReason, Error, RejectionReason, UsageError},
    http::{
        request::RequestHead,
        response::Response,
        types::{Header, Method, StatusCode, Version},
    },
    server::{
        connection::{HttpContext, Upgraded},
        counter::{CounterEvents, ResourceCounter, ResourceSlot},
        heartbeat::{Heartbeat, HeartbeatHandler, HeartbeatTask, ManualClock, SystemClock, TokioClock},
        manager::{ConnectionId, ConnectionManager},
        server_impl::{ConnectionObserver, Handler, Server, ServerBuilder},
    },
};

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        struct $name;

        impl $crate::Handler for $name {
            async fn handle(
                &self,
                ctx: &mut $crate::HttpContext<'_>,
            ) -> ::std::result::Result<(), $crate::BoxError> {
                ctx.write(b"Hello world!").await?;
                Ok(())
            }
        }
    };
}
