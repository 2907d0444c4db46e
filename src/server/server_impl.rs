use crate::{
    errors::{BadRequest, BoxError, EndReason},
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    server::{
        connection::{ConnShared, HttpConnection, HttpContext},
        counter::{CounterEvents, ResourceCounter},
        heartbeat::{DateHeader, Heartbeat, HeartbeatHandler, HeartbeatTask, SystemClock, TokioClock},
        manager::{ConnectionId, ConnectionManager},
        timeout::TimeoutControl,
    },
};
use socket2::{SockRef, TcpKeepalive};
use std::{
    future::{self, Future},
    io,
    pin::pin,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::Instrument;

const TCP_KEEPALIVE: Duration = Duration::from_secs(60);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Application code run once per request.
///
/// The handler reads the request through the [`HttpContext`], writes the
/// response through it, and may upgrade the connection. Returning an error
/// or panicking is an unhandled application error: a `500` is sent if the
/// response has not started, the connection is aborted otherwise.
///
/// # Examples
///
/// ```
/// use maker_h1::{BoxError, Handler, HttpContext, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
///         if ctx.request().path() == "/echo" {
///             let mut body = Vec::new();
///             ctx.read_to_end(&mut body).await?;
///             ctx.write(&body).await?;
///         } else {
///             ctx.response_mut().set_status(StatusCode::NotFound)?;
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        ctx: &mut HttpContext<'_>,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Diagnostic hooks of a [`Server`], every method defaults to a no-op.
///
/// Quota events of the connection and upgraded connection counters arrive
/// through the [`CounterEvents`] supertrait.
///
/// # Examples
/// ```
/// use maker_h1::{BadRequest, ConnectionId, ConnectionObserver, CounterEvents, EndReason};
/// use std::{sync::atomic::{AtomicU64, Ordering}, time::Duration};
///
/// #[derive(Default)]
/// struct Stats {
///     rejected: AtomicU64,
/// }
///
/// impl CounterEvents for Stats {}
///
/// impl ConnectionObserver for Stats {
///     fn on_bad_request(&self, _: ConnectionId, _: &BadRequest) {
///         self.rejected.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait ConnectionObserver: CounterEvents {
    /// A request was rejected, called before the error response is sent.
    #[inline(always)]
    fn on_bad_request(&self, id: ConnectionId, err: &BadRequest) {
        let _ = (id, err);
    }

    /// Called exactly once per accepted stream.
    #[inline(always)]
    fn on_connection_closed(&self, id: ConnectionId, duration: Duration, reason: EndReason) {
        let _ = (id, duration, reason);
    }
}

impl ConnectionObserver for () {}

//

/// HTTP/1.x server: accepts connections, runs the heartbeat and drains
/// connections on shutdown.
///
/// # Examples
///
/// ```no_run
/// use maker_h1::{BoxError, Handler, HttpContext, Server};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
///         ctx.write(b"Hello world!").await?;
///         Ok(())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
///         .unwrap();
/// }
/// ```
pub struct Server<H: Handler> {
    listener: Option<TcpListener>,
    handler: Arc<H>,
    clock: Arc<dyn SystemClock>,
    limits: ServerLimits,

    shared: Arc<ConnShared>,
    connections: Arc<ResourceCounter>,
    manager: Arc<ConnectionManager>,
    heartbeat: Arc<Heartbeat>,
}

impl<H: Handler> Server<H> {
    /// Creates a new builder for configuring the server instance.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # maker_h1::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use maker_h1::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    /// # }
    /// ```
    #[inline]
    pub fn builder() -> ServerBuilder<H> {
        ServerBuilder {
            listener: None,
            handler: None,
            observer: Arc::new(()),
            events: Arc::new(()),
            clock: Arc::new(TokioClock),

            server_limits: None,
            connection_limits: None,
            request_limits: None,
            response_limits: None,
        }
    }

    /// Accepts connections until the process ends.
    ///
    /// # Errors
    ///
    /// Fails if no [`listener`](ServerBuilder::listener) was configured.
    #[inline]
    pub async fn launch(self) -> io::Result<()> {
        self.launch_until(future::pending()).await
    }

    /// Accepts connections until `signal` resolves, then shuts down
    /// gracefully within [`shutdown_timeout`](ServerLimits::shutdown_timeout).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # maker_h1::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use maker_h1::Server;
    /// use tokio::net::TcpListener;
    /// use std::time::Duration;
    ///
    /// Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct)
    ///     .build()
    ///     .launch_until(tokio::time::sleep(Duration::from_secs(3600)))
    ///     .await
    ///     .unwrap();
    /// # }
    /// ```
    pub async fn launch_until<F>(mut self, signal: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.listener.take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "The `listener` method must be called to launch",
            )
        })?;

        let _heartbeat = self.start_heartbeat();
        let mut signal = pin!(signal);

        loop {
            tokio::select! {
                biased;
                _ = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = configure_socket(&stream) {
                            tracing::debug!(%peer, error = %err, "socket options not applied");
                        }
                        drop(self.serve(stream));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept a connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        self.shutdown().await;
        Ok(())
    }

    /// Runs one connection over `stream` on a new task and returns its end
    /// reason.
    ///
    /// When the connection quota is exhausted the stream is dropped at once,
    /// without a single byte written.
    pub fn serve<S>(&self, stream: S) -> JoinHandle<EndReason>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.manager.next_id();
        let observer = Arc::clone(&self.shared.observer);

        let Some(slot) = self.connections.try_acquire_slot() else {
            drop(stream);

            let reason = EndReason::MaxConcurrentConnectionsExceeded;
            tracing::debug!(connection_id = %id, end_reason = %reason, "connection refused");
            observer.on_connection_closed(id, Duration::ZERO, reason);

            return tokio::spawn(future::ready(reason));
        };

        let control = Arc::new(TimeoutControl::new(
            Arc::clone(&self.clock),
            self.limits.heartbeat_interval,
        ));
        let registration = self.manager.register(id, Arc::clone(&control));

        let connection = HttpConnection::new(
            id,
            stream,
            Arc::clone(&self.handler),
            Arc::clone(&self.shared),
            control,
            slot,
        );

        let clock = Arc::clone(&self.clock);
        let span = tracing::debug_span!("connection", connection_id = %id);

        tokio::spawn(
            async move {
                let started = clock.now();
                tracing::debug!("connection started");

                let reason = connection.run().await;
                let duration = clock.now().saturating_duration_since(started);

                tracing::debug!(
                    end_reason = %reason,
                    duration_ms = duration.as_millis() as u64,
                    "connection closed"
                );
                observer.on_connection_closed(id, duration, reason);

                drop(registration);
                reason
            }
            .instrument(span),
        )
    }

    /// Stops every connection: idle ones close at once, active ones finish
    /// their current response. Connections still open after
    /// [`shutdown_timeout`](ServerLimits::shutdown_timeout) are aborted.
    ///
    /// Returns `true` if every connection closed in time.
    #[inline]
    pub async fn shutdown(&self) -> bool {
        self.manager.shutdown(self.limits.shutdown_timeout).await
    }

    /// Starts ticking the [`Heartbeat`], needed when connections are fed
    /// through [`serve`](Self::serve) instead of [`launch`](Self::launch).
    #[inline]
    pub fn start_heartbeat(&self) -> HeartbeatTask {
        self.heartbeat.start()
    }

    #[inline]
    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    #[inline]
    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Quota of open, non-upgraded connections.
    #[inline]
    pub fn connections(&self) -> &ResourceCounter {
        &self.connections
    }

    /// Quota of upgraded connections.
    #[inline]
    pub fn upgraded_connections(&self) -> &ResourceCounter {
        &self.shared.upgrades
    }
}

fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))
}

//

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<H: Handler> {
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    observer: Arc<dyn ConnectionObserver>,
    events: Arc<dyn CounterEvents>,
    clock: Arc<dyn SystemClock>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
}

impl<H: Handler> ServerBuilder<H> {
    /// Sets the TCP listener used by [`Server::launch`].
    ///
    /// Not needed when streams are handed to [`Server::serve`] directly.
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs diagnostic hooks, see [`ConnectionObserver`].
    #[inline(always)]
    pub fn observer<O: ConnectionObserver>(self, observer: O) -> Self {
        let observer = Arc::new(observer);
        let events: Arc<dyn CounterEvents> = observer.clone();
        let observer: Arc<dyn ConnectionObserver> = observer;

        Self {
            observer,
            events,
            ..self
        }
    }

    /// Replaces the time source, [`TokioClock`] by default.
    ///
    /// # Examples
    ///
    /// ```
    /// # maker_h1::impt_default_handler!{ MyStruct }
    /// use maker_h1::{ManualClock, Server};
    /// use std::sync::Arc;
    ///
    /// let clock = Arc::new(ManualClock::new());
    /// let server = Server::builder()
    ///     .handler(MyStruct)
    ///     .clock(clock.clone())
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn clock(mut self, clock: Arc<dyn SystemClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Configures quotas, the heartbeat and the shutdown timeout.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # maker_h1::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use maker_h1::{Server, limits::ServerLimits};
    /// use tokio::net::TcpListener;
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .server_limits(ServerLimits {
    ///         // Your changes
    ///         max_connections: Some(1000),
    ///         shutdown_timeout: Duration::from_secs(10),
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures the keep-alive and request headers timeouts.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing and body limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # maker_h1::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use maker_h1::{Server, limits::ReqLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .request_limits(ReqLimits {
    ///         // Your changes
    ///         max_request_line_size: 4096,
    ///         max_request_header_count: 32,
    ///         ..ReqLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response buffering, data rate and header encoding.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Panics with ``The `handler` method must be called to create`` when
    /// no handler was set.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server<H> {
        let handler = self
            .handler
            .expect("The `handler` method must be called to create");
        let limits = self.server_limits.unwrap_or_default();

        let date = Arc::new(DateHeader::new(Arc::clone(&self.clock)));
        let manager = Arc::new(ConnectionManager::new());

        let heartbeat = Arc::new(Heartbeat::new(
            Arc::clone(&self.clock),
            limits.heartbeat_interval,
            vec![
                date.clone() as Arc<dyn HeartbeatHandler>,
                manager.clone() as Arc<dyn HeartbeatHandler>,
            ],
        ));

        let connections = ResourceCounter::new("connections", limits.max_connections)
            .with_events(Arc::clone(&self.events));
        let upgrades = ResourceCounter::new("upgraded_connections", limits.max_upgraded_connections)
            .with_events(self.events);

        let shared = ConnShared {
            conn_limits: self.connection_limits.unwrap_or_default(),
            req_limits: self.request_limits.unwrap_or_default(),
            resp_limits: self.response_limits.unwrap_or_default(),
            date,
            upgrades: Arc::new(upgrades),
            observer: self.observer,
        };

        Server {
            listener: self.listener,
            handler,
            clock: self.clock,
            limits,

            shared: Arc::new(shared),
            connections: Arc::new(connections),
            manager,
            heartbeat,
        }
    }
}

#[cfg(test)]
mod server_self {
    use super::*;
    use crate::tools::{settle, TestServer};
    use std::sync::{Mutex, PoisonError};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        sync::{oneshot, Notify},
    };

    /// Answers `done`, requests to `/slow` wait for the gate first.
    struct Gated(Arc<Notify>);

    impl Gated {
        fn open() -> Self {
            Self(Arc::new(Notify::new()))
        }
    }

    impl Handler for Gated {
        async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
            if ctx.request().path() == "/slow" {
                self.0.notified().await;
            }

            ctx.write(b"done").await?;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn push(&self, event: String) {
            self.0.lock().unwrap_or_else(PoisonError::into_inner).push(event);
        }

        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    impl CounterEvents for Recorder {
        fn on_acquire(&self, counter: &str, acquired: bool) {
            self.push(format!("acquire {counter} {acquired}"));
        }

        fn on_release(&self, counter: &str) {
            self.push(format!("release {counter}"));
        }
    }

    impl ConnectionObserver for Recorder {
        fn on_bad_request(&self, _: ConnectionId, err: &BadRequest) {
            self.push(format!("bad request: {}", err.message()));
        }

        fn on_connection_closed(&self, _: ConnectionId, _: Duration, reason: EndReason) {
            self.push(format!("closed: {reason:?}"));
        }
    }

    #[test]
    #[should_panic(expected = "The `handler` method must be called to create")]
    fn build_requires_handler() {
        let _ = Server::<Gated>::builder().build();
    }

    #[tokio::test]
    async fn launch_requires_listener() {
        let server = Server::builder().handler(Gated::open()).build();
        let err = server.launch().await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn serves_tcp_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        let server = Server::builder()
            .listener(listener)
            .handler(Gated::open())
            .build();
        let running = tokio::spawn(server.launch_until(async move {
            let _ = stopped.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response:?}");
        assert!(response.contains("Connection: close\r\n"), "{response:?}");
        assert!(response.ends_with("\r\n\r\n4\r\ndone\r\n0\r\n\r\n"), "{response:?}");

        stop.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connection_quota() {
        let recorder = Recorder::default();
        let server = TestServer::with(Gated::open(), |builder| {
            builder.observer(recorder.clone()).server_limits(ServerLimits {
                max_connections: Some(1),
                ..ServerLimits::default()
            })
        });

        let mut first = server.connect();
        let mut refused = server.connect();
        assert!(refused.read_to_close().await.is_empty());
        assert_eq!(refused.end_reason().await, EndReason::MaxConcurrentConnectionsExceeded);

        first.send("GET / HTTP/1.1\r\n\r\n").await;
        assert!(!first.read_to_close().await.is_empty());
        assert_eq!(first.end_reason().await, EndReason::InvalidRequestHeaders);
        assert_eq!(server.server.connections().current(), 0);

        let mut third = server.connect();
        third.send("GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert_eq!(third.response().await.body, b"done");
        assert_eq!(third.finish().await, EndReason::Completed);

        #[rustfmt::skip]
        let expected = [
            "acquire connections true",
            "acquire connections false",
            "closed: MaxConcurrentConnectionsExceeded",
            "bad request: Host header missing.",
            "release connections",
            "closed: InvalidRequestHeaders",
            "acquire connections true",
            "release connections",
            "closed: Completed",
        ];
        assert_eq!(recorder.events(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown() {
        let handler = Gated::open();
        let gate = Arc::clone(&handler.0);
        let server = TestServer::new(handler);

        let mut idle = server.connect();
        idle.send("GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert_eq!(idle.response().await.body, b"done");

        let mut active = server.connect();
        active.send("GET /slow HTTP/1.1\r\nHost: a\r\n\r\n").await;
        settle().await;

        let (clean, response) = tokio::join!(server.server.shutdown(), async {
            // Idle connections close first, without a response.
            assert!(idle.read_to_close().await.is_empty());
            gate.notify_one();
            active.response().await
        });

        assert!(clean);
        assert_eq!(response.body, b"done");
        assert_eq!(response.header("connection"), Some("close"));
        assert_eq!(idle.end_reason().await, EndReason::GracefulShutdown);
        assert_eq!(active.end_reason().await, EndReason::Completed);

        // Connections arriving after the shutdown are turned away.
        assert_eq!(server.connect().finish().await, EndReason::GracefulShutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_timeout_aborts() {
        let server = TestServer::with(Gated::open(), |builder| {
            builder.server_limits(ServerLimits {
                shutdown_timeout: Duration::from_secs(5),
                ..ServerLimits::default()
            })
        });

        let mut stuck = server.connect();
        stuck.send("GET /slow HTTP/1.1\r\nHost: a\r\n\r\n").await;
        settle().await;

        assert!(!server.server.shutdown().await);
        assert!(stuck.read_to_close().await.is_empty());
        assert_eq!(stuck.end_reason().await, EndReason::ShutdownTimeout);
        assert_eq!(server.server.connection_manager().active_count(), 0);
    }
}
