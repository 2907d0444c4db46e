use crate::{
    errors::{BadRequest, EndReason, Error, RejectionReason, UsageError},
    http::{
        body::{BodyReader, Decoded, Framing},
        request::{HeadParser, Parsed, RequestHead},
        response::{Response, ResponseWriter},
        types::{Header, StatusCode},
    },
    limits::{ConnLimits, ReqLimits, RespLimits},
    server::{
        counter::{ResourceCounter, ResourceSlot},
        heartbeat::DateHeader,
        manager::ConnectionId,
        server_impl::{ConnectionObserver, Handler},
        timeout::{TimeoutControl, TimeoutReason},
    },
};
use bytes::{Buf, BytesMut};
use std::{
    any::Any,
    fmt,
    future::{poll_fn, Future},
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::{pin, Pin},
    sync::Arc,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// GOAWAY(HTTP_1_1_REQUIRED) sent to clients opening with the HTTP/2 preface.
const HTTP2_GOAWAY: [u8; 17] = [0, 0, 8, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x0d];

const READ_CHUNK: usize = 4096;

/// Duplex byte stream a connection runs on.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Configuration and services shared by every connection of a server.
pub(crate) struct ConnShared {
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
    pub(crate) date: Arc<DateHeader>,
    pub(crate) upgrades: Arc<ResourceCounter>,
    pub(crate) observer: Arc<dyn ConnectionObserver>,
}

/// What woke a connection waiting on its stream.
enum Wake {
    Read(io::Result<usize>),
    TimedOut,
    Shutdown,
    Aborted,
}

enum Handled {
    Done,
    Failed(String),
    Aborted,
}

enum Next {
    KeepAlive,
    Close(EndReason),
}

/// Per-connection state that outlives a single request.
pub(crate) struct ConnState {
    id: ConnectionId,
    stream: Box<dyn Stream>,
    input: BytesMut,
    output: BytesMut,
    control: Arc<TimeoutControl>,
    shared: Arc<ConnShared>,
    /// Quota slot held by the connection, swapped for an upgrade slot on upgrade.
    slot: Option<ResourceSlot>,
}

impl ConnState {
    /// Writes out the whole output buffer under the response data rate.
    async fn flush(&mut self) -> Result<(), Error> {
        if self.output.is_empty() {
            return Ok(());
        }

        let control = &*self.control;
        control.start_timing_write(
            self.output.len(),
            self.shared.resp_limits.min_response_data_rate,
        );

        let result = tokio::select! {
            biased;
            _ = control.aborted() => Err(aborted(control)),
            written = write_out(&mut self.stream, &mut self.output) => written.map_err(Error::Io),
        };

        control.stop_timing_write();
        result
    }

    fn report(&self, err: &BadRequest) {
        tracing::debug!(
            status = err.status().as_u16(),
            message = err.message(),
            "bad request"
        );
        self.shared.observer.on_bad_request(self.id, err);
    }

    /// Answers `err` with its error response. The connection closes afterwards.
    async fn reject(&mut self, err: &BadRequest) -> EndReason {
        self.report(err);

        let date = self.shared.date.get();
        ResponseWriter::write_rejection(
            &mut self.output,
            err.status(),
            err.allow(),
            &date,
            &self.shared.resp_limits,
        );

        if let Err(flush) = self.flush().await {
            tracing::trace!(error = %flush, "error response not delivered");
        }

        err.reason().end_reason()
    }
}

#[inline]
async fn read_more(stream: &mut Box<dyn Stream>, input: &mut BytesMut) -> io::Result<usize> {
    input.reserve(READ_CHUNK);
    stream.read_buf(input).await
}

#[inline]
async fn write_out(stream: &mut Box<dyn Stream>, output: &mut BytesMut) -> io::Result<()> {
    stream.write_all_buf(output).await?;
    stream.flush().await
}

#[inline]
fn end_reason(control: &TimeoutControl) -> EndReason {
    control.end_reason().unwrap_or(EndReason::OtherError)
}

#[inline]
fn aborted(control: &TimeoutControl) -> Error {
    Error::Aborted(end_reason(control))
}

async fn catch_panic<F: Future>(future: F) -> Result<F::Output, Box<dyn Any + Send>> {
    let mut future = pin!(future);

    poll_fn(|cx| match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx))) {
        Ok(Poll::Pending) => Poll::Pending,
        Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
        Err(payload) => Poll::Ready(Err(payload)),
    })
    .await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    match payload.downcast_ref::<&str>() {
        Some(message) => format!("handler panicked: {message}"),
        None => match payload.downcast_ref::<String>() {
            Some(message) => format!("handler panicked: {message}"),
            None => "handler panicked".to_owned(),
        },
    }
}

//

/// One accepted connection, from the first byte to the close.
pub(crate) struct HttpConnection<H: Handler> {
    handler: Arc<H>,
    state: ConnState,
    parser: HeadParser,
    requests: u32,
}

impl<H: Handler> HttpConnection<H> {
    pub(crate) fn new<S: Stream + 'static>(
        id: ConnectionId,
        stream: S,
        handler: Arc<H>,
        shared: Arc<ConnShared>,
        control: Arc<TimeoutControl>,
        slot: ResourceSlot,
    ) -> Self {
        let output = BytesMut::with_capacity(shared.resp_limits.default_capacity);

        Self {
            handler,
            state: ConnState {
                id,
                stream: Box::new(stream),
                input: BytesMut::with_capacity(READ_CHUNK),
                output,
                control,
                shared,
                slot: Some(slot),
            },
            parser: HeadParser::new(),
            requests: 0,
        }
    }

    /// Serves requests until the connection ends, then reports why.
    pub(crate) async fn run(mut self) -> EndReason {
        let reason = self.serve().await;
        let control = Arc::clone(&self.state.control);
        control.set_end_reason(reason);

        if !control.is_aborted() {
            tokio::select! {
                biased;
                _ = control.aborted() => {}
                _ = self.state.stream.shutdown() => {}
            }
        }

        end_reason(&control)
    }

    async fn serve(&mut self) -> EndReason {
        loop {
            let head = match self.read_head().await {
                Ok(head) => head,
                Err(reason) => return reason,
            };

            if let Next::Close(reason) = self.process(head).await {
                return reason;
            }
        }
    }
}

// Await the next request
impl<H: Handler> HttpConnection<H> {
    async fn read_head(&mut self) -> Result<RequestHead, EndReason> {
        let shared = Arc::clone(&self.state.shared);
        let control = Arc::clone(&self.state.control);
        let limits = &shared.conn_limits;

        self.parser.reset();
        control.set_timeout(limits.keep_alive_timeout, TimeoutReason::KeepAlive);
        let mut receiving = false;

        loop {
            if !self.state.input.is_empty() {
                // Blank lines count, the headers timer is never extended.
                if !receiving {
                    receiving = true;
                    control.set_timeout(
                        limits.request_headers_timeout,
                        TimeoutReason::RequestHeaders,
                    );
                }

                match self.parser.parse(&mut self.state.input, &shared.req_limits) {
                    Ok(Parsed::Head(head)) => {
                        control.cancel_timeout();
                        return Ok(head);
                    }
                    Ok(Parsed::Http2Preface) => {
                        tracing::debug!("HTTP/2 preface received on an HTTP/1.x connection");
                        self.state.output.extend_from_slice(&HTTP2_GOAWAY);
                        if let Err(err) = self.state.flush().await {
                            tracing::trace!(error = %err, "GOAWAY not delivered");
                        }
                        return Err(EndReason::InvalidHttpVersion);
                    }
                    Ok(Parsed::Partial) => {}
                    Err(err) => return Err(self.state.reject(&err).await),
                }
            }

            if !receiving && control.is_shutting_down() {
                return Err(EndReason::GracefulShutdown);
            }

            let wake = tokio::select! {
                biased;
                _ = control.aborted() => Wake::Aborted,
                _ = control.timed_out() => Wake::TimedOut,
                _ = control.shutdown(), if !receiving => Wake::Shutdown,
                read = read_more(&mut self.state.stream, &mut self.state.input) => Wake::Read(read),
            };

            match wake {
                Wake::Read(Ok(0)) if self.state.input.is_empty() => return Err(EndReason::Completed),
                Wake::Read(Ok(0)) | Wake::Read(Err(_)) => return Err(EndReason::ConnectionReset),
                Wake::Read(Ok(_)) => {}
                Wake::Shutdown => return Err(EndReason::GracefulShutdown),
                Wake::Aborted => return Err(end_reason(&control)),
                Wake::TimedOut => {
                    return match control.timeout_reason() {
                        Some(TimeoutReason::KeepAlive) => Err(EndReason::KeepAliveTimeout),
                        _ => {
                            let err = BadRequest::new(RejectionReason::RequestHeadersTimeout);
                            Err(self.state.reject(&err).await)
                        }
                    };
                }
            }
        }
    }
}

// Run one exchange
impl<H: Handler> HttpConnection<H> {
    async fn process(&mut self, mut head: RequestHead) -> Next {
        self.requests = self.requests.wrapping_add(1);

        let framing = match Framing::for_request(&mut head) {
            Ok(framing) => framing,
            Err(err) => return Next::Close(self.state.reject(&err).await),
        };

        let control = Arc::clone(&self.state.control);
        let keep_alive = head.is_keep_alive() && !control.is_shutting_down();

        let mut ctx = HttpContext {
            trace_id: format!("{}:{:08X}", self.state.id, self.requests),
            writer: ResponseWriter::new(head.version(), head.method(), keep_alive),
            body: BodyReader::new(framing, &self.state.shared.req_limits),
            response: Response::new(),
            head,
            state: &mut self.state,
            timing_read: false,
        };

        let handled = {
            let handling = catch_panic(self.handler.handle(&mut ctx));

            tokio::select! {
                biased;
                _ = control.aborted() => Handled::Aborted,
                result = handling => match result {
                    Ok(Ok(())) => Handled::Done,
                    Ok(Err(err)) => Handled::Failed(err.to_string()),
                    Err(payload) => Handled::Failed(panic_message(&*payload)),
                },
            }
        };

        ctx.complete(handled).await
    }
}

//

/// Everything a [`Handler`] sees of one request: the head, the body stream,
/// the response and the upgrade accessor.
///
/// Reads and writes suspend on the connection's stream and fail with
/// [`Error::Aborted`] once the connection is terminated, so a handler never
/// outlives its connection.
///
/// # Examples
/// ```
/// use maker_h1::{BoxError, Handler, HttpContext, StatusCode};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
///         let mut body = Vec::new();
///         ctx.read_to_end(&mut body).await?;
///
///         ctx.response_mut()
///             .set_status(StatusCode::Ok)?
///             .header("content-length", &body.len().to_string())?;
///         ctx.write(&body).await?;
///         Ok(())
///     }
/// }
/// ```
pub struct HttpContext<'c> {
    head: RequestHead,
    body: BodyReader,
    response: Response,
    writer: ResponseWriter,
    trace_id: String,
    state: &'c mut ConnState,
    timing_read: bool,
}

// Request
impl HttpContext<'_> {
    #[inline]
    pub fn request(&self) -> &RequestHead {
        &self.head
    }

    /// `<connection id>:<request number>`, e.g. `0HMVD8S3RVFO1:00000002`.
    #[inline]
    pub fn trace_identifier(&self) -> &str {
        &self.trace_id
    }

    #[inline]
    pub fn connection_id(&self) -> ConnectionId {
        self.state.id
    }

    /// Effective body size limit of this request, `None` if unlimited.
    #[inline]
    pub fn max_request_body_size(&self) -> Option<u64> {
        self.body.max_size()
    }

    /// Overrides the body size limit for this request.
    ///
    /// # Errors
    ///
    /// [`UsageError::BodySizeReadOnly`] once the body has been read from,
    /// [`UsageError::BodySizeAfterUpgrade`] after [`upgrade`](Self::upgrade).
    #[inline]
    pub fn set_max_request_body_size(&mut self, max: Option<u64>) -> Result<(), UsageError> {
        self.body.set_max_size(max)
    }

    /// Reads body bytes into `buf`. `Ok(0)` marks the end of the body.
    ///
    /// A body failure is sticky: every later call returns the same error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let limits = &self.state.shared.req_limits;

            match self.body.decode(&mut self.state.input, buf, limits)? {
                Decoded::Data(n) => return Ok(n),
                Decoded::End => {
                    if self.timing_read {
                        self.state.control.stop_timing_read();
                    }
                    return Ok(0);
                }
                Decoded::NeedMore => self.fill_body().await?,
            }
        }
    }

    /// Reads the rest of the body, returns the number of bytes appended.
    pub async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        let start = buf.len();
        let mut chunk = [0; READ_CHUNK];

        loop {
            match self.read(&mut chunk).await? {
                0 => return Ok(buf.len() - start),
                n => buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Trailer fields of a chunked body, available once it was read to the end.
    #[inline]
    pub fn request_trailers(&self) -> &[Header] {
        self.body.trailers()
    }

    async fn fill_body(&mut self) -> Result<(), Error> {
        let control = Arc::clone(&self.state.control);

        if !self.timing_read {
            self.timing_read = true;
            control.start_timing_read(self.state.shared.req_limits.min_request_body_data_rate);
        }

        control.resume_timing_read();

        let wake = tokio::select! {
            biased;
            _ = control.aborted() => Wake::Aborted,
            _ = control.timed_out() => Wake::TimedOut,
            read = read_more(&mut self.state.stream, &mut self.state.input) => Wake::Read(read),
        };

        control.pause_timing_read();

        match wake {
            Wake::Read(Ok(0)) => {
                let err = BadRequest::new(RejectionReason::UnexpectedEndOfRequestContent);
                Err(self.body.fail(err).into())
            }
            Wake::Read(Ok(n)) => {
                control.bytes_read(n);
                Ok(())
            }
            Wake::Read(Err(err)) => {
                control.abort(EndReason::ConnectionReset);
                Err(Error::Io(err))
            }
            Wake::TimedOut => {
                let err = BadRequest::new(RejectionReason::RequestBodyTimeout);
                Err(self.body.fail(err).into())
            }
            Wake::Aborted | Wake::Shutdown => Err(aborted(&control)),
        }
    }
}

// Response
impl HttpContext<'_> {
    #[inline]
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Status and headers, writable until the head is sent.
    #[inline]
    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Appends body bytes, sending the head first if needed.
    ///
    /// Output is buffered up to
    /// [`max_buffered`](crate::limits::RespLimits::max_buffered) bytes, then
    /// written out under the minimum response data rate.
    ///
    /// # Errors
    ///
    /// Writing past a declared `Content-Length` returns
    /// [`UsageError::ContentLengthExceeded`] and aborts the connection.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.close_on_shutdown();
        let shared = &self.state.shared;
        let date = shared.date.get();

        if let Err(err) = self.writer.write(
            &mut self.response,
            &mut self.state.output,
            data,
            &date,
            &shared.resp_limits,
        ) {
            if let UsageError::ContentLengthExceeded { .. } = err {
                self.state.control.abort(EndReason::ResponseContentLengthMismatch);
            }
            return Err(err.into());
        }

        if self.state.output.len() >= self.state.shared.resp_limits.max_buffered {
            self.state.flush().await?;
        }

        Ok(())
    }

    /// Sends the head, if it was not sent yet, and everything buffered.
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.close_on_shutdown();
        let shared = &self.state.shared;
        let date = shared.date.get();

        self.writer.start(
            &mut self.response,
            &mut self.state.output,
            &date,
            &shared.resp_limits,
        )?;

        self.state.flush().await
    }

    /// A head sent once shutdown started carries `Connection: close`.
    #[inline]
    fn close_on_shutdown(&mut self) {
        if self.state.control.is_shutting_down() {
            self.writer.disable_keep_alive();
        }
    }

    /// Ends the connection right away, nothing more is written to it.
    #[inline]
    pub fn abort(&self) {
        self.state.control.abort(EndReason::AbortedByApp);
    }
}

// Upgrade
impl HttpContext<'_> {
    #[inline]
    pub fn is_upgradable(&self) -> bool {
        self.head.is_upgradable() && !self.response.is_upgraded()
    }

    /// Answers `101 Switching Protocols` and hands over the raw stream.
    ///
    /// The connection moves from the connection quota to the upgraded
    /// connection quota and is no longer subject to the keep-alive timeout.
    /// Request body reads return `0` from now on and the response can no
    /// longer be written through this context.
    ///
    /// # Errors
    ///
    /// - [`UsageError::AlreadyUpgraded`] on a second call.
    /// - [`UsageError::NotUpgradable`] if the request did not ask for it.
    /// - [`UsageError::HeadersReadOnly`] if the response has started.
    /// - [`UsageError::UpgradeQuotaExceeded`] if no upgraded slot is left.
    pub async fn upgrade(&mut self) -> Result<Upgraded<'_>, Error> {
        if self.response.is_upgraded() {
            return Err(UsageError::AlreadyUpgraded.into());
        }

        if !self.head.is_upgradable() {
            return Err(UsageError::NotUpgradable.into());
        }

        if self.writer.has_started() {
            return Err(UsageError::HeadersReadOnly.into());
        }

        let shared = Arc::clone(&self.state.shared);
        let Some(slot) = shared.upgrades.try_acquire_slot() else {
            return Err(UsageError::UpgradeQuotaExceeded.into());
        };

        self.response.set_status(StatusCode::SwitchingProtocols)?;
        self.writer.start(
            &mut self.response,
            &mut self.state.output,
            &shared.date.get(),
            &shared.resp_limits,
        )?;

        // Gives back the connection slot.
        self.state.slot = Some(slot);

        self.response.mark_upgraded();
        self.body.mark_upgraded();
        self.state.control.mark_upgraded();

        self.state.flush().await?;
        tracing::debug!(trace_id = %self.trace_id, "connection upgraded");

        Ok(Upgraded {
            state: &mut *self.state,
        })
    }
}

// Complete the exchange
impl HttpContext<'_> {
    async fn complete(mut self, handled: Handled) -> Next {
        let control = Arc::clone(&self.state.control);

        if self.timing_read {
            control.stop_timing_read();
        }

        let failed = match handled {
            Handled::Aborted => return Next::Close(end_reason(&control)),
            Handled::Failed(message) => {
                tracing::error!(
                    trace_id = %self.trace_id,
                    error = %message,
                    "unhandled application error"
                );
                true
            }
            Handled::Done => false,
        };

        if control.is_aborted() {
            return Next::Close(end_reason(&control));
        }

        if control.is_upgraded() {
            return match failed {
                true => self.fail(EndReason::UnhandledApplicationError).await,
                false => Next::Close(EndReason::Completed),
            };
        }

        let mut close = None;

        if let Some(err) = self.body.error().cloned() {
            if !self.writer.has_started() {
                return Next::Close(self.state.reject(&err).await);
            }

            self.state.report(&err);
            if failed {
                control.abort(err.reason().end_reason());
                return Next::Close(end_reason(&control));
            }
            close = Some(err.reason().end_reason());
        } else if failed {
            return self.fail(EndReason::UnhandledApplicationError).await;
        }

        self.close_on_shutdown();

        let shared = Arc::clone(&self.state.shared);
        let date = shared.date.get();

        if let Err(err) = self.writer.finish(
            &mut self.response,
            &mut self.state.output,
            &date,
            &shared.resp_limits,
        ) {
            tracing::error!(trace_id = %self.trace_id, error = %err, "invalid response");

            return match err {
                UsageError::ContentLengthShort { .. } => {
                    self.fail(EndReason::ResponseContentLengthMismatch).await
                }
                _ => self.fail(EndReason::UnhandledApplicationError).await,
            };
        }

        if let Err(err) = self.state.flush().await {
            return Next::Close(self.end_reason_of(&err));
        }

        if let Some(reason) = close {
            return Next::Close(reason);
        }

        if !self.writer.keep_alive() || control.is_shutting_down() {
            return Next::Close(EndReason::Completed);
        }

        // Skip what the handler left unread.
        let mut scratch = [0; READ_CHUNK];
        while !self.body.is_finished() {
            if let Err(err) = self.read(&mut scratch).await {
                return Next::Close(self.end_reason_of(&err));
            }
        }

        Next::KeepAlive
    }

    /// Replaces the response with a bare `500` if nothing was sent yet,
    /// aborts the connection otherwise.
    async fn fail(&mut self, reason: EndReason) -> Next {
        let control = Arc::clone(&self.state.control);

        if self.writer.has_started() || self.response.is_upgraded() {
            control.abort(reason);
            return Next::Close(end_reason(&control));
        }

        control.set_end_reason(reason);
        self.response.reset();

        let shared = Arc::clone(&self.state.shared);
        ResponseWriter::write_rejection(
            &mut self.state.output,
            StatusCode::InternalServerError,
            None,
            &shared.date.get(),
            &shared.resp_limits,
        );

        if let Err(err) = self.state.flush().await {
            tracing::trace!(error = %err, "error response not delivered");
        }

        Next::Close(end_reason(&control))
    }

    fn end_reason_of(&self, err: &Error) -> EndReason {
        match err {
            Error::BadRequest(err) => {
                self.state.report(err);
                err.reason().end_reason()
            }
            Error::Aborted(reason) => *reason,
            Error::Io(_) => EndReason::ConnectionReset,
            Error::Usage(_) => EndReason::OtherError,
        }
    }
}

impl fmt::Debug for HttpContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpContext")
            .field("trace_id", &self.trace_id)
            .field("method", self.head.method())
            .field("path", &self.head.path())
            .field("response", &self.response)
            .finish()
    }
}

//

/// Raw stream of an upgraded connection.
///
/// Bytes the client sent after the upgrade request and that were already
/// buffered are returned first.
pub struct Upgraded<'c> {
    state: &'c mut ConnState,
}

impl Upgraded<'_> {
    #[inline]
    pub fn connection_id(&self) -> ConnectionId {
        self.state.id
    }
}

impl AsyncRead for Upgraded<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let state = &mut *self.get_mut().state;

        if !state.input.is_empty() {
            let n = state.input.len().min(buf.remaining());
            buf.put_slice(&state.input[..n]);
            state.input.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut state.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded<'_> {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().state.stream).poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().state.stream).poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().state.stream).poll_shutdown(cx)
    }
}

impl fmt::Debug for Upgraded<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded")
            .field("connection_id", &self.state.id)
            .field("buffered", &self.state.input.len())
            .finish()
    }
}

#[cfg(test)]
mod connection_self {
    use super::*;
    use crate::{
        limits::{MinDataRate, ReqLimits, RespLimits, ServerLimits},
        tools::{settle, TestServer, TEST_DATE},
        BoxError,
    };
    use std::{sync::Mutex, time::Duration};

    struct Empty;

    impl Handler for Empty {
        async fn handle(&self, _: &mut HttpContext<'_>) -> Result<(), BoxError> {
            Ok(())
        }
    }

    struct Echo;

    impl Handler for Echo {
        async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
            let mut body = Vec::new();
            ctx.read_to_end(&mut body).await?;

            let trailers = ctx.request_trailers().len().to_string();
            ctx.response_mut()
                .header("x-trailers", trailers)?
                .header("content-length", body.len().to_string())?;
            ctx.write(&body).await?;
            Ok(())
        }
    }

    struct TraceId;

    impl Handler for TraceId {
        async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
            let id = ctx.trace_identifier().to_owned();
            ctx.response_mut().header("content-length", id.len().to_string())?;
            ctx.write(id.as_bytes()).await?;
            Ok(())
        }
    }

    struct Failing;

    impl Handler for Failing {
        async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
            let path = ctx.request().path().to_owned();

            match path.as_str() {
                "/panic" => panic!("boom"),
                "/error" => Err("nope".into()),
                "/late" => {
                    ctx.write(b"partial").await?;
                    ctx.flush().await?;
                    Err("too late".into())
                }
                _ => {
                    // Declares more than it writes.
                    ctx.response_mut().header("content-length", "10")?;
                    ctx.write(b"abc").await?;
                    Ok(())
                }
            }
        }
    }

    struct EchoUpgrade;

    impl Handler for EchoUpgrade {
        async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
            let mut stream = ctx.upgrade().await?;
            let mut buf = [0; 64];

            loop {
                match stream.read(&mut buf).await? {
                    0 => return Ok(()),
                    n => stream.write_all(&buf[..n]).await?,
                }
            }
        }
    }

    /// Records what the context still allows after an upgrade.
    #[derive(Clone, Default)]
    struct UpgradeRules(Arc<Mutex<Vec<Result<(), UsageError>>>>);

    impl Handler for UpgradeRules {
        async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
            let upgraded = usage(ctx.upgrade().await);
            let mut outcomes = vec![upgraded.clone()];

            match upgraded {
                Ok(()) => {
                    outcomes.push(usage(ctx.upgrade().await));
                    outcomes.push(ctx.set_max_request_body_size(Some(1)));
                    outcomes.push(usage(ctx.write(b"late").await));
                    outcomes.push(usage(ctx.read(&mut [0; 8]).await.map(|n| assert_eq!(n, 0))));
                }
                Err(_) => {
                    ctx.response_mut().set_status(StatusCode::ServiceUnavailable)?;
                }
            }

            self.0.lock().unwrap().extend(outcomes);
            Ok(())
        }
    }

    fn usage<T>(result: Result<T, Error>) -> Result<(), UsageError> {
        match result {
            Ok(_) => Ok(()),
            Err(Error::Usage(err)) => Err(err),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    /// Changes the body size limit before or after the first read.
    struct BodyLimit;

    impl Handler for BodyLimit {
        async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
            let path = ctx.request().path().to_owned();
            let mut body = Vec::new();

            let set = match path.as_str() {
                "/raise" => ctx.set_max_request_body_size(Some(16)),
                "/lower" => ctx.set_max_request_body_size(Some(4)),
                _ => {
                    let mut first = [0; 1];
                    let n = ctx.read(&mut first).await?;
                    body.extend_from_slice(&first[..n]);
                    ctx.set_max_request_body_size(None)
                }
            };
            ctx.read_to_end(&mut body).await?;

            let set = match set {
                Ok(()) => "ok",
                Err(UsageError::BodySizeReadOnly) => "read-only",
                Err(_) => "other",
            };
            ctx.response_mut()
                .header("x-set", set)?
                .header("content-length", body.len().to_string())?;
            ctx.write(&body).await?;
            Ok(())
        }
    }

    /// Writes 1 MiB. On `/swallow` a failed body read is ignored first.
    struct Flood;

    impl Handler for Flood {
        async fn handle(&self, ctx: &mut HttpContext<'_>) -> Result<(), BoxError> {
            if ctx.request().path() == "/swallow" {
                let mut body = Vec::new();
                let _ = ctx.read_to_end(&mut body).await;
            }

            ctx.write(&vec![b'x'; 1024 * 1024]).await?;
            ctx.flush().await?;
            Ok(())
        }
    }

    const UPGRADE: &str = "GET /ws HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n";

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[tokio::test(start_paused = true)]
    async fn empty_host_is_accepted() {
        let server = TestServer::new(Empty);
        let mut client = server.connect();

        client.send("GET / HTTP/1.1\r\nHost:\r\n\r\n").await;
        let response = client.response().await;

        assert_eq!(response.status(), 200);
        assert_eq!(response.header("content-length"), Some("0"));
        assert_eq!(response.header("date"), Some(TEST_DATE));
        assert_eq!(response.header("connection"), None);
        assert_eq!(client.finish().await, EndReason::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",                         "400", EndReason::InvalidRequestHeaders),
            ("GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n",   "400", EndReason::InvalidRequestHeaders),
            ("POST / HTTP/1.0\r\n\r\n",                        "400", EndReason::InvalidRequestHeaders),
            ("POST / HTTP/1.1\r\nHost: a\r\n\r\n",             "411", EndReason::InvalidRequestHeaders),
            ("GET / HTTP/1.2\r\nHost: a\r\n\r\n",              "505", EndReason::InvalidHttpVersion),
            ("GET /a%00 HTTP/1.1\r\nHost: a\r\n\r\n",         "400", EndReason::InvalidRequestTarget),
            ("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n", "400", EndReason::InvalidBodyFraming),
        ];

        for (request, status, reason) in cases {
            let server = TestServer::new(Echo);
            let mut client = server.connect();

            client.send(request).await;
            let response = text(&client.read_to_close().await);

            assert!(response.starts_with(&format!("HTTP/1.1 {status} ")), "{request:?}: {response:?}");
            assert!(response.contains("Content-Length: 0\r\n"), "{request:?}");
            assert!(response.contains("Connection: close\r\n"), "{request:?}");
            assert_eq!(client.end_reason().await, reason, "{request:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pipelined_requests() {
        let server = TestServer::new(TraceId);
        let mut client = server.connect();

        // The unread body of the first request is skipped.
        client
            .send(
                "POST /a HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello\
                 GET /b HTTP/1.1\r\nHost: a\r\n\r\n",
            )
            .await;

        let first = text(&client.response().await.body);
        let second = text(&client.response().await.body);

        let (conn_a, n_a) = first.split_once(':').unwrap();
        let (conn_b, n_b) = second.split_once(':').unwrap();
        assert_eq!(conn_a, conn_b);
        assert_eq!(conn_a.len(), 13);
        assert_eq!((n_a, n_b), ("00000001", "00000002"));

        assert_eq!(client.finish().await, EndReason::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn http10_keep_alive() {
        let server = TestServer::new(Empty);
        let mut client = server.connect();

        client.send("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await;
        let response = client.response().await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.header("connection"), Some("keep-alive"));

        client.send("GET / HTTP/1.0\r\n\r\n").await;
        let rest = text(&client.read_to_close().await);
        assert!(rest.contains("Connection: close\r\n"), "{rest:?}");
        assert_eq!(client.end_reason().await, EndReason::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn chunked_round_trip() {
        let server = TestServer::new(Echo);
        let mut client = server.connect();

        client
            .send(
                "POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
                 3\r\nhel\r\n1;ext=1\r\nl\r\n7\r\no world\r\n0\r\nX-Trailer: yes\r\n\r\n",
            )
            .await;

        let response = client.response().await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body, b"hello world");
        assert_eq!(response.header("x-trailers"), Some("1"));
        assert_eq!(client.finish().await, EndReason::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn body_too_large() {
        let server = TestServer::with(Echo, |builder| {
            builder.request_limits(crate::limits::ReqLimits {
                max_request_body_size: Some(4),
                ..Default::default()
            })
        });
        let mut client = server.connect();

        client
            .send("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello")
            .await;
        let response = text(&client.read_to_close().await);

        assert!(response.starts_with("HTTP/1.1 413 "), "{response:?}");
        assert_eq!(client.end_reason().await, EndReason::MaxRequestBodySizeExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_timeout_closes_silently() {
        let server = TestServer::with(Empty, |builder| {
            builder.connection_limits(crate::limits::ConnLimits {
                keep_alive_timeout: Duration::from_secs(10),
                ..Default::default()
            })
        });
        let mut client = server.connect();

        client.send("GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert_eq!(client.response().await.status(), 200);

        settle().await;
        server.tick(Duration::from_secs(10));
        settle().await;
        server.tick(Duration::from_secs(2));

        assert!(client.read_to_close().await.is_empty());
        assert_eq!(client.end_reason().await, EndReason::KeepAliveTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_head_times_out_with_408() {
        let server = TestServer::with(Empty, |builder| {
            builder.connection_limits(crate::limits::ConnLimits {
                request_headers_timeout: Duration::from_secs(5),
                ..Default::default()
            })
        });
        let mut client = server.connect();

        // One byte per second: progress never extends the deadline.
        for byte in b"GET / H" {
            client.try_send([*byte]).await;
            settle().await;
            server.tick(Duration::from_secs(1));
            settle().await;
        }

        let response = text(&client.read_to_close().await);
        assert!(response.starts_with("HTTP/1.1 408 "), "{response:?}");
        assert_eq!(client.end_reason().await, EndReason::RequestHeadersTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_body_times_out() {
        let server = TestServer::with(Echo, |builder| {
            builder.request_limits(crate::limits::ReqLimits {
                min_request_body_data_rate: Some(MinDataRate::new(240.0, Duration::from_secs(5))),
                ..Default::default()
            })
        });
        let mut client = server.connect();

        client
            .send("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 100\r\n\r\n0123456789")
            .await;
        settle().await;

        for _ in 0..7 {
            server.tick(Duration::from_secs(1));
            settle().await;
        }

        let response = text(&client.read_to_close().await);
        assert!(response.starts_with("HTTP/1.1 408 "), "{response:?}");
        assert_eq!(client.end_reason().await, EndReason::MinRequestBodyDataRate);
    }

    #[tokio::test(start_paused = true)]
    async fn application_failures() {
        #[rustfmt::skip]
        let cases = [
            ("/panic", Some("500"), EndReason::UnhandledApplicationError),
            ("/error", Some("500"), EndReason::UnhandledApplicationError),
            ("/late",  None,        EndReason::UnhandledApplicationError),
            ("/short", None,        EndReason::ResponseContentLengthMismatch),
        ];

        for (path, status, reason) in cases {
            let server = TestServer::new(Failing);
            let mut client = server.connect();

            client.send(format!("GET {path} HTTP/1.1\r\nHost: a\r\n\r\n")).await;
            let response = text(&client.read_to_close().await);

            match status {
                Some(status) => {
                    assert!(response.starts_with(&format!("HTTP/1.1 {status} ")), "{path}: {response:?}");
                    assert!(response.contains("Connection: close\r\n"), "{path}");
                }
                // Whatever was sent before the failure, never a complete response.
                None => assert!(!response.contains("500"), "{path}: {response:?}"),
            }
            assert_eq!(client.end_reason().await, reason, "{path}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn upgraded_connection_ignores_keep_alive() {
        let server = TestServer::with(EchoUpgrade, |builder| {
            builder.connection_limits(crate::limits::ConnLimits {
                keep_alive_timeout: Duration::from_secs(5),
                ..Default::default()
            })
        });
        let mut client = server.connect();

        client
            .send("GET /ws HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\nearly")
            .await;
        let response = client.response().await;
        assert_eq!(response.status(), 101);
        assert_eq!(response.header("connection"), Some("Upgrade"));
        assert_eq!(client.take(5).await, b"early");

        assert_eq!(server.server.connections().current(), 0);
        assert_eq!(server.server.upgraded_connections().current(), 1);

        settle().await;
        server.tick(Duration::from_secs(60));
        settle().await;

        client.send("ping").await;
        assert_eq!(client.take(4).await, b"ping");

        assert_eq!(client.finish().await, EndReason::Completed);
        assert_eq!(server.server.upgraded_connections().current(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn http2_preface_gets_goaway() {
        let server = TestServer::new(Empty);
        let mut client = server.connect();

        client.send("PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await;

        assert_eq!(client.read_to_close().await, HTTP2_GOAWAY);
        assert_eq!(client.end_reason().await, EndReason::InvalidHttpVersion);
    }

    #[tokio::test(start_paused = true)]
    async fn upgrade_is_one_way() {
        let rules = UpgradeRules::default();
        let server = TestServer::new(rules.clone());
        let mut client = server.connect();

        client.send(UPGRADE).await;
        assert_eq!(client.response().await.status(), 101);
        assert_eq!(client.end_reason().await, EndReason::Completed);

        #[rustfmt::skip]
        let expected = [
            Ok(()),
            Err(UsageError::AlreadyUpgraded),
            Err(UsageError::BodySizeAfterUpgrade),
            Err(UsageError::ResponseAfterUpgrade),
            Ok(()),
        ];
        assert_eq!(*rules.0.lock().unwrap(), expected);
        assert_eq!(server.server.upgraded_connections().current(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn upgrade_quota_exceeded() {
        let rules = UpgradeRules::default();
        let server = TestServer::with(rules.clone(), |builder| {
            builder.server_limits(ServerLimits {
                max_upgraded_connections: Some(0),
                ..ServerLimits::default()
            })
        });
        let mut client = server.connect();

        client.send(UPGRADE).await;
        let response = client.response().await;
        assert_eq!(response.status(), 503);
        assert_eq!(response.header("content-length"), Some("0"));

        assert_eq!(*rules.0.lock().unwrap(), [Err::<(), _>(UsageError::UpgradeQuotaExceeded)]);
        assert_eq!(server.server.connections().current(), 1);
        assert_eq!(server.server.upgraded_connections().current(), 0);

        // The connection is still usable as plain HTTP.
        client.send("GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert_eq!(client.response().await.status(), 503);
        assert_eq!(client.finish().await, EndReason::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn body_size_override() {
        #[rustfmt::skip]
        let cases = [
            ("/raise", "0123456789", 200, Some("ok"),        EndReason::Completed),
            ("/lower", "01234",      413, None,              EndReason::MaxRequestBodySizeExceeded),
            ("/late",  "0123",       200, Some("read-only"), EndReason::Completed),
        ];

        for (path, body, status, set, reason) in cases {
            let server = TestServer::with(BodyLimit, |builder| {
                builder.request_limits(ReqLimits {
                    max_request_body_size: Some(8),
                    ..ReqLimits::default()
                })
            });
            let mut client = server.connect();

            client
                .send(format!(
                    "POST {path} HTTP/1.1\r\nHost: a\r\nContent-Length: {}\r\n\r\n{body}",
                    body.len()
                ))
                .await;
            let response = client.response().await;

            assert_eq!(response.status(), status, "{path}");
            assert_eq!(response.header("x-set"), set, "{path}");
            if status == 200 {
                assert_eq!(response.body, body.as_bytes(), "{path}");
            }
            assert_eq!(client.finish().await, reason, "{path}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reader_is_aborted() {
        let rate = Some(MinDataRate::new(240.0, Duration::from_secs(5)));

        // The second handler ignores its read timeout and keeps writing.
        #[rustfmt::skip]
        let cases = [
            "GET /write HTTP/1.1\r\nHost: a\r\n\r\n",
            "POST /swallow HTTP/1.1\r\nHost: a\r\nContent-Length: 100\r\n\r\n0123",
        ];

        for request in cases {
            let server = TestServer::with(Flood, |builder| {
                builder
                    .request_limits(ReqLimits {
                        min_request_body_data_rate: rate,
                        ..ReqLimits::default()
                    })
                    .response_limits(RespLimits {
                        min_response_data_rate: rate,
                        ..RespLimits::default()
                    })
            });
            let mut client = server.connect();

            client.send(request).await;
            settle().await;

            for _ in 0..10 {
                server.tick(Duration::from_secs(1));
                settle().await;
            }
            for _ in 0..80 {
                server.tick(Duration::from_secs(100));
                settle().await;
            }

            assert_eq!(client.end_reason().await, EndReason::MinResponseDataRate, "{request:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_undelivered_response() {
        let server = TestServer::with(Flood, |builder| {
            builder.server_limits(ServerLimits {
                shutdown_timeout: Duration::from_secs(5),
                ..ServerLimits::default()
            })
        });
        let mut client = server.connect();

        client.send("GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
        settle().await;

        // The client never reads, the response stays stuck in the pipe.
        assert!(!server.server.shutdown().await);
        assert_eq!(client.end_reason().await, EndReason::ShutdownTimeout);

        let received = client.read_to_close().await;
        assert!(received.starts_with(b"HTTP/1.1 200 "), "{:?}", text(&received[..32]));
        assert!(received.len() < 1024 * 1024);
        assert_eq!(server.server.connection_manager().active_count(), 0);
    }
}
