//! Periodic timeout sweep and the clocks it runs on

use bytes::Bytes;
use crossbeam::sync::ShardedLock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::task::JoinHandle;

/// Time source of the server.
///
/// Every deadline is computed from [`now`](Self::now), so tests can drive
/// timeouts with a [`ManualClock`] instead of waiting.
pub trait SystemClock: Send + Sync + 'static {
    /// Monotonic time.
    fn now(&self) -> Instant;
    /// Wall clock time, used for the `Date` header.
    fn utc_now(&self) -> SystemTime;
}

/// Clock backed by tokio's timer, so paused test time applies to it too.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl SystemClock for TokioClock {
    #[inline]
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    #[inline]
    fn utc_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to.
///
/// # Examples
/// ```
/// use maker_h1::{ManualClock, SystemClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let start = clock.now();
///
/// clock.advance(Duration::from_secs(5));
/// assert_eq!(clock.now() - start, Duration::from_secs(5));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<(Instant, SystemTime)>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((Instant::now(), UNIX_EPOCH + Duration::from_secs(1_700_000_000))),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.0 += by;
        inner.1 += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock for ManualClock {
    #[inline]
    fn now(&self) -> Instant {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    #[inline]
    fn utc_now(&self) -> SystemTime {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}

/// Work performed on every heartbeat tick.
pub trait HeartbeatHandler: Send + Sync + 'static {
    /// `now` never goes backwards between two calls.
    fn on_heartbeat(&self, now: Instant);
}

/// Drives every registered [`HeartbeatHandler`] at a fixed interval.
///
/// A tick that is still running when the next one fires makes the next one
/// a no-op. A tick that takes longer than the interval is logged as a warning.
pub struct Heartbeat {
    clock: Arc<dyn SystemClock>,
    interval: Duration,
    handlers: Vec<Arc<dyn HeartbeatHandler>>,

    in_progress: AtomicBool,
    last: Mutex<Option<Instant>>,
}

impl Heartbeat {
    pub fn new(
        clock: Arc<dyn SystemClock>,
        interval: Duration,
        handlers: Vec<Arc<dyn HeartbeatHandler>>,
    ) -> Self {
        Self {
            clock,
            interval,
            handlers,

            in_progress: AtomicBool::new(false),
            last: Mutex::new(None),
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn clock(&self) -> &Arc<dyn SystemClock> {
        &self.clock
    }

    /// Runs one tick. Returns `false` if another tick was still running.
    pub fn on_heartbeat(&self) -> bool {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            tracing::trace!("heartbeat still running, tick skipped");
            return false;
        }
        let _running = InProgress(&self.in_progress);

        let now = {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            let now = match *last {
                Some(prev) => self.clock.now().max(prev),
                None => self.clock.now(),
            };
            *last = Some(now);
            now
        };

        let started = Instant::now();
        for handler in &self.handlers {
            handler.on_heartbeat(now);
        }

        let took = started.elapsed();
        if took > self.interval {
            tracing::warn!(
                took_ms = took.as_millis() as u64,
                interval_ms = self.interval.as_millis() as u64,
                "heartbeat took longer than its interval"
            );
        }

        true
    }

    /// Spawns the tick loop on the current tokio runtime.
    ///
    /// The loop stops when the returned task is dropped.
    pub fn start(self: &Arc<Self>) -> HeartbeatTask {
        let heartbeat = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                heartbeat.on_heartbeat();
            }
        });

        HeartbeatTask(handle)
    }
}

/// Clears the in-progress flag when a tick ends, even by a panicking handler.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heartbeat")
            .field("interval", &self.interval)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Running tick loop of a [`Heartbeat`], aborted on drop.
#[derive(Debug)]
pub struct HeartbeatTask(JoinHandle<()>);

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Cached value of the `Date` response header.
///
/// Formatted at most once per second, on heartbeat ticks.
pub(crate) struct DateHeader {
    clock: Arc<dyn SystemClock>,
    second: AtomicU64,
    value: ShardedLock<Bytes>,
}

impl DateHeader {
    pub(crate) fn new(clock: Arc<dyn SystemClock>) -> Self {
        let date = Self {
            clock,
            second: AtomicU64::new(u64::MAX),
            value: ShardedLock::new(Bytes::new()),
        };
        date.refresh();
        date
    }

    #[inline]
    pub(crate) fn get(&self) -> Bytes {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn refresh(&self) {
        let utc = self.clock.utc_now();
        let second = utc
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_secs());

        if self.second.swap(second, Ordering::AcqRel) == second {
            return;
        }

        let value = Bytes::from(httpdate::fmt_http_date(utc));
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl HeartbeatHandler for DateHeader {
    #[inline]
    fn on_heartbeat(&self, _now: Instant) {
        self.refresh();
    }
}
