//! Per-connection deadlines, data rates and termination signals

use crate::{errors::EndReason, limits::MinDataRate, server::heartbeat::SystemClock};
use std::{
    fmt,
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    time::{Duration, Instant},
};
use tokio::sync::Notify;

/// What a fired deadline was guarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutReason {
    KeepAlive,
    RequestHeaders,
    ReadDataRate,
}

/// One-shot flag that async code can wait on.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    fired: AtomicBool,
    notify: Notify,
}

impl Signal {
    #[inline]
    pub(crate) fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    #[inline]
    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolves once [`fire`](Self::fire) was called, immediately if it already was.
    pub(crate) async fn wait(&self) {
        let mut notified = pin!(self.notify.notified());
        notified.as_mut().enable();

        if self.is_fired() {
            return;
        }

        notified.await;
    }
}

#[derive(Debug, Default)]
struct ReadTiming {
    rate: Option<MinDataRate>,
    running: bool,
    since: Option<Instant>,
    elapsed: Duration,
    bytes: u64,
}

#[derive(Debug, Default)]
struct WriteTiming {
    deadline: Option<Instant>,
    pending: usize,
}

#[derive(Debug, Default)]
struct Timers {
    deadline: Option<(Instant, TimeoutReason)>,
    fired: Option<TimeoutReason>,
    read: ReadTiming,
    write: WriteTiming,
}

/// Timeout state of one connection, checked on every heartbeat tick.
///
/// Every deadline gets one heartbeat interval of slack, a timeout fires on the
/// first tick after it. The connection owns the control and the
/// [`ConnectionManager`](crate::ConnectionManager) keeps a reference to tick
/// it and to deliver shutdown.
pub(crate) struct TimeoutControl {
    clock: Arc<dyn SystemClock>,
    slack: Duration,
    timers: Mutex<Timers>,

    timed_out: Signal,
    aborted: Signal,
    shutdown: Signal,
    end_reason: OnceLock<EndReason>,
    upgraded: AtomicBool,
}

impl TimeoutControl {
    pub(crate) fn new(clock: Arc<dyn SystemClock>, slack: Duration) -> Self {
        Self {
            clock,
            slack,
            timers: Mutex::default(),

            timed_out: Signal::default(),
            aborted: Signal::default(),
            shutdown: Signal::default(),
            end_reason: OnceLock::new(),
            upgraded: AtomicBool::new(false),
        }
    }

    #[inline]
    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }
}

impl fmt::Debug for TimeoutControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutControl")
            .field("timers", &*self.timers())
            .field("end_reason", &self.end_reason())
            .field("upgraded", &self.is_upgraded())
            .finish()
    }
}

// Deadlines
impl TimeoutControl {
    /// Replaces the current deadline.
    pub(crate) fn set_timeout(&self, duration: Duration, reason: TimeoutReason) {
        let deadline = self.clock.now() + duration + self.slack;
        self.timers().deadline = Some((deadline, reason));
    }

    #[inline]
    pub(crate) fn cancel_timeout(&self) {
        self.timers().deadline = None;
    }

    /// Reason of the timeout that fired, if any.
    #[inline]
    pub(crate) fn timeout_reason(&self) -> Option<TimeoutReason> {
        self.timers().fired
    }

    #[inline]
    pub(crate) async fn timed_out(&self) {
        self.timed_out.wait().await
    }
}

// Data rates
impl TimeoutControl {
    /// Arms body read-rate tracking; time only counts while a read is pending.
    pub(crate) fn start_timing_read(&self, rate: Option<MinDataRate>) {
        if self.is_upgraded() {
            return;
        }

        self.timers().read = ReadTiming {
            rate,
            ..ReadTiming::default()
        };
    }

    pub(crate) fn resume_timing_read(&self) {
        let now = self.clock.now();
        let mut timers = self.timers();
        let read = &mut timers.read;

        if read.rate.is_some() && !read.running {
            read.running = true;
            read.since = Some(now);
        }
    }

    pub(crate) fn pause_timing_read(&self) {
        let now = self.clock.now();
        let mut timers = self.timers();
        let read = &mut timers.read;

        if read.running {
            read.running = false;
            if let Some(since) = read.since.take() {
                read.elapsed += now.saturating_duration_since(since);
            }
        }
    }

    #[inline]
    pub(crate) fn bytes_read(&self, n: usize) {
        self.timers().read.bytes += n as u64;
    }

    #[inline]
    pub(crate) fn stop_timing_read(&self) {
        self.timers().read = ReadTiming::default();
    }

    /// Registers `bytes` about to be written; the peer gets the grace period
    /// or the time `rate` allows for them, whichever is longer.
    pub(crate) fn start_timing_write(&self, bytes: usize, rate: Option<MinDataRate>) {
        let Some(rate) = rate else { return };

        let allowed = Duration::try_from_secs_f64(bytes as f64 / rate.bytes_per_second)
            .map_or(rate.grace_period, |needed| needed.max(rate.grace_period));
        let now = self.clock.now();
        let mut timers = self.timers();
        let write = &mut timers.write;

        let base = match (write.pending, write.deadline) {
            (0, _) | (_, None) => now + self.slack,
            (_, Some(deadline)) => deadline,
        };

        write.deadline = base.checked_add(allowed);
        write.pending += 1;
    }

    pub(crate) fn stop_timing_write(&self) {
        let mut timers = self.timers();
        let write = &mut timers.write;
        write.pending = write.pending.saturating_sub(1);

        if write.pending == 0 {
            write.deadline = None;
        }
    }
}

// Heartbeat
impl TimeoutControl {
    /// Fires whatever deadline or rate `now` has passed.
    pub(crate) fn tick(&self, now: Instant) {
        let upgraded = self.is_upgraded();
        let mut timers = self.timers();

        if self.aborted.is_fired() {
            return;
        }

        // Checked even after a read timeout has fired.
        let write_expired = match timers.write.deadline {
            Some(deadline) => timers.write.pending > 0 && now > deadline,
            None => false,
        };

        if write_expired {
            drop(timers);
            tracing::debug!("response data rate too low");
            self.abort(EndReason::MinResponseDataRate);
            return;
        }

        if timers.fired.is_some() {
            return;
        }

        let mut fired = match timers.deadline {
            Some((deadline, reason)) if now > deadline => {
                match (upgraded, reason) {
                    (true, TimeoutReason::KeepAlive) => None,
                    _ => Some(reason),
                }
            }
            _ => None,
        };

        let read = &mut timers.read;
        if let (Some(rate), true) = (read.rate, read.running && !upgraded) {
            if let Some(since) = read.since.replace(now) {
                read.elapsed += now.saturating_duration_since(since);
            }

            let expected = rate.bytes_per_second * read.elapsed.as_secs_f64();
            if read.elapsed > rate.grace_period && (read.bytes as f64) < expected {
                fired = fired.or(Some(TimeoutReason::ReadDataRate));
            }
        }

        if let Some(reason) = fired {
            timers.deadline = None;
            timers.fired = Some(reason);
            drop(timers);
            self.timed_out.fire();
        }
    }
}

// Termination
impl TimeoutControl {
    /// Ends the connection with `reason`. Only the first call wins.
    pub(crate) fn abort(&self, reason: EndReason) -> bool {
        let first = self.end_reason.set(reason).is_ok();
        self.aborted.fire();
        first
    }

    /// Records the end reason without aborting. Only the first reason sticks.
    #[inline]
    pub(crate) fn set_end_reason(&self, reason: EndReason) {
        let _ = self.end_reason.set(reason);
    }

    #[inline]
    pub(crate) fn end_reason(&self) -> Option<EndReason> {
        self.end_reason.get().copied()
    }

    #[inline]
    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.is_fired()
    }

    #[inline]
    pub(crate) async fn aborted(&self) {
        self.aborted.wait().await
    }

    #[inline]
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.fire();
    }

    #[inline]
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_fired()
    }

    #[inline]
    pub(crate) async fn shutdown(&self) {
        self.shutdown.wait().await
    }

    /// Takes the connection out of keep-alive and read-rate enforcement.
    pub(crate) fn mark_upgraded(&self) {
        self.upgraded.store(true, Ordering::Release);

        let mut timers = self.timers();
        timers.deadline = None;
        timers.read = ReadTiming::default();
    }

    #[inline]
    pub(crate) fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::Acquire)
    }
}
