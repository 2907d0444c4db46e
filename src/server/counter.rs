//! Concurrency quotas

use crossbeam::utils::CachePadded;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Receives quota events of a [`ResourceCounter`].
///
/// `counter` is the name the counter was created with, for example
/// `"connections"` or `"upgraded_connections"`.
pub trait CounterEvents: Send + Sync + 'static {
    /// Called for every acquisition attempt, `acquired` tells whether it succeeded.
    #[inline(always)]
    fn on_acquire(&self, counter: &str, acquired: bool) {
        let _ = (counter, acquired);
    }

    #[inline(always)]
    fn on_release(&self, counter: &str) {
        let _ = counter;
    }
}

impl CounterEvents for () {}

/// Lock-free concurrency quota.
///
/// Acquisition never blocks and never overshoots the maximum under contention.
/// Release saturates at zero, an unbalanced release is ignored.
///
/// # Examples
/// ```
/// use maker_h1::ResourceCounter;
///
/// let counter = ResourceCounter::quota("connections", 1);
///
/// assert!(counter.try_acquire());
/// assert!(!counter.try_acquire());
///
/// counter.release();
/// assert!(counter.try_acquire());
/// ```
pub struct ResourceCounter {
    name: &'static str,
    max: Option<u64>,
    current: CachePadded<AtomicU64>,
    events: Option<Arc<dyn CounterEvents>>,
}

impl ResourceCounter {
    /// Counter that always grants.
    #[inline]
    pub fn unlimited(name: &'static str) -> Self {
        Self::new(name, None)
    }

    /// Counter that grants at most `max` concurrent acquisitions.
    #[inline]
    pub fn quota(name: &'static str, max: u64) -> Self {
        Self::new(name, Some(max))
    }

    #[inline]
    pub fn new(name: &'static str, max: Option<u64>) -> Self {
        Self {
            name,
            max,
            current: CachePadded::new(AtomicU64::new(0)),
            events: None,
        }
    }

    /// Reports every acquire and release to `events`.
    #[inline]
    pub fn with_events(mut self, events: Arc<dyn CounterEvents>) -> Self {
        self.events = Some(events);
        self
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn max(&self) -> Option<u64> {
        self.max
    }

    /// Current number of granted acquisitions.
    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Takes one unit of the quota if one is left.
    pub fn try_acquire(&self) -> bool {
        let acquired = match self.max {
            None => {
                self.current.fetch_add(1, Ordering::AcqRel);
                true
            }
            Some(max) => self
                .current
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < max).then_some(n + 1)
                })
                .is_ok(),
        };

        if let Some(events) = &self.events {
            events.on_acquire(self.name, acquired);
        }

        acquired
    }

    /// Gives one unit back.
    pub fn release(&self) {
        let released = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();

        if !released {
            tracing::trace!(counter = self.name, "release without acquire ignored");
            return;
        }

        if let Some(events) = &self.events {
            events.on_release(self.name);
        }
    }

    /// Acquires a unit released automatically when the slot is dropped.
    #[inline]
    pub fn try_acquire_slot(self: &Arc<Self>) -> Option<ResourceSlot> {
        self.try_acquire().then(|| ResourceSlot {
            counter: Arc::clone(self),
        })
    }
}

impl fmt::Debug for ResourceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCounter")
            .field("name", &self.name)
            .field("max", &self.max)
            .field("current", &self.current())
            .finish()
    }
}

/// One unit of a [`ResourceCounter`], released on drop.
#[derive(Debug)]
#[must_use = "the unit is released as soon as the slot is dropped"]
pub struct ResourceSlot {
    counter: Arc<ResourceCounter>,
}

impl ResourceSlot {
    #[inline]
    pub fn counter(&self) -> &ResourceCounter {
        &self.counter
    }
}

impl Drop for ResourceSlot {
    fn drop(&mut self) {
        self.counter.release();
    }
}
