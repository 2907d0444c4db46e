//! Registry of live connections

use crate::{
    errors::EndReason,
    server::{heartbeat::HeartbeatHandler, timeout::TimeoutControl},
};
use std::{
    collections::HashMap,
    fmt,
    pin::pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::Notify;

const BASE32: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Identifier of a connection, unique within the process.
///
/// Displayed as 13 base32 characters, e.g. `0HMVD8S3RVFO1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    fn encode(self) -> [u8; 13] {
        let mut out = [0u8; 13];

        // 13 * 5 bits cover 65; the first digit only holds the top 4 bits.
        for (i, byte) in out.iter_mut().enumerate() {
            let shift = 5 * (12 - i as u32);
            *byte = BASE32[((self.0 >> shift) & 0x1F) as usize];
        }

        out
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encode();
        // Always ASCII.
        f.write_str(std::str::from_utf8(&encoded).unwrap_or_default())
    }
}

/// Tracks live connections, ticks their timeouts and drains them on shutdown.
///
/// Shared by the [`Server`](crate::Server) and its [`Heartbeat`](crate::Heartbeat).
pub struct ConnectionManager {
    connections: Mutex<HashMap<ConnectionId, Arc<TimeoutControl>>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    all_closed: Notify,
}

impl ConnectionManager {
    pub fn new() -> Self {
        // Seeded from the wall clock so ids differ across restarts.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| (since.as_nanos() / 100) as u64);

        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(seed),
            shutting_down: AtomicBool::new(false),
            all_closed: Notify::new(),
        }
    }

    #[inline]
    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<TimeoutControl>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub(crate) fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }

    /// Adds a connection until the returned registration is dropped.
    pub(crate) fn register(
        self: &Arc<Self>,
        id: ConnectionId,
        control: Arc<TimeoutControl>,
    ) -> Registration {
        if self.is_shutting_down() {
            control.request_shutdown();
        }

        self.connections().insert(id, control);

        Registration {
            id,
            manager: Arc::clone(self),
        }
    }

    /// Number of registered connections.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.connections().len()
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Resolves once no connection is registered.
    pub async fn wait_all_closed(&self) {
        loop {
            let mut notified = pin!(self.all_closed.notified());
            notified.as_mut().enable();

            if self.active_count() == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Asks every connection to finish, then aborts the ones still open after
    /// `timeout`.
    ///
    /// Idle connections close right away, active ones complete their current
    /// response with `Connection: close`. Returns `true` if everything closed
    /// within the timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutting_down.store(true, Ordering::Release);

        let controls = self.snapshot();
        tracing::info!(connections = controls.len(), "stopping connections");

        for control in &controls {
            control.request_shutdown();
        }

        if tokio::time::timeout(timeout, self.wait_all_closed())
            .await
            .is_ok()
        {
            return true;
        }

        let stragglers = self.snapshot();
        tracing::info!(
            connections = stragglers.len(),
            "connections still open after the shutdown timeout, aborting"
        );

        for control in &stragglers {
            control.abort(EndReason::ShutdownTimeout);
        }

        false
    }

    // Handlers run outside the registry lock.
    fn snapshot(&self) -> Vec<Arc<TimeoutControl>> {
        self.connections().values().cloned().collect()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatHandler for ConnectionManager {
    fn on_heartbeat(&self, now: Instant) {
        for control in self.snapshot() {
            control.tick(now);
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("active", &self.active_count())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Keeps a connection registered, removes it on drop.
#[derive(Debug)]
pub(crate) struct Registration {
    id: ConnectionId,
    manager: Arc<ConnectionManager>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut connections = self.manager.connections();
        connections.remove(&self.id);

        if connections.is_empty() {
            drop(connections);
            self.manager.all_closed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod manager_self {
    use super::*;
    use crate::server::{
        heartbeat::{ManualClock, SystemClock},
        timeout::TimeoutReason,
    };

    fn control(clock: &Arc<ManualClock>) -> Arc<TimeoutControl> {
        Arc::new(TimeoutControl::new(clock.clone(), Duration::from_secs(1)))
    }

    #[test]
    fn connection_ids() {
        #[rustfmt::skip]
        let cases = [
            (0,        "0000000000000"),
            (31,       "000000000000V"),
            (32,       "0000000000010"),
            (u64::MAX, "FVVVVVVVVVVVV"),
        ];

        for (raw, expected) in cases {
            assert_eq!(ConnectionId(raw).to_string(), expected);
        }

        let manager = ConnectionManager::new();
        let (a, b) = (manager.next_id(), manager.next_id());
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 13);
    }

    #[test]
    fn registration() {
        let clock = Arc::new(ManualClock::new());
        let manager = Arc::new(ConnectionManager::new());

        let first = manager.register(manager.next_id(), control(&clock));
        let second = manager.register(manager.next_id(), control(&clock));
        assert_eq!(manager.active_count(), 2);

        drop(first);
        assert_eq!(manager.active_count(), 1);
        drop(second);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn heartbeat_ticks_connections() {
        let clock = Arc::new(ManualClock::new());
        let manager = Arc::new(ConnectionManager::new());

        let idle = control(&clock);
        idle.set_timeout(Duration::from_secs(5), TimeoutReason::KeepAlive);
        let _registration = manager.register(manager.next_id(), idle.clone());

        clock.advance(Duration::from_secs(7));
        manager.on_heartbeat(clock.now());

        assert_eq!(idle.timeout_reason(), Some(TimeoutReason::KeepAlive));
    }

    #[tokio::test]
    async fn graceful_shutdown() {
        let clock = Arc::new(ManualClock::new());
        let manager = Arc::new(ConnectionManager::new());

        let active = control(&clock);
        let registration = manager.register(manager.next_id(), active.clone());

        let connection = tokio::spawn(async move {
            active.shutdown().await;
            drop(registration);
        });

        assert!(manager.shutdown(Duration::from_secs(5)).await);
        assert_eq!(manager.active_count(), 0);
        connection.await.unwrap();

        // Late registrations see the shutdown immediately.
        let late = control(&clock);
        let _registration = manager.register(manager.next_id(), late.clone());
        assert!(late.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_timeout_aborts() {
        let clock = Arc::new(ManualClock::new());
        let manager = Arc::new(ConnectionManager::new());

        let stuck = control(&clock);
        let registration = manager.register(manager.next_id(), stuck.clone());

        assert!(!manager.shutdown(Duration::from_secs(30)).await);
        assert!(stuck.is_aborted());
        assert_eq!(stuck.end_reason(), Some(EndReason::ShutdownTimeout));

        drop(registration);
        manager.wait_all_closed().await;
    }
}
