//! # Connection Pool
//!
//! Purpose: Reuse TCP connections to one endpoint, bounded by a maximum
//! count, with callers waiting on a condition variable when all are busy.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A bounded set of reusable connections; the
//!    most recently returned idle connection is handed out first.
//! 2. **Minimal Locking**: The mutex is held only while moving connections
//!    between idle and in-use; sockets are opened outside it.
//! 3. **RAII Release**: `PooledConnection` returns itself on drop, so an
//!    early `?` can never leak a slot.
//! 4. **Discard, Never Repair**: A connection that failed is closed and its
//!    slot freed; it is never handed out again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mcr_common::{Request, Response};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{ClientError, ClientResult};

/// Per-endpoint pool limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum total connections (idle + in-use).
    pub max_connections: usize,
    /// TCP connect timeout for new connections.
    pub connect_timeout: Duration,
    /// Idle connections older than this are reaped.
    pub idle_timeout: Duration,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections parked in the pool.
    pub idle: usize,
    /// Connections checked out (or being opened).
    pub in_use: usize,
    /// Connections opened over the pool's lifetime.
    pub opened: u64,
    /// Connections closed because they failed or were purged.
    pub discarded: u64,
    /// Connections closed by the idle reaper.
    pub reaped: u64,
}

struct PoolState {
    idle: Vec<Connection>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    endpoint: Endpoint,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    opened: AtomicU64,
    discarded: AtomicU64,
    reaped: AtomicU64,
}

/// Connection pool handle for one endpoint.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(endpoint: Endpoint, config: PoolConfig) -> Self {
        let state = PoolState {
            idle: Vec::with_capacity(config.max_connections),
            total: 0,
            closed: false,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                endpoint,
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
                opened: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                reaped: AtomicU64::new(0),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Acquires a connection, waiting up to `timeout` when the pool is full.
    ///
    /// Order of preference: the most recently released idle connection, a
    /// newly opened one if under the limit, then a wait for a release.
    pub fn acquire(&self, timeout: Duration) -> ClientResult<PooledConnection> {
        let deadline = Instant::now() + timeout;

        loop {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ClientError::ClientClosed);
            }

            if let Some(conn) = state.idle.pop() {
                // The slot stays counted while the socket is probed unlocked.
                drop(state);
                if let Some(conn) = self.checked(conn) {
                    return Ok(PooledConnection::new(self.clone(), conn));
                }
                continue;
            }

            if state.total < self.inner.config.max_connections {
                state.total += 1;
                drop(state);
                return self.open_reserved();
            }

            let timed_out = self.inner.available.wait_until(&mut state, deadline).timed_out();
            if timed_out
                && state.idle.is_empty()
                && state.total >= self.inner.config.max_connections
            {
                return Err(ClientError::PoolExhausted {
                    endpoint: self.inner.endpoint.clone(),
                });
            }
        }
    }

    /// Probes an idle connection taken out of the pool; dead ones are closed
    /// and their slot freed.
    fn checked(&self, mut conn: Connection) -> Option<Connection> {
        if conn.check_alive() {
            return Some(conn);
        }
        {
            let mut state = self.inner.state.lock();
            state.total = state.total.saturating_sub(1);
        }
        self.inner.available.notify_one();
        self.inner.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(
            conn = conn.id(),
            endpoint = %self.inner.endpoint,
            "dropping dead idle connection"
        );
        conn.close();
        None
    }

    /// Opens a connection into a slot already counted in `total`.
    fn open_reserved(&self) -> ClientResult<PooledConnection> {
        match Connection::open(&self.inner.endpoint, self.inner.config.connect_timeout) {
            Ok(conn) => {
                self.inner.opened.fetch_add(1, Ordering::Relaxed);
                Ok(PooledConnection::new(self.clone(), conn))
            }
            Err(err) => {
                let mut state = self.inner.state.lock();
                state.total = state.total.saturating_sub(1);
                drop(state);
                self.inner.available.notify_one();
                Err(err)
            }
        }
    }

    /// Returns a connection; unhealthy ones are closed and their slot freed.
    ///
    /// Only connections holding a checked-out slot may go back to idle.
    fn release(&self, conn: Connection, healthy: bool) {
        let mut state = self.inner.state.lock();
        let has_slot = state.idle.len() < state.total;
        if healthy && has_slot && conn.is_usable() && !state.closed {
            state.idle.push(conn);
            drop(state);
        } else {
            state.total = state.total.saturating_sub(1);
            drop(state);
            self.inner.discarded.fetch_add(1, Ordering::Relaxed);
            conn.close();
        }
        self.inner.available.notify_one();
    }

    /// Closes every idle connection.
    ///
    /// Used after a transport failure so the retry opens a fresh socket
    /// instead of picking up a sibling of the one that just failed.
    pub fn purge_idle(&self) -> usize {
        let drained = {
            let mut state = self.inner.state.lock();
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        let count = drained.len();
        if count > 0 {
            self.inner
                .discarded
                .fetch_add(count as u64, Ordering::Relaxed);
            self.inner.available.notify_all();
        }
        for conn in drained {
            conn.close();
        }
        count
    }

    /// Closes idle connections unused for longer than `idle_timeout`.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let expired = {
            let mut state = self.inner.state.lock();
            let (expired, kept): (Vec<Connection>, Vec<Connection>) = state
                .idle
                .drain(..)
                .partition(|conn| conn.idle_for(now) >= idle_timeout);
            state.idle = kept;
            state.total = state.total.saturating_sub(expired.len());
            expired
        };

        let count = expired.len();
        if count > 0 {
            self.inner.reaped.fetch_add(count as u64, Ordering::Relaxed);
            self.inner.available.notify_all();
            debug!(endpoint = %self.inner.endpoint, count, "reaped idle connections");
        }
        for conn in expired {
            conn.close();
        }
        count
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            opened: self.inner.opened.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            reaped: self.inner.reaped.load(Ordering::Relaxed),
        }
    }

    /// Closes idle connections and fails all later acquires.
    ///
    /// Checked-out connections are closed when their guards drop.
    pub fn close(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        self.inner.available.notify_all();
        for conn in drained {
            conn.close();
        }
    }
}

/// RAII guard returning a connection to its pool on drop.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Connection>,
    healthy: bool,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            healthy: true,
        }
    }

    /// Runs one request; any failure marks the connection for discard.
    pub fn execute(&mut self, request: &Request, io_timeout: Duration) -> ClientResult<Response> {
        let conn = self.conn.as_mut().ok_or(ClientError::ClientClosed)?;
        let response = conn.execute(request, io_timeout);
        if response.is_err() {
            self.healthy = false;
        }
        response
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, Connection::id)
    }

    /// Closes the connection instead of returning it.
    pub fn discard(mut self) {
        self.healthy = false;
    }

    /// Returns the connection now with an explicit verdict.
    pub fn release(mut self, healthy: bool) {
        self.healthy &= healthy;
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.healthy);
        }
    }
}

// ============================================================================
// Idle reaper
// ============================================================================

struct ReaperSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread that runs a task every `interval` until stopped.
pub struct Reaper;

impl Reaper {
    /// Spawns the thread. The task returns `false` to end the loop on its own.
    pub fn spawn<F>(interval: Duration, mut task: F) -> std::io::Result<ReaperHandle>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        let signal = Arc::new(ReaperSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let join = thread::Builder::new()
            .name("mcr-reaper".to_string())
            .spawn(move || {
                loop {
                    {
                        let mut stopped = thread_signal.stopped.lock();
                        if !*stopped {
                            let _ = thread_signal.wake.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    if !task() {
                        break;
                    }
                }
            })?;

        Ok(ReaperHandle {
            signal,
            join: Some(join),
        })
    }
}

/// Handle that stops the reaper thread; also stops it on drop.
pub struct ReaperHandle {
    signal: Arc<ReaperSignal>,
    join: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Wakes the thread, asks it to exit and waits for it.
    pub fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("idle reaper thread panicked");
            }
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
