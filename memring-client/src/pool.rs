//! # Connection Pool
//!
//! Purpose: Reuse TCP connections to one cache node so concurrent callers
//! share a bounded set of sessions instead of reconnecting per call.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A bounded set of reusable connections per node.
//! 2. **Minimal Locking**: The mutex guards pool metadata only and is never
//!    held during network I/O.
//! 3. **Bounded Waits**: A saturated pool blocks `acquire` on a condition
//!    variable up to the configured timeout, then fails.
//! 4. **Broken Means Gone**: A connection that saw an I/O or protocol error
//!    is destroyed, never returned to the idle set.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use memring_proto::{Command, Response};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};

struct IdleConn {
    conn: Connection,
    parked_at: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConn>,
    total: usize,
}

struct PoolInner {
    addr: String,
    config: Arc<ClientConfig>,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Pool handle for one node. Cloning shares the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool for `addr`. Connections are opened lazily.
    pub fn new(addr: impl Into<String>, config: Arc<ClientConfig>) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                addr: addr.into(),
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Node address this pool connects to.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Acquires a connection, blocking up to the configured acquire timeout
    /// when the pool is saturated.
    pub fn acquire(&self) -> Result<PooledConnection> {
        let deadline = Instant::now() + self.inner.config.pool.acquire_timeout;
        let mut state = self.inner.state.lock();

        loop {
            sweep_locked(&self.inner, &mut state);

            if let Some(idle) = state.idle.pop_front() {
                return Ok(PooledConnection::new(self.inner.clone(), idle.conn));
            }

            if state.total < self.inner.config.pool.max_total {
                state.total += 1;
                drop(state);
                return match Connection::open(&self.inner.addr, &self.inner.config) {
                    Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
                    Err(err) => {
                        release_slot(&self.inner);
                        Err(err)
                    }
                };
            }

            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(Error::PoolExhausted {
                    addr: self.inner.addr.clone(),
                });
            }
        }
    }

    /// Closes idle connections beyond `min_idle` whose idle age exceeds the
    /// configured idle timeout.
    pub fn sweep(&self) {
        let mut state = self.inner.state.lock();
        sweep_locked(&self.inner, &mut state);
    }

    /// Closes all idle connections. In-use connections close when their
    /// holders drop them.
    pub fn close(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            let drained = state.idle.len();
            state.total -= drained;
            state.idle.clear();
            drained
        };
        if drained > 0 {
            debug!(addr = %self.inner.addr, drained, "closed idle connections");
            self.inner.available.notify_all();
        }
    }

    /// Connections currently open, idle plus in-use.
    pub fn total_connections(&self) -> usize {
        self.inner.state.lock().total
    }

    /// Connections currently parked idle.
    pub fn idle_connections(&self) -> usize {
        self.inner.state.lock().idle.len()
    }
}

fn sweep_locked(inner: &PoolInner, state: &mut PoolState) {
    let opts = &inner.config.pool;
    while state.idle.len() > opts.min_idle {
        match state.idle.front() {
            Some(front) if front.parked_at.elapsed() >= opts.idle_timeout => {
                state.idle.pop_front();
                state.total -= 1;
                debug!(addr = %inner.addr, "reaped idle connection");
            }
            _ => break,
        }
    }
}

fn release_slot(inner: &PoolInner) {
    let mut state = inner.state.lock();
    state.total = state.total.saturating_sub(1);
    drop(state);
    inner.available.notify_one();
}

fn return_connection(inner: &PoolInner, conn: Connection) {
    let mut state = inner.state.lock();
    state.idle.push_back(IdleConn {
        conn,
        parked_at: Instant::now(),
    });
    drop(state);
    inner.available.notify_one();
}

/// RAII guard over one pooled connection.
///
/// Dropping the guard returns the connection to the idle set, unless an
/// exchange failed or `invalidate` was called, in which case the connection
/// is destroyed and its pool slot freed.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    broken: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            broken: false,
        }
    }

    /// Executes one command on the held connection.
    pub fn round_trip(&mut self, cmd: &Command<'_>) -> Result<Response> {
        let conn = self.conn.as_mut().expect("connection present until drop");
        let result = conn.round_trip(cmd);
        if result.is_err() {
            // Stream state is indeterminate after a failure mid-exchange.
            self.broken = true;
        }
        result
    }

    /// Executes a batch of commands, reading replies in order.
    pub fn round_trip_batch(&mut self, cmds: &[Command<'_>]) -> Result<Vec<Response>> {
        let conn = self.conn.as_mut().expect("connection present until drop");
        let result = conn.round_trip_batch(cmds);
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Marks the connection broken so it is destroyed instead of pooled.
    pub fn invalidate(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.broken {
            drop(conn);
            release_slot(&self.pool);
        } else {
            return_connection(&self.pool, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    // A listener that never accepts still completes handshakes through the
    // TCP backlog, which is all these tests need.
    fn pool_with_listener(pool_opts: PoolOptions) -> (ConnectionPool, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut config = ClientConfig::new([addr.clone()]);
        config.pool = pool_opts;
        config.connect_timeout = Duration::from_millis(500);
        (ConnectionPool::new(addr, Arc::new(config)), listener)
    }

    #[test]
    fn acquire_reuses_idle_connection() {
        let (pool, _listener) = pool_with_listener(PoolOptions::default());

        let guard = pool.acquire().unwrap();
        assert_eq!(pool.total_connections(), 1);
        drop(guard);
        assert_eq!(pool.idle_connections(), 1);

        let _guard = pool.acquire().unwrap();
        assert_eq!(pool.total_connections(), 1);
        assert_eq!(pool.idle_connections(), 0);
    }

    #[test]
    fn saturated_pool_times_out() {
        let (pool, _listener) = pool_with_listener(PoolOptions {
            max_total: 1,
            min_idle: 0,
            acquire_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(60),
        });

        let _held = pool.acquire().unwrap();
        let start = Instant::now();
        match pool.acquire() {
            Err(Error::PoolExhausted { .. }) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let (pool, _listener) = pool_with_listener(PoolOptions {
            max_total: 1,
            min_idle: 0,
            acquire_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
        });

        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|_| ()))
        };

        thread::sleep(Duration::from_millis(100));
        drop(held);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn invalidated_connection_is_destroyed() {
        let (pool, _listener) = pool_with_listener(PoolOptions::default());

        let mut guard = pool.acquire().unwrap();
        guard.invalidate();
        drop(guard);

        assert_eq!(pool.total_connections(), 0);
        assert_eq!(pool.idle_connections(), 0);
    }

    #[test]
    fn sweep_reaps_aged_idle_connections() {
        let (pool, _listener) = pool_with_listener(PoolOptions {
            max_total: 4,
            min_idle: 0,
            acquire_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_millis(50),
        });

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_connections(), 2);

        thread::sleep(Duration::from_millis(80));
        pool.sweep();
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.total_connections(), 0);
    }

    #[test]
    fn sweep_keeps_min_idle() {
        let (pool, _listener) = pool_with_listener(PoolOptions {
            max_total: 4,
            min_idle: 1,
            acquire_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_millis(50),
        });

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        drop(a);
        drop(b);

        thread::sleep(Duration::from_millis(80));
        pool.sweep();
        assert_eq!(pool.idle_connections(), 1);
        assert_eq!(pool.total_connections(), 1);
    }

    #[test]
    fn close_drains_idle() {
        let (pool, _listener) = pool_with_listener(PoolOptions::default());

        let guard = pool.acquire().unwrap();
        drop(guard);
        assert_eq!(pool.idle_connections(), 1);

        pool.close();
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.total_connections(), 0);
    }

    #[test]
    fn concurrent_holders_stay_bounded() {
        let max_total = 4;
        let (pool, _listener) = pool_with_listener(PoolOptions {
            max_total,
            min_idle: 0,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        });

        let held = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            let held = held.clone();
            let peak = peak.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..20 {
                    let guard = pool.acquire().unwrap();
                    let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    held.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= max_total);
        assert!(pool.total_connections() <= max_total);
        assert_eq!(
            pool.total_connections(),
            pool.idle_connections(),
            "no connection may remain in use"
        );
    }
}
