//! # Connection Pool
//!
//! Purpose: Reuse backend connections across calls while enforcing the
//! profile's sizing and recycling limits.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections,
//!    dialing lazily on the first borrow that finds nothing idle.
//! 2. **Minimal Locking**: One mutex serializes bookkeeping; dialing, health
//!    checks and closing run with the lock released.
//! 3. **LIFO Reuse**: The most recently returned connection is handed out
//!    first, so cold connections age out at the back of the idle list.
//! 4. **RAII Return**: `PooledConnection` goes back to the pool on drop, so
//!    no exit path can leak a checked-out connection.
//!
//! ## Lifecycle
//!
//! ```text
//! get() ──> idle? ──yes──> stale / unhealthy? ──yes──> close, retry
//!   │          │                  └─no──> hand out
//!   │          └─no──> below max_active? ──yes──> dial, hand out
//!   │                          └─no──> wait? ──yes──> park on condvar
//!   │                                    └─no──> PoolExhausted
//! release() ──> reusable && !closed && young? ──> idle (trim to max_idle)
//!                                  └─otherwise──> close
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use kvx_common::Profile;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::conn::Connection;
use crate::error::{ClientError, ClientResult};
use crate::health::{AcceptAll, HealthCheck};
use crate::resp::RespValue;

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently open (idle + in use).
    pub open: usize,
    /// Connections parked in the idle list.
    pub idle: usize,
    /// Connections checked out by callers.
    pub in_use: usize,
}

struct IdleConnection {
    conn: Connection,
    returned_at: Instant,
}

struct PoolState {
    // Front holds the most recently returned connection.
    idle: VecDeque<IdleConnection>,
    open: usize,
    closed: bool,
}

impl PoolState {
    /// Pops idle connections that outlived the idle timeout.
    fn take_stale(&mut self, profile: &Profile, now: Instant) -> Vec<Connection> {
        let mut stale = Vec::new();
        let Some(timeout) = profile.idle_timeout() else {
            return stale;
        };
        while self
            .idle
            .back()
            .is_some_and(|idle| now.saturating_duration_since(idle.returned_at) >= timeout)
        {
            if let Some(idle) = self.idle.pop_back() {
                stale.push(idle.conn);
            }
        }
        self.open = self.open.saturating_sub(stale.len());
        stale
    }
}

struct PoolInner {
    profile: Profile,
    health: Box<dyn HealthCheck>,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Connection pool handle. Cloning shares the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool that accepts every idle connection on borrow.
    pub fn new(profile: Profile) -> Self {
        Self::with_health_check(profile, AcceptAll)
    }

    /// Creates a pool that runs `health` against idle connections on borrow.
    pub fn with_health_check(profile: Profile, health: impl HealthCheck + 'static) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(profile.max_idle()),
            open: 0,
            closed: false,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                profile,
                health: Box::new(health),
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.inner.profile
    }

    /// Borrows a connection, dialing one when nothing usable is idle.
    ///
    /// Blocks while the pool is full if the profile enables `wait`; otherwise
    /// fails with `PoolExhausted`.
    pub fn get(&self) -> ClientResult<PooledConnection> {
        let inner = &*self.inner;
        let profile = &inner.profile;
        let mut state = inner.state.lock();

        loop {
            if state.closed {
                return Err(ClientError::PoolClosed);
            }

            let stale = state.take_stale(profile, Instant::now());
            if !stale.is_empty() {
                MutexGuard::unlocked(&mut state, || {
                    for conn in stale {
                        discard(conn, "idle timeout exceeded");
                    }
                });
                inner.available.notify_all();
                continue;
            }

            if let Some(IdleConnection {
                mut conn,
                returned_at,
            }) = state.idle.pop_front()
            {
                let verdict = if profile
                    .max_conn_lifetime()
                    .is_some_and(|max| conn.age() >= max)
                {
                    Err("max connection lifetime exceeded")
                } else {
                    MutexGuard::unlocked(&mut state, || inner.health.check(&mut conn, returned_at))
                        .map_err(|err| {
                            debug!(error = %err, "idle connection failed health check");
                            "health check failed"
                        })
                };

                match verdict {
                    Ok(()) => return Ok(PooledConnection::new(self.clone(), conn)),
                    Err(reason) => {
                        state.open = state.open.saturating_sub(1);
                        MutexGuard::unlocked(&mut state, || discard(conn, reason));
                        inner.available.notify_one();
                        continue;
                    }
                }
            }

            if profile.max_active().map_or(true, |max| state.open < max) {
                state.open += 1;
                drop(state);
                return match Connection::dial(profile) {
                    Ok(conn) => Ok(PooledConnection::new(self.clone(), conn)),
                    Err(err) => {
                        self.release_slot();
                        Err(err)
                    }
                };
            }

            if !profile.wait() {
                return Err(ClientError::PoolExhausted);
            }
            inner.available.wait(&mut state);
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            in_use: state.open.saturating_sub(state.idle.len()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Shuts the pool down.
    ///
    /// Idle connections are closed now, blocked borrowers wake up with
    /// `PoolClosed`, and connections still checked out are closed when they
    /// come back. Returns the first close failure, after closing them all.
    pub fn close(&self) -> ClientResult<()> {
        let idle: Vec<IdleConnection> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.open = state.open.saturating_sub(idle.len());
            idle
        };
        self.inner.available.notify_all();
        debug!(closed = idle.len(), "connection pool closed");

        let mut first_err = None;
        for idle in idle {
            if let Err(err) = idle.conn.close() {
                warn!(error = %err, "failed to close idle connection during shutdown");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(ClientError::Io(err)),
            None => Ok(()),
        }
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.open = state.open.saturating_sub(1);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Takes a connection back; the error reports a failed close, if any.
    fn put(&self, conn: Connection, reusable: bool) -> ClientResult<()> {
        let inner = &*self.inner;
        let profile = &inner.profile;
        let expired = profile
            .max_conn_lifetime()
            .is_some_and(|max| conn.age() >= max);

        let mut state = inner.state.lock();
        let evicted = if reusable && !expired && !state.closed {
            state.idle.push_front(IdleConnection {
                conn,
                returned_at: Instant::now(),
            });
            if state.idle.len() > profile.max_idle() {
                state.idle.pop_back().map(|idle| idle.conn)
            } else {
                None
            }
        } else {
            Some(conn)
        };

        if evicted.is_some() {
            state.open = state.open.saturating_sub(1);
            drop(state);
            // A slot and possibly an idle connection both became available.
            inner.available.notify_all();
        } else {
            drop(state);
            inner.available.notify_one();
        }

        match evicted {
            Some(conn) => conn.close().map_err(ClientError::from),
            None => Ok(()),
        }
    }
}

fn discard(conn: Connection, reason: &'static str) {
    debug!(reason, "discarding pooled connection");
    if let Err(err) = conn.close() {
        warn!(error = %err, reason, "failed to close discarded connection");
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Connection>,
    broken: bool,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            broken: false,
        }
    }

    /// Executes one command and returns the raw reply.
    ///
    /// A transport or framing failure (or a panic mid-call) marks the
    /// connection broken so it is closed instead of recycled.
    pub fn exec(&mut self, command: &[u8], args: &[&[u8]]) -> ClientResult<RespValue> {
        let conn = self
            .conn
            .as_mut()
            .ok_or(ClientError::Protocol("connection already released"))?;

        let was_broken = self.broken;
        self.broken = true;
        let response = conn.exec(command, args);
        let fatal = matches!(&response, Err(err) if err.is_connection_fatal());
        self.broken = was_broken || fatal;
        response
    }

    /// Forces the connection to be closed rather than recycled.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Returns the connection to the pool, reporting a failed close.
    pub fn release(mut self) -> ClientResult<()> {
        match self.conn.take() {
            Some(conn) => self.pool.put(conn, !self.broken),
            None => Ok(()),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.pool.put(conn, !self.broken) {
                warn!(error = %err, "failed to close connection returned on drop");
            }
        }
    }
}
