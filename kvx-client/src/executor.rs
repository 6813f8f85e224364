//! # Executor
//!
//! Purpose: The uniform borrow-execute-release substrate every command helper
//! and the lock protocol compose over.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Executor` hides pooling and protocol details.
//! 2. **One Connection per Call**: Each call checks out exactly one connection
//!    and gives it back on every exit path.
//! 3. **Two Failure Channels**: The command outcome and the connection-return
//!    outcome are reported separately in `CallOutcome`.
//! 4. **Validate Before I/O**: Bad arguments never touch the pool.

use kvx_common::Profile;
use tracing::warn;

use crate::error::{ClientError, ClientResult};
use crate::health::HealthCheck;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::resp::RespValue;
use crate::script::Script;

/// Result of one pooled call.
///
/// `result` is what the command did; `release` is whether the connection
/// went back to the pool cleanly. Neither implies anything about the other.
#[derive(Debug)]
#[must_use = "a call outcome carries both the command result and the release result"]
pub struct CallOutcome<T> {
    pub result: ClientResult<T>,
    pub release: ClientResult<()>,
}

impl<T> CallOutcome<T> {
    pub fn new(result: ClientResult<T>, release: ClientResult<()>) -> Self {
        CallOutcome { result, release }
    }

    /// Outcome of a call rejected before a connection was borrowed.
    pub fn rejected(err: ClientError) -> Self {
        CallOutcome::new(Err(err), Ok(()))
    }

    /// Decodes the command result, keeping the release channel untouched.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> ClientResult<U>) -> CallOutcome<U> {
        CallOutcome {
            result: self.result.and_then(f),
            release: self.release,
        }
    }

    pub fn into_parts(self) -> (ClientResult<T>, ClientResult<()>) {
        (self.result, self.release)
    }

    /// Yields the command result; a release failure is logged, not returned.
    pub fn into_result(self) -> ClientResult<T> {
        if let Err(err) = &self.release {
            warn!(error = %err, "connection release failed after call");
        }
        self.result
    }
}

/// Pooled command executor.
///
/// Cloning is cheap and shares the underlying pool.
#[derive(Clone)]
pub struct Executor {
    pool: ConnectionPool,
}

impl Executor {
    /// Creates an executor (and its pool) from a validated profile.
    pub fn new(profile: Profile) -> Self {
        Executor {
            pool: ConnectionPool::new(profile),
        }
    }

    /// Creates an executor whose pool vets idle connections with `health`.
    pub fn with_health_check(profile: Profile, health: impl HealthCheck + 'static) -> Self {
        Executor {
            pool: ConnectionPool::with_health_check(profile, health),
        }
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: ConnectionPool) -> Self {
        Executor { pool }
    }

    pub fn profile(&self) -> &Profile {
        self.pool.profile()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Issues one command on a borrowed connection.
    ///
    /// Backend error replies come back as `ClientError::Server`.
    pub fn execute(&self, command: &str, args: &[&[u8]]) -> CallOutcome<RespValue> {
        if command.trim().is_empty() {
            return CallOutcome::rejected(ClientError::invalid("command name can't be empty"));
        }
        self.with_connection(|conn| conn.exec(command.as_bytes(), args)?.into_result())
    }

    /// Runs a server-side script on a borrowed connection.
    ///
    /// `args` holds the script's keys followed by its extra arguments; it must
    /// be non-empty and contain at least `script.key_count()` entries.
    pub fn script(&self, script: &Script, args: &[&[u8]]) -> CallOutcome<RespValue> {
        if args.is_empty() {
            return CallOutcome::rejected(ClientError::invalid("script args can't be empty"));
        }
        if args.len() < script.key_count() {
            return CallOutcome::rejected(ClientError::invalid(format!(
                "script expects {} keys but got {} args",
                script.key_count(),
                args.len()
            )));
        }
        self.with_connection(|conn| script.invoke(conn, args))
    }

    /// Borrows one connection, runs `f`, and returns the connection whatever
    /// `f` produced.
    ///
    /// If `f` panics, the drop guard returns the connection; a panic in the
    /// middle of an exchange leaves it marked broken, so it is closed.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut PooledConnection) -> ClientResult<T>,
    ) -> CallOutcome<T> {
        let mut conn = match self.pool.get() {
            Ok(conn) => conn,
            Err(err) => return CallOutcome::rejected(err),
        };
        let result = f(&mut conn);
        let release = conn.release();
        CallOutcome::new(result, release)
    }
}
