//! # Borrow-Time Health Checks
//!
//! Policies deciding whether an idle connection may be handed out again.
//! They run only for idle connections, never for freshly dialed ones.

use std::time::{Duration, Instant};

use crate::conn::Connection;
use crate::error::{ClientError, ClientResult};

/// Decides whether an idle connection is still usable.
///
/// `last_used` is the instant the connection was returned to the pool. An
/// `Err` makes the pool close the connection and try the next one.
pub trait HealthCheck: Send + Sync {
    fn check(&self, conn: &mut Connection, last_used: Instant) -> ClientResult<()>;
}

impl<F> HealthCheck for F
where
    F: Fn(&mut Connection, Instant) -> ClientResult<()> + Send + Sync,
{
    fn check(&self, conn: &mut Connection, last_used: Instant) -> ClientResult<()> {
        self(conn, last_used)
    }
}

/// Accepts every idle connection. Default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl HealthCheck for AcceptAll {
    fn check(&self, _conn: &mut Connection, _last_used: Instant) -> ClientResult<()> {
        Ok(())
    }
}

/// PINGs connections that sat idle for at least `min_idle`.
#[derive(Debug, Clone, Copy)]
pub struct PingCheck {
    min_idle: Duration,
}

impl PingCheck {
    pub fn new(min_idle: Duration) -> Self {
        PingCheck { min_idle }
    }
}

impl HealthCheck for PingCheck {
    fn check(&self, conn: &mut Connection, last_used: Instant) -> ClientResult<()> {
        if last_used.elapsed() < self.min_idle {
            return Ok(());
        }
        match conn.exec(b"PING", &[])?.into_result()? {
            crate::resp::RespValue::Simple(text) if text == b"PONG" => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}
