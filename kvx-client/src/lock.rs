//! # Distributed Lock
//!
//! Purpose: Mutual exclusion across independent processes sharing one
//! backend, using two single-round-trip operations.
//!
//! ## Protocol
//!
//! ```text
//! Unlocked --acquire(name, token, ttl)--> Locked(token)
//! Locked(token) --release(name, token)--> Unlocked
//! Locked(token) --ttl elapses-----------> Unlocked
//! ```
//!
//! - Acquire is `SET name token EX ttl NX`: set, expiry and existence check
//!   happen in one backend operation.
//! - Release is a compare-and-delete script, so a lock that expired and was
//!   re-acquired by another token is never deleted by the old holder.
//! - Locks are never renewed here, and token uniqueness belongs to the caller.

use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::executor::{CallOutcome, Executor};
use crate::resp::RespValue;
use crate::script::Script;

/// Compare-and-delete: removes KEYS[1] only while it still holds ARGV[1].
pub const UNLOCK_SCRIPT_SOURCE: &str = r#"if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end"#;

static UNLOCK_SCRIPT: Script = Script::new(1, UNLOCK_SCRIPT_SOURCE);

/// Outcome of a lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The caller now holds the lock until the TTL elapses or it releases it.
    Acquired,
    /// Another token holds the lock; nothing was changed.
    Held,
}

impl Acquire {
    pub fn is_acquired(self) -> bool {
        self == Acquire::Acquired
    }
}

/// Outcome of a lock release. Both variants are successful releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The record held this token and was deleted.
    Released,
    /// Nothing to delete: expired, held by another token, or already released.
    NotHeld,
}

fn validate(name: &str, token: &str) -> ClientResult<()> {
    if name.is_empty() {
        return Err(ClientError::invalid("lock name can't be empty"));
    }
    if token.is_empty() {
        return Err(ClientError::invalid("lock token can't be empty"));
    }
    Ok(())
}

fn decode_acquire(reply: RespValue) -> ClientResult<Acquire> {
    match reply {
        reply if reply.is_ok() => Ok(Acquire::Acquired),
        RespValue::Nil => Ok(Acquire::Held),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn decode_release(reply: RespValue) -> ClientResult<Release> {
    match reply.into_integer()? {
        0 => Ok(Release::NotHeld),
        1 => Ok(Release::Released),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

impl Executor {
    /// Tries to take the lock `name` for `ttl_seconds`, proving ownership with `token`.
    ///
    /// `Acquire::Held` is an ordinary outcome, not an error.
    pub fn acquire_lock(&self, name: &str, token: &str, ttl_seconds: u64) -> CallOutcome<Acquire> {
        if let Err(err) = validate(name, token) {
            return CallOutcome::rejected(err);
        }
        if ttl_seconds == 0 {
            return CallOutcome::rejected(ClientError::invalid("lock ttl must be greater than 0"));
        }

        let ttl = ttl_seconds.to_string();
        let outcome = self
            .execute(
                "SET",
                &[name.as_bytes(), token.as_bytes(), b"EX", ttl.as_bytes(), b"NX"],
            )
            .and_then(decode_acquire);
        if let Ok(state) = &outcome.result {
            debug!(lock = name, ttl_seconds, ?state, "lock acquire");
        }
        outcome
    }

    /// Releases `name` if, and only if, it is still held by `token`.
    pub fn release_lock(&self, name: &str, token: &str) -> CallOutcome<Release> {
        if let Err(err) = validate(name, token) {
            return CallOutcome::rejected(err);
        }

        let outcome = self
            .script(&UNLOCK_SCRIPT, &[name.as_bytes(), token.as_bytes()])
            .and_then(decode_release);
        if let Ok(state) = &outcome.result {
            debug!(lock = name, ?state, "lock release");
        }
        outcome
    }
}
