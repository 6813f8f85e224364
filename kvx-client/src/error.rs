//! # Client Errors
//!
//! One error type for everything below the lock protocol: validation, pool
//! state, transport and backend replies. Lock contention is deliberately not
//! represented here; it is an ordinary outcome of `acquire_lock`.

use std::io;

use kvx_common::ProfileError;
use thiserror::Error;

/// Result type for the pooled client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the pooled client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while dialing, reading, writing or closing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Backend returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Reply type did not match what the command returns.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Pool is at capacity, no idle connection is available and waiting is disabled.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Pool was shut down.
    #[error("connection pool closed")]
    PoolClosed,
    /// Address did not resolve to any socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Caller-supplied argument rejected before any network interaction.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Profile validation failed.
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl ClientError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ClientError::InvalidArgument(message.into())
    }

    /// True when the backend does not have the requested script cached.
    pub fn is_noscript(&self) -> bool {
        matches!(self, ClientError::Server { message } if message.starts_with(b"NOSCRIPT"))
    }

    /// True when the connection that produced this error must not be reused.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Protocol(_))
    }
}
