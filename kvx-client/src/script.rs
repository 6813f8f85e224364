//! # Server-Side Scripts
//!
//! A Lua script sent by digest (EVALSHA) first and by full source (EVAL) only
//! when the backend reports it has not cached the script yet.

use std::borrow::Cow;
use std::sync::OnceLock;

use sha1::{Digest, Sha1};

use crate::error::ClientResult;
use crate::pool::PooledConnection;
use crate::resp::RespValue;

/// Handle to a server-side script.
#[derive(Debug)]
pub struct Script {
    key_count: usize,
    source: Cow<'static, str>,
    digest: OnceLock<String>,
}

impl Script {
    /// Creates a script from static source; usable in `static` items.
    pub const fn new(key_count: usize, source: &'static str) -> Self {
        Script {
            key_count,
            source: Cow::Borrowed(source),
            digest: OnceLock::new(),
        }
    }

    /// Creates a script from owned source.
    pub fn from_source(key_count: usize, source: impl Into<String>) -> Self {
        Script {
            key_count,
            source: Cow::Owned(source.into()),
            digest: OnceLock::new(),
        }
    }

    /// Number of leading arguments passed as KEYS.
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Hex SHA-1 of the source, as the backend indexes it.
    pub fn digest(&self) -> &str {
        self.digest
            .get_or_init(|| hex::encode(Sha1::digest(self.source.as_bytes())))
    }

    /// Runs the script on `conn`; `args` is keys followed by extra arguments.
    ///
    /// Error replies come back as `ClientError::Server`.
    pub fn invoke(&self, conn: &mut PooledConnection, args: &[&[u8]]) -> ClientResult<RespValue> {
        let key_count = self.key_count.to_string();

        let mut call: Vec<&[u8]> = Vec::with_capacity(args.len() + 2);
        call.push(self.digest().as_bytes());
        call.push(key_count.as_bytes());
        call.extend_from_slice(args);

        match conn.exec(b"EVALSHA", &call)?.into_result() {
            Err(err) if err.is_noscript() => {
                call[0] = self.source.as_bytes();
                conn.exec(b"EVAL", &call)?.into_result()
            }
            other => other,
        }
    }
}
