//! # KVX Pooled Client
//!
//! Purpose: Provide a typed, synchronous access layer over a RESP2 key-value
//! backend, with connection pooling and a distributed lock.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections to avoid repeated connects.
//! 2. **Borrow-Execute-Release**: Every call holds exactly one connection and
//!    always gives it back.
//! 3. **Separate Failure Channels**: Command failures and connection-return
//!    failures are reported independently.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::HashMap;
//!
//! use kvx_client::{Acquire, Executor, Release};
//! use kvx_common::Profile;
//!
//! let mut config = HashMap::new();
//! config.insert("host".to_string(), "127.0.0.1".to_string());
//! config.insert("max_active".to_string(), "8".to_string());
//! config.insert("wait".to_string(), "true".to_string());
//!
//! let executor = Executor::new(Profile::from_map(&config).unwrap());
//! if executor.acquire_lock("job:42", "uuid-A", 30).into_result().unwrap() == Acquire::Acquired {
//!     // critical section
//!     let released = executor.release_lock("job:42", "uuid-A").into_result().unwrap();
//!     assert_eq!(released, Release::Released);
//! }
//! ```

mod commands;
mod conn;
mod error;
mod executor;
mod health;
mod lock;
mod pool;
mod resp;
mod script;

pub use commands::KeyTtl;
pub use conn::Connection;
pub use error::{ClientError, ClientResult};
pub use executor::{CallOutcome, Executor};
pub use health::{AcceptAll, HealthCheck, PingCheck};
pub use lock::{Acquire, Release, UNLOCK_SCRIPT_SOURCE};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use resp::RespValue;
pub use script::Script;
