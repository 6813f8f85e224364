//! # Connection Profile
//!
//! Purpose: Turn loosely-typed external configuration (a string map or a
//! deserialized document) into one immutable, validated description of the
//! backend endpoint and the pool that talks to it.
//!
//! ## Design Principles
//! 1. **Single Validating Factory**: `Profile::from_fields` is the only way to
//!    build a profile; every invariant is checked there, once.
//! 2. **Immutable Value**: A profile never changes after construction, so it
//!    can be shared freely between threads without locking.
//! 3. **Zero Means Unset**: Timeouts and limits use 0 for "not configured",
//!    mirroring the key/value configuration surface.
//! 4. **Redacted Output**: `Debug` and `Display` never print the password.

use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasher;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ProfileError, ProfileResult};

pub const PROFILE_HOST: &str = "host";
pub const PROFILE_PROTO: &str = "proto";
pub const PROFILE_PORT: &str = "port";
pub const PROFILE_PASSWORD: &str = "password";
pub const PROFILE_DATABASE: &str = "database";
pub const PROFILE_CONNECT_TIMEOUT: &str = "connect_timeout";
pub const PROFILE_READ_TIMEOUT: &str = "read_timeout";
pub const PROFILE_WRITE_TIMEOUT: &str = "write_timeout";
pub const PROFILE_MAX_ACTIVE: &str = "max_active";
pub const PROFILE_MAX_IDLE: &str = "max_idle";
pub const PROFILE_MAX_CONN_LIFETIME: &str = "max_conn_lifetime";
pub const PROFILE_IDLE_TIMEOUT: &str = "idle_timeout";
pub const PROFILE_WAIT: &str = "wait";

/// Transport used when `proto` is not configured.
pub const DEFAULT_PROTO: Transport = Transport::Tcp;

/// Backend port used when `port` is not configured (or set to 0).
pub const DEFAULT_PORT: u16 = 6379;

const REDACTED: &str = "******";

/// Stream transport used to reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TCP; the address is `host:port`.
    Tcp,
    /// Unix domain socket; `host` is the socket path and `port` is unused.
    /// The connect timeout does not apply; read and write timeouts do.
    Unix,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Unix => "unix",
        }
    }
}

impl FromStr for Transport {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "unix" => Ok(Transport::Unix),
            other => Err(ProfileError::UnsupportedProto(other.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw, unvalidated profile fields.
///
/// Numeric fields are signed so that out-of-range configuration is reported
/// as a validation error instead of a parse failure. Durations are in
/// milliseconds. Missing fields deserialize to their zero value.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProfileFields {
    pub host: String,
    pub proto: String,
    pub port: i64,
    pub password: String,
    pub database: i64,
    pub connect_timeout: i64,
    pub read_timeout: i64,
    pub write_timeout: i64,
    pub max_active: i64,
    pub max_idle: i64,
    pub max_conn_lifetime: i64,
    pub idle_timeout: i64,
    pub wait: bool,
}

impl fmt::Debug for ProfileFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileFields")
            .field("host", &self.host)
            .field("proto", &self.proto)
            .field("port", &self.port)
            .field("password", &redact(!self.password.is_empty()))
            .field("database", &self.database)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("max_active", &self.max_active)
            .field("max_idle", &self.max_idle)
            .field("max_conn_lifetime", &self.max_conn_lifetime)
            .field("idle_timeout", &self.idle_timeout)
            .field("wait", &self.wait)
            .finish()
    }
}

impl ProfileFields {
    /// Parses the recognized keys out of a string map.
    ///
    /// Unknown keys are ignored; empty values count as absent.
    pub fn from_map<S: BuildHasher>(data: &HashMap<String, String, S>) -> ProfileResult<Self> {
        let text = |key: &'static str| data.get(key).map(String::as_str).unwrap_or("");

        Ok(ProfileFields {
            host: text(PROFILE_HOST).to_string(),
            proto: text(PROFILE_PROTO).to_string(),
            port: parse_int(PROFILE_PORT, text(PROFILE_PORT))?,
            password: text(PROFILE_PASSWORD).to_string(),
            database: parse_int(PROFILE_DATABASE, text(PROFILE_DATABASE))?,
            connect_timeout: parse_int(PROFILE_CONNECT_TIMEOUT, text(PROFILE_CONNECT_TIMEOUT))?,
            read_timeout: parse_int(PROFILE_READ_TIMEOUT, text(PROFILE_READ_TIMEOUT))?,
            write_timeout: parse_int(PROFILE_WRITE_TIMEOUT, text(PROFILE_WRITE_TIMEOUT))?,
            max_active: parse_int(PROFILE_MAX_ACTIVE, text(PROFILE_MAX_ACTIVE))?,
            max_idle: parse_int(PROFILE_MAX_IDLE, text(PROFILE_MAX_IDLE))?,
            max_conn_lifetime: parse_int(
                PROFILE_MAX_CONN_LIFETIME,
                text(PROFILE_MAX_CONN_LIFETIME),
            )?,
            idle_timeout: parse_int(PROFILE_IDLE_TIMEOUT, text(PROFILE_IDLE_TIMEOUT))?,
            wait: parse_bool(PROFILE_WAIT, text(PROFILE_WAIT))?,
        })
    }
}

/// Validated, immutable connection profile.
#[derive(Clone, PartialEq, Eq)]
pub struct Profile {
    host: String,
    proto: Transport,
    port: u16,
    password: Option<String>,
    database: u32,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_active: Option<usize>,
    max_idle: usize,
    max_conn_lifetime: Option<Duration>,
    idle_timeout: Option<Duration>,
    wait: bool,
}

impl Profile {
    /// Builds a profile from a loosely-typed string map.
    pub fn from_map<S: BuildHasher>(data: &HashMap<String, String, S>) -> ProfileResult<Self> {
        Self::from_fields(ProfileFields::from_map(data)?)
    }

    /// Validates raw fields and applies defaults.
    pub fn from_fields(fields: ProfileFields) -> ProfileResult<Self> {
        let host = fields.host.trim();
        if host.is_empty() {
            return Err(ProfileError::MissingHost);
        }

        let proto = match fields.proto.trim() {
            "" => DEFAULT_PROTO,
            other => other.parse()?,
        };

        let port = match non_negative("port", fields.port)? {
            0 => DEFAULT_PORT,
            port => u16::try_from(port).map_err(|_| ProfileError::OutOfRange {
                field: "port",
                value: fields.port,
            })?,
        };

        let database = u32::try_from(non_negative("database", fields.database)?).map_err(|_| {
            ProfileError::OutOfRange {
                field: "database",
                value: fields.database,
            }
        })?;

        let connect_timeout = millis("connect timeout", fields.connect_timeout)?;
        let read_timeout = millis("read timeout", fields.read_timeout)?;
        let write_timeout = millis("write timeout", fields.write_timeout)?;
        let max_conn_lifetime = millis("max conn lifetime", fields.max_conn_lifetime)?;
        let idle_timeout = millis("idle timeout", fields.idle_timeout)?;

        let max_active = count("max active", fields.max_active)?;
        let max_idle = count("max idle", fields.max_idle)?;
        if max_idle > 0 && max_active > 0 && max_idle > max_active {
            return Err(ProfileError::IdleExceedsActive {
                max_idle,
                max_active,
            });
        }

        Ok(Profile {
            host: host.to_string(),
            proto,
            port,
            password: Some(fields.password).filter(|p| !p.is_empty()),
            database,
            connect_timeout,
            read_timeout,
            write_timeout,
            max_active: Some(max_active).filter(|n| *n > 0),
            max_idle,
            max_conn_lifetime,
            idle_timeout,
            wait: fields.wait,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn proto(&self) -> Transport {
        self.proto
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn database(&self) -> u32 {
        self.database
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Ceiling on open connections; `None` means unbounded.
    pub fn max_active(&self) -> Option<usize> {
        self.max_active
    }

    /// Number of idle connections retained; 0 keeps none.
    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    pub fn max_conn_lifetime(&self) -> Option<Duration> {
        self.max_conn_lifetime
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Whether a borrow blocks (rather than failing) when the pool is full.
    pub fn wait(&self) -> bool {
        self.wait
    }

    /// Dial address: `host:port` for TCP, the socket path for Unix.
    pub fn address(&self) -> String {
        match self.proto {
            Transport::Tcp => format!("{}:{}", self.host, self.port),
            Transport::Unix => self.host.clone(),
        }
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("host", &self.host)
            .field("proto", &self.proto)
            .field("port", &self.port)
            .field("password", &redact(self.password.is_some()))
            .field("database", &self.database)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("max_active", &self.max_active)
            .field("max_idle", &self.max_idle)
            .field("max_conn_lifetime", &self.max_conn_lifetime)
            .field("idle_timeout", &self.idle_timeout)
            .field("wait", &self.wait)
            .finish()
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{} (max_active={}, max_idle={}, wait={})",
            self.proto,
            self.address(),
            self.database,
            self.max_active
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
            self.max_idle,
            self.wait
        )?;
        if self.password.is_some() {
            write!(f, " auth={}", REDACTED)?;
        }
        Ok(())
    }
}

impl TryFrom<ProfileFields> for Profile {
    type Error = ProfileError;

    fn try_from(fields: ProfileFields) -> Result<Self, Self::Error> {
        Profile::from_fields(fields)
    }
}

fn redact(present: bool) -> &'static str {
    if present {
        REDACTED
    } else {
        ""
    }
}

fn parse_int(key: &'static str, raw: &str) -> ProfileResult<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse::<i64>().map_err(|err| ProfileError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

// Accepts the usual spellings: 1/t/T/true/TRUE/True and their false forms.
fn parse_bool(key: &'static str, raw: &str) -> ProfileResult<bool> {
    match raw.trim() {
        "" => Ok(false),
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(ProfileError::InvalidValue {
            key,
            value: other.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn non_negative(field: &'static str, value: i64) -> ProfileResult<u64> {
    u64::try_from(value).map_err(|_| ProfileError::Negative { field })
}

fn millis(field: &'static str, value: i64) -> ProfileResult<Option<Duration>> {
    let ms = non_negative(field, value)?;
    Ok(Some(Duration::from_millis(ms)).filter(|d| !d.is_zero()))
}

fn count(field: &'static str, value: i64) -> ProfileResult<usize> {
    usize::try_from(non_negative(field, value)?)
        .map_err(|_| ProfileError::OutOfRange { field, value })
}
