//! # Profile Errors
//!
//! Validation failures raised while turning external configuration into a
//! `Profile`. Construction is all-or-nothing: any of these aborts it.

use thiserror::Error;

/// Result type for profile construction.
pub type ProfileResult<T> = Result<T, ProfileError>;

/// Errors surfaced while building a connection profile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    /// `host` was missing or blank.
    #[error("host can't be empty")]
    MissingHost,
    /// `proto` names a transport the client cannot dial.
    #[error("unsupported proto '{0}'")]
    UnsupportedProto(String),
    /// A raw string value could not be parsed.
    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    /// A numeric field was negative.
    #[error("{field} can't be less than 0")]
    Negative { field: &'static str },
    /// A numeric field does not fit the range of its target type.
    #[error("{field} value {value} is out of range")]
    OutOfRange { field: &'static str, value: i64 },
    /// Pool sizing is inconsistent.
    #[error("max idle ({max_idle}) can't be greater than max active ({max_active})")]
    IdleExceedsActive { max_idle: usize, max_active: usize },
}
