//! # Typed Command Helpers
//!
//! Thin wrappers over `Executor::execute` for string, key, hash and counter
//! commands. Each helper rejects malformed arguments before borrowing a
//! connection and decodes the reply into a Rust type.

use std::time::Duration;

use crate::error::{ClientError, ClientResult};
use crate::executor::{CallOutcome, Executor};
use crate::resp::RespValue;

/// TTL state of a key, mirroring the backend's TTL reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

fn require_key(key: &[u8]) -> ClientResult<()> {
    if key.is_empty() {
        return Err(ClientError::invalid("key can't be empty"));
    }
    Ok(())
}

fn require_field(field: &[u8]) -> ClientResult<()> {
    if field.is_empty() {
        return Err(ClientError::invalid("field can't be empty"));
    }
    Ok(())
}

fn require_finite(value: f64) -> ClientResult<()> {
    if !value.is_finite() {
        return Err(ClientError::invalid("increment must be a finite number"));
    }
    Ok(())
}

fn expect_ok(reply: RespValue) -> ClientResult<()> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(ClientError::UnexpectedResponse)
    }
}

fn into_flag(reply: RespValue) -> ClientResult<bool> {
    reply.into_integer().map(|value| value > 0)
}

fn into_count(reply: RespValue) -> ClientResult<u64> {
    let value = reply.into_integer()?;
    u64::try_from(value).map_err(|_| ClientError::UnexpectedResponse)
}

fn into_ttl(reply: RespValue) -> ClientResult<KeyTtl> {
    match reply.into_integer()? {
        -2 => Ok(KeyTtl::Missing),
        -1 => Ok(KeyTtl::NoExpiry),
        seconds if seconds >= 0 => Ok(KeyTtl::ExpiresIn(Duration::from_secs(seconds as u64))),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn into_pairs(reply: RespValue) -> ClientResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let flat = reply.into_bytes_array()?;
    if flat.len() % 2 != 0 {
        return Err(ClientError::UnexpectedResponse);
    }
    let mut pairs = Vec::with_capacity(flat.len() / 2);
    let mut items = flat.into_iter();
    while let (Some(field), Some(value)) = (items.next(), items.next()) {
        pairs.push((field, value));
    }
    Ok(pairs)
}

/// Keys with the empty ones dropped; fails when nothing remains.
fn non_empty<'a>(items: &[&'a [u8]], what: &str) -> ClientResult<Vec<&'a [u8]>> {
    let kept: Vec<&[u8]> = items.iter().copied().filter(|item| !item.is_empty()).collect();
    if kept.is_empty() {
        return Err(ClientError::invalid(format!("{what} can't be empty")));
    }
    Ok(kept)
}

/// Every item must be non-empty; the error names the offending index.
fn all_present(items: &[&[u8]], what: &str) -> ClientResult<()> {
    if items.is_empty() {
        return Err(ClientError::invalid(format!("{what}s can't be empty")));
    }
    match items.iter().position(|item| item.is_empty()) {
        Some(index) => Err(ClientError::invalid(format!("{what}-{index} can't be empty"))),
        None => Ok(()),
    }
}

fn flatten_pairs<'a>(
    head: Option<&'a [u8]>,
    pairs: &[(&'a [u8], &'a [u8])],
    what: &str,
) -> ClientResult<Vec<&'a [u8]>> {
    if pairs.is_empty() {
        return Err(ClientError::invalid("data can't be empty"));
    }
    let mut args = Vec::with_capacity(pairs.len() * 2 + 1);
    args.extend(head);
    for (name, value) in pairs {
        if name.is_empty() {
            return Err(ClientError::invalid(format!("{what} can't be empty")));
        }
        args.push(*name);
        args.push(*value);
    }
    Ok(args)
}

/// Runs a validation step, short-circuiting into a rejected outcome.
macro_rules! check {
    ($expr:expr) => {
        if let Err(err) = $expr {
            return CallOutcome::rejected(err);
        }
    };
}

impl Executor {
    /// GET. `None` when the key is missing.
    pub fn get(&self, key: &[u8]) -> CallOutcome<Option<Vec<u8>>> {
        check!(require_key(key));
        self.execute("GET", &[key])
            .and_then(RespValue::into_optional_bytes)
    }

    /// SET without expiration.
    pub fn set(&self, key: &[u8], value: &[u8]) -> CallOutcome<()> {
        check!(require_key(key));
        self.execute("SET", &[key, value]).and_then(expect_ok)
    }

    /// SETEX; `seconds` must be positive.
    pub fn set_ex(&self, key: &[u8], value: &[u8], seconds: u64) -> CallOutcome<()> {
        check!(require_key(key));
        if seconds == 0 {
            return CallOutcome::rejected(ClientError::invalid("seconds must be greater than 0"));
        }
        let seconds = seconds.to_string();
        self.execute("SETEX", &[key, seconds.as_bytes(), value])
            .and_then(expect_ok)
    }

    /// DEL. Empty keys are skipped; returns the number of keys removed.
    pub fn del(&self, keys: &[&[u8]]) -> CallOutcome<u64> {
        let keys = match non_empty(keys, "keys") {
            Ok(keys) => keys,
            Err(err) => return CallOutcome::rejected(err),
        };
        self.execute("DEL", &keys).and_then(into_count)
    }

    pub fn exists(&self, key: &[u8]) -> CallOutcome<bool> {
        check!(require_key(key));
        self.execute("EXISTS", &[key]).and_then(into_flag)
    }

    pub fn ttl(&self, key: &[u8]) -> CallOutcome<KeyTtl> {
        check!(require_key(key));
        self.execute("TTL", &[key]).and_then(into_ttl)
    }

    /// MGET, one entry per requested key.
    pub fn mget(&self, keys: &[&[u8]]) -> CallOutcome<Vec<Option<Vec<u8>>>> {
        check!(all_present(keys, "key"));
        self.execute("MGET", keys)
            .and_then(RespValue::into_optional_bytes_array)
    }

    /// MSET, preserving the order of `pairs`.
    pub fn mset(&self, pairs: &[(&[u8], &[u8])]) -> CallOutcome<()> {
        let args = match flatten_pairs(None, pairs, "key") {
            Ok(args) => args,
            Err(err) => return CallOutcome::rejected(err),
        };
        self.execute("MSET", &args).and_then(expect_ok)
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> CallOutcome<Option<Vec<u8>>> {
        check!(require_key(key));
        check!(require_field(field));
        self.execute("HGET", &[key, field])
            .and_then(RespValue::into_optional_bytes)
    }

    /// HSET of one field. True when the field was newly created.
    pub fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> CallOutcome<bool> {
        check!(require_key(key));
        check!(require_field(field));
        self.execute("HSET", &[key, field, value]).and_then(into_flag)
    }

    /// HDEL. Empty fields are skipped; returns the number of fields removed.
    pub fn hdel(&self, key: &[u8], fields: &[&[u8]]) -> CallOutcome<u64> {
        check!(require_key(key));
        let fields = match non_empty(fields, "fields") {
            Ok(fields) => fields,
            Err(err) => return CallOutcome::rejected(err),
        };
        let mut args = Vec::with_capacity(fields.len() + 1);
        args.push(key);
        args.extend(fields);
        self.execute("HDEL", &args).and_then(into_count)
    }

    pub fn hexists(&self, key: &[u8], field: &[u8]) -> CallOutcome<bool> {
        check!(require_key(key));
        check!(require_field(field));
        self.execute("HEXISTS", &[key, field]).and_then(into_flag)
    }

    pub fn hmget(&self, key: &[u8], fields: &[&[u8]]) -> CallOutcome<Vec<Option<Vec<u8>>>> {
        check!(require_key(key));
        check!(all_present(fields, "field"));
        let mut args = Vec::with_capacity(fields.len() + 1);
        args.push(key);
        args.extend_from_slice(fields);
        self.execute("HMGET", &args)
            .and_then(RespValue::into_optional_bytes_array)
    }

    pub fn hmset(&self, key: &[u8], pairs: &[(&[u8], &[u8])]) -> CallOutcome<()> {
        check!(require_key(key));
        let args = match flatten_pairs(Some(key), pairs, "field") {
            Ok(args) => args,
            Err(err) => return CallOutcome::rejected(err),
        };
        self.execute("HMSET", &args).and_then(expect_ok)
    }

    /// HGETALL as (field, value) pairs.
    pub fn hgetall(&self, key: &[u8]) -> CallOutcome<Vec<(Vec<u8>, Vec<u8>)>> {
        check!(require_key(key));
        self.execute("HGETALL", &[key]).and_then(into_pairs)
    }

    pub fn hkeys(&self, key: &[u8]) -> CallOutcome<Vec<Vec<u8>>> {
        check!(require_key(key));
        self.execute("HKEYS", &[key])
            .and_then(RespValue::into_bytes_array)
    }

    pub fn hvals(&self, key: &[u8]) -> CallOutcome<Vec<Vec<u8>>> {
        check!(require_key(key));
        self.execute("HVALS", &[key])
            .and_then(RespValue::into_bytes_array)
    }

    pub fn incr(&self, key: &[u8]) -> CallOutcome<i64> {
        check!(require_key(key));
        self.execute("INCR", &[key]).and_then(RespValue::into_integer)
    }

    pub fn decr(&self, key: &[u8]) -> CallOutcome<i64> {
        check!(require_key(key));
        self.execute("DECR", &[key]).and_then(RespValue::into_integer)
    }

    pub fn incr_by(&self, key: &[u8], increment: i64) -> CallOutcome<i64> {
        check!(require_key(key));
        let increment = increment.to_string();
        self.execute("INCRBY", &[key, increment.as_bytes()])
            .and_then(RespValue::into_integer)
    }

    pub fn decr_by(&self, key: &[u8], decrement: i64) -> CallOutcome<i64> {
        check!(require_key(key));
        let decrement = decrement.to_string();
        self.execute("DECRBY", &[key, decrement.as_bytes()])
            .and_then(RespValue::into_integer)
    }

    pub fn incr_by_float(&self, key: &[u8], increment: f64) -> CallOutcome<f64> {
        check!(require_key(key));
        check!(require_finite(increment));
        let increment = increment.to_string();
        self.execute("INCRBYFLOAT", &[key, increment.as_bytes()])
            .and_then(RespValue::into_float)
    }

    pub fn hincr_by(&self, key: &[u8], field: &[u8], increment: i64) -> CallOutcome<i64> {
        check!(require_key(key));
        check!(require_field(field));
        let increment = increment.to_string();
        self.execute("HINCRBY", &[key, field, increment.as_bytes()])
            .and_then(RespValue::into_integer)
    }

    pub fn hincr_by_float(&self, key: &[u8], field: &[u8], increment: f64) -> CallOutcome<f64> {
        check!(require_key(key));
        check!(require_field(field));
        check!(require_finite(increment));
        let increment = increment.to_string();
        self.execute("HINCRBYFLOAT", &[key, field, increment.as_bytes()])
            .and_then(RespValue::into_float)
    }
}
