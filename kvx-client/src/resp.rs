//! # RESP2 Encoding and Parsing
//!
//! Purpose: Frame client commands and parse backend replies for the pooled
//! client, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use std::io::BufRead;

use crate::error::{ClientError, ClientResult};

/// Upper bound accepted for a single bulk string (matches the backend default).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Nesting limit for array replies.
const MAX_DEPTH: usize = 32;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings.
    Bulk(Vec<u8>),
    /// $-1 or *-1.
    Nil,
    /// *... arrays.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Converts an error reply into `ClientError::Server`, passing others through.
    pub fn into_result(self) -> ClientResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(ClientError::Server { message }),
            other => Ok(other),
        }
    }

    /// True for `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::Simple(text) if text == b"OK")
    }

    pub fn into_integer(self) -> ClientResult<i64> {
        match self {
            RespValue::Integer(value) => Ok(value),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Bulk or simple string payload; `None` for nil.
    pub fn into_optional_bytes(self) -> ClientResult<Option<Vec<u8>>> {
        match self {
            RespValue::Bulk(data) | RespValue::Simple(data) => Ok(Some(data)),
            RespValue::Nil => Ok(None),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Parses a bulk string reply holding a decimal float (INCRBYFLOAT and friends).
    pub fn into_float(self) -> ClientResult<f64> {
        let data = self
            .into_optional_bytes()?
            .ok_or(ClientError::UnexpectedResponse)?;
        std::str::from_utf8(&data)
            .ok()
            .and_then(|text| text.trim().parse::<f64>().ok())
            .ok_or(ClientError::UnexpectedResponse)
    }

    /// Array of bulk strings where elements may be nil (MGET, HMGET).
    pub fn into_optional_bytes_array(self) -> ClientResult<Vec<Option<Vec<u8>>>> {
        match self {
            RespValue::Array(items) => items
                .into_iter()
                .map(RespValue::into_optional_bytes)
                .collect(),
            RespValue::Nil => Ok(Vec::new()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Array of non-nil bulk strings (HKEYS, HVALS, HGETALL).
    pub fn into_bytes_array(self) -> ClientResult<Vec<Vec<u8>>> {
        self.into_optional_bytes_array()?
            .into_iter()
            .map(|item| item.ok_or(ClientError::UnexpectedResponse))
            .collect()
    }
}

/// Encodes a RESP2 array command (name followed by arguments) into `out`.
pub fn encode_command(command: &[u8], args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_decimal(out, args.len() + 1);
    out.extend_from_slice(b"\r\n");
    push_bulk(out, command);
    for arg in args {
        push_bulk(out, arg);
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    read_value(reader, line_buf, 0)
}

fn read_value<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    depth: usize,
) -> ClientResult<RespValue> {
    if depth > MAX_DEPTH {
        return Err(ClientError::Protocol("reply nested too deeply"));
    }

    read_line(reader, line_buf)?;
    let (&marker, rest) = line_buf
        .split_first()
        .ok_or(ClientError::Protocol("empty reply line"))?;

    match marker {
        b'+' => Ok(RespValue::Simple(rest.to_vec())),
        b'-' => Ok(RespValue::Error(rest.to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
        b'$' => {
            let len = parse_i64(rest)?;
            read_bulk(reader, len)
        }
        b'*' => {
            let len = parse_i64(rest)?;
            if len < 0 {
                return Ok(RespValue::Nil);
            }
            let mut items = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                items.push(read_value(reader, line_buf, depth + 1)?);
            }
            Ok(RespValue::Array(items))
        }
        _ => Err(ClientError::Protocol("unknown reply type")),
    }
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64) -> ClientResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Nil);
    }
    if len > MAX_BULK_LEN {
        return Err(ClientError::Protocol("bulk string too large"));
    }

    // Read payload and trailing CRLF in one call.
    let mut data = vec![0u8; len as usize + 2];
    reader.read_exact(&mut data)?;
    if !data.ends_with(b"\r\n") {
        return Err(ClientError::Protocol("bulk string missing CRLF"));
    }
    data.truncate(len as usize);
    Ok(RespValue::Bulk(data))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ClientError::Protocol("connection closed by peer"));
    }
    if !buf.ends_with(b"\r\n") {
        return Err(ClientError::Protocol("reply line missing CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(ClientError::Protocol("invalid integer"))
}

fn push_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'$');
    push_decimal(out, data.len());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

fn push_decimal(out: &mut Vec<u8>, mut value: usize) {
    // Digits go into a stack buffer first; no heap allocation for lengths.
    let mut buf = [0u8; 20];
    let mut len = 0;
    loop {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    out.extend(buf[..len].iter().rev());
}
