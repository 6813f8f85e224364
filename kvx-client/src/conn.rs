//! # Backend Connection
//!
//! Purpose: Own one dialed stream to the backend together with the buffers
//! used to frame requests and parse replies.
//!
//! ## Design Principles
//! 1. **All-or-Nothing Dial**: Timeouts, AUTH and SELECT are applied before a
//!    `Connection` value exists; a half-configured stream is simply dropped.
//! 2. **Cache-Friendly Buffers**: Each connection reuses its own buffers.
//! 3. **Explicit Close**: `close` reports shutdown failures instead of hiding
//!    them inside `Drop`.

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use kvx_common::{Profile, Transport};
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::resp::{encode_command, read_response, RespValue};

/// Underlying byte stream.
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_write_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.set_write_timeout(timeout),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        let result = match self {
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
        match result {
            // The peer already hung up; nothing left to close.
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

/// Single backend connection with reusable buffers.
pub struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<Stream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    created_at: Instant,
}

impl Connection {
    /// Dials the profile's endpoint and runs the AUTH/SELECT handshake.
    pub fn dial(profile: &Profile) -> ClientResult<Self> {
        let stream = connect_stream(profile)?;
        stream.set_read_timeout(profile.read_timeout())?;
        stream.set_write_timeout(profile.write_timeout())?;

        let mut conn = Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            created_at: Instant::now(),
        };

        if let Some(password) = profile.password() {
            conn.expect_ok(b"AUTH", &[password.as_bytes()])?;
        }
        if profile.database() != 0 {
            let database = profile.database().to_string();
            conn.expect_ok(b"SELECT", &[database.as_bytes()])?;
        }

        debug!(address = %profile.address(), proto = %profile.proto(), "dialed backend connection");
        Ok(conn)
    }

    /// Sends one command and reads its reply.
    ///
    /// Error replies come back as `RespValue::Error`; only transport and
    /// framing failures are `Err`.
    pub fn exec(&mut self, command: &[u8], args: &[&[u8]]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(command, args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_response(&mut self.reader, &mut self.line_buf)
    }

    /// Time the connection was established.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Age of the connection.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Shuts the stream down, reporting failures.
    pub fn close(self) -> io::Result<()> {
        self.reader.get_ref().shutdown()
    }

    fn expect_ok(&mut self, command: &[u8], args: &[&[u8]]) -> ClientResult<()> {
        let reply = self.exec(command, args)?.into_result()?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(ClientError::UnexpectedResponse)
        }
    }
}

fn connect_stream(profile: &Profile) -> ClientResult<Stream> {
    match profile.proto() {
        Transport::Tcp => {
            let stream = connect_tcp(profile)?;
            // Disable Nagle to keep request latency low for small payloads.
            stream.set_nodelay(true)?;
            Ok(Stream::Tcp(stream))
        }
        #[cfg(unix)]
        Transport::Unix => {
            // UnixStream has no timed connect; local sockets connect or fail at once.
            if let Some(timeout) = profile.connect_timeout() {
                debug!(?timeout, path = profile.host(), "connect timeout not applied to unix socket");
            }
            Ok(Stream::Unix(UnixStream::connect(profile.host())?))
        }
        #[cfg(not(unix))]
        Transport::Unix => Err(ClientError::InvalidAddress(profile.address())),
    }
}

fn connect_tcp(profile: &Profile) -> ClientResult<TcpStream> {
    let address = profile.address();
    let addrs: Vec<_> = address
        .to_socket_addrs()
        .map_err(|_| ClientError::InvalidAddress(address.clone()))?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        let attempt = match profile.connect_timeout() {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }

    match last_err {
        Some(err) => Err(ClientError::Io(err)),
        None => Err(ClientError::InvalidAddress(address)),
    }
}
