//! Socket transport with newline-delimited JSON framing.
//!
//! Each protocol message occupies exactly one line:
//! ```text
//! {"execute":"query-status","arguments":{}}\n
//! ```
//! Blank lines are ignored. A line longer than the configured limit, or a
//! stream that ends part-way through a line, is a framing error.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use qmp_config::SocketEndpoint;
use serde::Serialize;
use serde_json::{Map, Value};

#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

#[cfg(unix)]
use socket2::{Domain, SockAddr, Socket, Type};

use crate::error::{FramingError, QmpError, TransportError};

/// Byte stream to a monitor.
#[derive(Debug)]
pub enum MonitorStream {
    /// TCP connection.
    Tcp(TcpStream),
    /// Unix domain socket connection.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl MonitorStream {
    /// Opens a stream to `endpoint`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Resolve`] when a TCP host does not resolve
    /// and [`TransportError::Connect`] when the connection is refused or
    /// times out.
    pub fn connect(endpoint: &SocketEndpoint, timeout: Duration) -> Result<Self, TransportError> {
        match endpoint {
            SocketEndpoint::Tcp { host, port } => {
                let address =
                    resolve_tcp_address(host, *port).map_err(|source| TransportError::Resolve {
                        endpoint: endpoint.to_string(),
                        source,
                    })?;

                TcpStream::connect_timeout(&address, timeout)
                    .map(Self::Tcp)
                    .map_err(|source| TransportError::Connect {
                        endpoint: endpoint.to_string(),
                        source,
                    })
            }
            SocketEndpoint::Unix { path } => {
                #[cfg(unix)]
                {
                    connect_unix(path.as_str(), timeout).map_err(|source| {
                        TransportError::Connect {
                            endpoint: endpoint.to_string(),
                            source,
                        }
                    })
                }

                #[cfg(not(unix))]
                {
                    let _ = path;
                    Err(TransportError::UnsupportedUnixTransport(
                        endpoint.to_string(),
                    ))
                }
            }
        }
    }

    /// Duplicates the handle so reading and writing can happen on
    /// different threads.
    ///
    /// # Errors
    ///
    /// Returns the operating system error when the descriptor cannot be
    /// duplicated.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(stream) => stream.try_clone().map(Self::Tcp),
            #[cfg(unix)]
            Self::Unix(stream) => stream.try_clone().map(Self::Unix),
        }
    }

    /// Shuts down both directions, unblocking any pending read.
    ///
    /// # Errors
    ///
    /// Returns the operating system error, typically `NotConnected` when the
    /// peer already hung up.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Self::Unix(stream) => stream.shutdown(Shutdown::Both),
        }
    }

    /// Sets the read timeout on the underlying socket.
    ///
    /// # Errors
    ///
    /// Returns the operating system error, or `InvalidInput` for a zero
    /// duration.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            Self::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }
}

impl Read for MonitorStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for MonitorStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
        }
    }
}

fn resolve_tcp_address(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved addresses"))
}

#[cfg(unix)]
fn connect_unix(path: &str, timeout: Duration) -> io::Result<MonitorStream> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    let address = SockAddr::unix(path)?;
    socket.connect_timeout(&address, timeout)?;
    Ok(MonitorStream::Unix(UnixStream::from(OwnedFd::from(socket))))
}

/// Reads one JSON object per line.
#[derive(Debug)]
pub struct MessageReader<R> {
    reader: BufReader<R>,
    limit: usize,
    line: Vec<u8>,
}

impl<R: Read> MessageReader<R> {
    /// Wraps `inner`, rejecting lines longer than `limit` bytes.
    pub fn new(inner: R, limit: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            limit,
            line: Vec::new(),
        }
    }

    /// Reads the next message, or `None` at a clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the read fails and a
    /// [`FramingError`] when the line is oversized, truncated, not JSON or
    /// not an object.
    pub fn read_message(&mut self) -> Result<Option<Map<String, Value>>, QmpError> {
        loop {
            self.line.clear();
            let budget = u64::try_from(self.limit)
                .unwrap_or(u64::MAX)
                .saturating_add(1);
            let read = (&mut self.reader)
                .take(budget)
                .read_until(b'\n', &mut self.line)
                .map_err(TransportError::Io)?;
            if read == 0 {
                return Ok(None);
            }

            let terminated = self.line.last() == Some(&b'\n');
            if !terminated && self.line.len() > self.limit {
                return Err(FramingError::Oversized { limit: self.limit }.into());
            }
            if is_blank(&self.line) {
                if terminated {
                    continue;
                }
                return Ok(None);
            }
            if !terminated {
                return Err(FramingError::PartialMessage {
                    buffered: self.line.len(),
                }
                .into());
            }

            let value: Value =
                serde_json::from_slice(&self.line).map_err(FramingError::InvalidJson)?;
            return match value {
                Value::Object(message) => Ok(Some(message)),
                _ => Err(FramingError::NotAnObject.into()),
            };
        }
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Writes one JSON value per line.
#[derive(Debug)]
pub struct MessageWriter<W> {
    writer: W,
    closed: bool,
}

impl<W: Write> MessageWriter<W> {
    /// Wraps `writer`.
    pub const fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    /// Serialises `message`, appends a newline and flushes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::WriteAfterClose`] once [`Self::close`] has
    /// been called and [`TransportError::Io`] when the write fails.
    pub fn write_message<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::WriteAfterClose);
        }
        let mut payload = serde_json::to_vec(message).map_err(io::Error::from)?;
        payload.push(b'\n');
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Refuses further writes.
    pub fn close(&mut self) {
        self.closed = true;
    }
}
