//! # Connection
//!
//! Purpose: One blocking TCP socket to one endpoint, carrying at most one
//! request at a time.
//!
//! ## Design Principles
//! 1. **Reusable Buffers**: The write buffer and the `BytesMut` read buffer
//!    live on the connection, so steady-state requests do not allocate.
//! 2. **Deadline per Round Trip**: `execute` bounds the whole exchange by
//!    `io_timeout`, not each individual read.
//! 3. **Poison on Failure**: Any timeout, I/O or decode failure leaves the
//!    stream in an unknown position; the connection marks itself unusable
//!    and the pool discards it.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mcr_common::{Request, Response};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{ClientError, ClientResult};

const READ_CHUNK: usize = 16 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Single TCP connection to one endpoint.
pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    usable: bool,
    last_used: Instant,
}

impl Connection {
    /// Opens a connection, trying each resolved address in turn.
    pub fn open(endpoint: &Endpoint, connect_timeout: Duration) -> ClientResult<Self> {
        let connect_err = |source| ClientError::Connect {
            endpoint: endpoint.clone(),
            source,
        };

        let addrs = endpoint.resolve().map_err(connect_err)?;
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    // Requests are small and latency-bound.
                    stream.set_nodelay(true).map_err(connect_err)?;
                    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
                    debug!(conn = id, %endpoint, %addr, "connection opened");
                    return Ok(Connection {
                        id,
                        endpoint: endpoint.clone(),
                        stream,
                        read_buf: BytesMut::with_capacity(READ_CHUNK),
                        write_buf: Vec::with_capacity(256),
                        usable: true,
                        last_used: Instant::now(),
                    });
                }
                Err(err) => last_err = err,
            }
        }
        Err(connect_err(last_err))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Sends `request` and waits for its complete response.
    ///
    /// Server error lines come back as `Response::ServerError`; the stream
    /// stays in sync for those, so they do not poison the connection here.
    pub fn execute(&mut self, request: &Request, io_timeout: Duration) -> ClientResult<Response> {
        let result = self.round_trip(request, io_timeout);
        if result.is_err() {
            self.usable = false;
        }
        self.last_used = Instant::now();
        result
    }

    fn round_trip(&mut self, request: &Request, io_timeout: Duration) -> ClientResult<Response> {
        if !self.usable {
            return Err(self.broken("connection already failed"));
        }
        if !self.read_buf.is_empty() {
            // Bytes nobody asked for: the stream is out of step.
            return Err(self.broken("unsolicited bytes before request"));
        }

        let deadline = Instant::now() + io_timeout;

        self.write_buf.clear();
        request.encode(&mut self.write_buf);
        self.stream
            .set_write_timeout(Some(io_timeout))
            .map_err(|err| self.io_error(err))?;
        if let Err(err) = self.stream.write_all(&self.write_buf) {
            return Err(self.io_error(err));
        }

        let decoder = request.decoder();
        loop {
            match decoder.decode(&self.read_buf) {
                Ok(Some((response, consumed))) => {
                    self.read_buf.advance(consumed);
                    return Ok(response);
                }
                Ok(None) => {}
                Err(source) => {
                    return Err(ClientError::Protocol {
                        endpoint: self.endpoint.clone(),
                        source,
                    })
                }
            }
            self.fill(deadline)?;
        }
    }

    /// Reads at least one more chunk into the read buffer.
    fn fill(&mut self, deadline: Instant) -> ClientResult<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout {
                    endpoint: self.endpoint.clone(),
                });
            }
            self.stream
                .set_read_timeout(Some(remaining))
                .map_err(|err| self.io_error(err))?;

            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(self.broken("connection closed by peer")),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.io_error(err)),
            }
        }
    }

    /// Cheap liveness probe for idle connections.
    ///
    /// An idle socket must have nothing to read; EOF or stray bytes both mean
    /// the connection cannot be handed out.
    pub fn check_alive(&mut self) -> bool {
        if !self.usable {
            return false;
        }
        let mut probe = [0u8; 1];
        let alive = match self.stream.set_nonblocking(true) {
            Ok(()) => matches!(
                self.stream.peek(&mut probe),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock
            ),
            Err(_) => false,
        };
        if self.stream.set_nonblocking(false).is_err() || !alive {
            self.usable = false;
        }
        self.usable
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    /// Time since the last request finished.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    /// Shuts the socket down.
    pub fn close(self) {
        debug!(conn = self.id, endpoint = %self.endpoint, "connection closed");
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn io_error(&self, err: io::Error) -> ClientError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::Timeout {
                endpoint: self.endpoint.clone(),
            },
            _ => ClientError::BrokenConnection {
                endpoint: self.endpoint.clone(),
                reason: err.to_string(),
            },
        }
    }

    fn broken(&self, reason: &str) -> ClientError {
        ClientError::BrokenConnection {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("usable", &self.usable)
            .finish()
    }
}
