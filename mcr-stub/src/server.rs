//! # TCP Server
//!
//! Accept text-protocol connections, parse commands out of a `BytesMut`
//! buffer, and answer them from the in-memory store. Fault switches on
//! `StubState` let tests stall replies or drop connections on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use mcr_common::{parse_u64, Verb, CRLF, MAX_KEY_SIZE, MAX_LINE_SIZE, MAX_VALUE_SIZE};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::stats::Counters;
use crate::store::{CounterError, Store, StoreArgs, StoreStatus};

/// State shared by every connection of one stub.
#[derive(Default)]
pub(crate) struct StubState {
    pub(crate) store: Store,
    pub(crate) counters: Counters,
    /// Read requests but never answer them.
    pub(crate) stall: AtomicBool,
    /// One-shot faults applied to the next requests, in order.
    pub(crate) faults: Mutex<VecDeque<Fault>>,
}

impl StubState {
    pub(crate) fn queue_fault(&self, fault: Fault, count: usize) {
        self.faults.lock().extend(std::iter::repeat(fault).take(count));
    }

    fn take_fault(&self) -> Option<Fault> {
        self.faults.lock().pop_front()
    }
}

/// How to misbehave on one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Close the connection without answering.
    Drop,
    /// Send the first half of the reply, then go silent on that connection.
    Truncate,
    /// Answer with a line no client can parse.
    Garble,
}

/// One parsed request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Store {
        verb: Verb,
        key: Vec<u8>,
        flags: u32,
        exptime: u64,
        data: Vec<u8>,
        cas: Option<u64>,
    },
    Retrieve {
        verb: Verb,
        keys: Vec<Vec<u8>>,
    },
    Delete {
        key: Vec<u8>,
    },
    Arithmetic {
        verb: Verb,
        key: Vec<u8>,
        delta: u64,
    },
    Touch {
        key: Vec<u8>,
        exptime: u64,
    },
    Version,
    FlushAll,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Parsed {
    Complete(Command, usize),
    Incomplete,
    /// Reply with the given line and skip `usize` bytes.
    Invalid(&'static str, usize),
}

const BAD_FORMAT: &str = "CLIENT_ERROR bad command line format";

/// Handles a single TCP client connection.
pub(crate) async fn handle_connection(mut stream: TcpStream, state: Arc<StubState>) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            match parse_command(&buffer) {
                Parsed::Complete(command, consumed) => {
                    buffer.advance(consumed);
                    state.counters.record(command.verb());
                    let fault = state.take_fault();
                    if fault == Some(Fault::Drop) {
                        debug!("dropping connection on request");
                        return Ok(());
                    }
                    if state.stall.load(Ordering::Acquire) {
                        continue;
                    }
                    let response = dispatch_command(command, &state.store);
                    match fault {
                        Some(Fault::Truncate) => {
                            stream.write_all(&response[..response.len() / 2]).await?;
                            debug!("reply truncated, connection goes silent");
                            return drain(stream).await;
                        }
                        Some(Fault::Garble) => stream.write_all(b"BANANA\r\n").await?,
                        _ => stream.write_all(&response).await?,
                    }
                }
                Parsed::Incomplete => break,
                Parsed::Invalid(reply, consumed) => {
                    buffer.advance(consumed);
                    stream.write_all(reply.as_bytes()).await?;
                    stream.write_all(CRLF).await?;
                }
            }
        }
    }

    Ok(())
}

/// Reads and discards until the peer closes.
async fn drain(mut stream: TcpStream) -> std::io::Result<()> {
    let mut sink = [0u8; 1024];
    while stream.read(&mut sink).await? > 0 {}
    Ok(())
}

impl Command {
    fn verb(&self) -> Verb {
        match self {
            Command::Store { verb, .. } => *verb,
            Command::Retrieve { verb, .. } => *verb,
            Command::Delete { .. } => Verb::Delete,
            Command::Arithmetic { verb, .. } => *verb,
            Command::Touch { .. } => Verb::Touch,
            Command::Version => Verb::Version,
            Command::FlushAll => Verb::FlushAll,
        }
    }
}

/// Parses one command from the front of `buf` without consuming it.
pub(crate) fn parse_command(buf: &[u8]) -> Parsed {
    let line_end = match buf.windows(2).position(|window| window == CRLF) {
        Some(end) => end,
        None if buf.len() > MAX_LINE_SIZE => return Parsed::Invalid("ERROR", buf.len()),
        None => return Parsed::Incomplete,
    };
    let line = &buf[..line_end];
    let consumed = line_end + CRLF.len();

    let mut tokens = line.split(|&b| b == b' ').filter(|token| !token.is_empty());
    let verb = match tokens.next().and_then(Verb::from_bytes) {
        Some(verb) => verb,
        None => return Parsed::Invalid("ERROR", consumed),
    };
    let args: Vec<&[u8]> = tokens.collect();
    if args.iter().take(1).any(|key| key.len() > MAX_KEY_SIZE) && verb != Verb::FlushAll {
        return Parsed::Invalid(BAD_FORMAT, consumed);
    }

    let command = match (verb, args.as_slice()) {
        (verb, [key, flags, exptime, len, rest @ ..]) if verb.is_storage() => {
            let cas = match (verb, rest) {
                (Verb::Cas, [token]) => parse_u64(token),
                (Verb::Cas, _) => return Parsed::Invalid(BAD_FORMAT, consumed),
                (_, []) => None,
                _ => return Parsed::Invalid(BAD_FORMAT, consumed),
            };
            let (Some(flags), Some(exptime), Some(len)) = (
                parse_u64(flags).and_then(|f| u32::try_from(f).ok()),
                parse_u64(exptime),
                parse_u64(len).and_then(|l| usize::try_from(l).ok()),
            ) else {
                return Parsed::Invalid(BAD_FORMAT, consumed);
            };
            if verb == Verb::Cas && cas.is_none() {
                return Parsed::Invalid(BAD_FORMAT, consumed);
            }

            let data_end = consumed + len;
            if buf.len() < data_end + CRLF.len() {
                return Parsed::Incomplete;
            }
            if &buf[data_end..data_end + CRLF.len()] != CRLF {
                return Parsed::Invalid("CLIENT_ERROR bad data chunk", data_end + CRLF.len());
            }
            return Parsed::Complete(
                Command::Store {
                    verb,
                    key: key.to_vec(),
                    flags,
                    exptime,
                    data: buf[consumed..data_end].to_vec(),
                    cas,
                },
                data_end + CRLF.len(),
            );
        }
        (verb, keys) if verb.is_retrieval() && !keys.is_empty() => Command::Retrieve {
            verb,
            keys: keys.iter().map(|key| key.to_vec()).collect(),
        },
        (Verb::Delete, [key]) => Command::Delete { key: key.to_vec() },
        (verb, [key, delta]) if verb.is_arithmetic() => match parse_u64(delta) {
            Some(delta) => Command::Arithmetic {
                verb,
                key: key.to_vec(),
                delta,
            },
            None => return Parsed::Invalid("CLIENT_ERROR invalid numeric delta argument", consumed),
        },
        (Verb::Touch, [key, exptime]) => match parse_u64(exptime) {
            Some(exptime) => Command::Touch {
                key: key.to_vec(),
                exptime,
            },
            None => return Parsed::Invalid("CLIENT_ERROR invalid exptime argument", consumed),
        },
        (Verb::Version, []) => Command::Version,
        // An optional delay is accepted and ignored.
        (Verb::FlushAll, [] | [_]) => Command::FlushAll,
        _ => return Parsed::Invalid("ERROR", consumed),
    };
    Parsed::Complete(command, consumed)
}

fn dispatch_command(command: Command, store: &Store) -> Vec<u8> {
    let now = Instant::now();
    match command {
        Command::Store {
            verb,
            key,
            flags,
            exptime,
            data,
            cas,
        } => {
            if data.len() > MAX_VALUE_SIZE {
                return line("SERVER_ERROR object too large for cache");
            }
            let args = StoreArgs {
                verb,
                key: &key,
                flags,
                exptime,
                data: &data,
                cas,
            };
            match store.store(args, now) {
                StoreStatus::Stored => line("STORED"),
                StoreStatus::NotStored => line("NOT_STORED"),
                StoreStatus::Exists => line("EXISTS"),
                StoreStatus::NotFound => line("NOT_FOUND"),
            }
        }
        Command::Retrieve { verb, keys } => {
            let mut out = Vec::new();
            for key in keys {
                if let Some(item) = store.get(&key, now) {
                    out.extend_from_slice(b"VALUE ");
                    out.extend_from_slice(&key);
                    let header = if verb == Verb::Gets {
                        format!(" {} {} {}", item.flags, item.data.len(), item.cas)
                    } else {
                        format!(" {} {}", item.flags, item.data.len())
                    };
                    out.extend_from_slice(header.as_bytes());
                    out.extend_from_slice(CRLF);
                    out.extend_from_slice(&item.data);
                    out.extend_from_slice(CRLF);
                }
            }
            out.extend_from_slice(b"END\r\n");
            out
        }
        Command::Delete { key } => {
            if store.delete(&key, now) {
                line("DELETED")
            } else {
                line("NOT_FOUND")
            }
        }
        Command::Arithmetic { verb, key, delta } => match store.apply_delta(verb, &key, delta, now) {
            Ok(Some(value)) => line(&value.to_string()),
            Ok(None) => line("NOT_FOUND"),
            Err(CounterError::NonNumeric) => {
                line("CLIENT_ERROR cannot increment or decrement non-numeric value")
            }
        },
        Command::Touch { key, exptime } => {
            if store.touch(&key, exptime, now) {
                line("TOUCHED")
            } else {
                line("NOT_FOUND")
            }
        }
        Command::Version => line(concat!("VERSION mcr-stub-", env!("CARGO_PKG_VERSION"))),
        Command::FlushAll => {
            store.flush_all();
            line("OK")
        }
    }
}

fn line(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + CRLF.len());
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(CRLF);
    out
}
