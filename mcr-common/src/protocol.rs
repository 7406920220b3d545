//! # Text Protocol Codec
//!
//! Purpose: Encode client requests and incrementally decode server responses
//! for the memcached text protocol, with no knowledge of sockets.
//!
//! ## Design Principles
//! 1. **Caller-Owned Buffers**: `Request::encode` appends to a reusable
//!    `Vec<u8>`; `ResponseDecoder::decode` reads from a borrowed slice.
//! 2. **Incremental Decoding**: `decode` returns `Ok(None)` until a whole
//!    frame is buffered, so the connection can keep appending reads.
//! 3. **Request-Aware Parsing**: The decoder is built from the request and
//!    only accepts tokens that request may produce.
//! 4. **Bounded Frames**: Lines and value blocks larger than the frame
//!    bounds fail fast instead of buffering forever.
//!
//! ## Frame Shapes
//!
//! ```text
//! set k 0 0 5\r\nhello\r\n     ->  STORED\r\n
//! get a b\r\n                  ->  VALUE a 0 5\r\nhello\r\nEND\r\n
//! delete k\r\n                 ->  DELETED\r\n | NOT_FOUND\r\n
//! incr k 3\r\n                 ->  8\r\n | NOT_FOUND\r\n
//! any                          ->  ERROR\r\n | CLIENT_ERROR m\r\n | SERVER_ERROR m\r\n
//! ```

use std::collections::HashSet;

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{CacheKey, MAX_VALUE_SIZE};
use crate::verb::Verb;

/// Line terminator.
pub const CRLF: &[u8] = b"\r\n";

/// Longest header or status line accepted before CRLF.
pub const MAX_LINE_SIZE: usize = 1024;

/// Largest single frame unit: one header line plus one value payload.
pub const MAX_FRAME_SIZE: usize = MAX_LINE_SIZE + MAX_VALUE_SIZE + 2;

/// A single client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// set/add/replace/append/prepend/cas.
    Store {
        verb: Verb,
        key: CacheKey,
        flags: u32,
        exptime: u64,
        data: Vec<u8>,
        cas: Option<u64>,
    },
    /// get/gets for one or more keys.
    Retrieve { verb: Verb, keys: Vec<CacheKey> },
    Delete { key: CacheKey },
    /// incr/decr.
    Arithmetic { verb: Verb, key: CacheKey, delta: u64 },
    Touch { key: CacheKey, exptime: u64 },
    Version,
    FlushAll,
}

impl Request {
    /// Builds a storage request; `cas` is only encoded for `Verb::Cas`.
    pub fn store(
        verb: Verb,
        key: CacheKey,
        flags: u32,
        exptime: u64,
        data: impl Into<Vec<u8>>,
        cas: Option<u64>,
    ) -> Self {
        debug_assert!(verb.is_storage());
        Request::Store {
            verb,
            key,
            flags,
            exptime,
            data: data.into(),
            cas,
        }
    }

    /// Builds a get (or gets) for the provided keys.
    pub fn retrieve(verb: Verb, keys: Vec<CacheKey>) -> Self {
        debug_assert!(verb.is_retrieval());
        Request::Retrieve { verb, keys }
    }

    /// Returns the command verb.
    pub fn verb(&self) -> Verb {
        match self {
            Request::Store { verb, .. } => *verb,
            Request::Retrieve { verb, .. } => *verb,
            Request::Delete { .. } => Verb::Delete,
            Request::Arithmetic { verb, .. } => *verb,
            Request::Touch { .. } => Verb::Touch,
            Request::Version => Verb::Version,
            Request::FlushAll => Verb::FlushAll,
        }
    }

    /// Appends the wire encoding of this request to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.verb().as_bytes());
        match self {
            Request::Store {
                verb,
                key,
                flags,
                exptime,
                data,
                cas,
            } => {
                push_token(out, key.as_bytes());
                push_number(out, u64::from(*flags));
                push_number(out, *exptime);
                push_number(out, data.len() as u64);
                if *verb == Verb::Cas {
                    push_number(out, cas.unwrap_or(0));
                }
                out.extend_from_slice(CRLF);
                out.extend_from_slice(data);
            }
            Request::Retrieve { keys, .. } => {
                for key in keys {
                    push_token(out, key.as_bytes());
                }
            }
            Request::Delete { key } => push_token(out, key.as_bytes()),
            Request::Arithmetic { key, delta, .. } => {
                push_token(out, key.as_bytes());
                push_number(out, *delta);
            }
            Request::Touch { key, exptime } => {
                push_token(out, key.as_bytes());
                push_number(out, *exptime);
            }
            Request::Version | Request::FlushAll => {}
        }
        out.extend_from_slice(CRLF);
    }

    /// Returns the encoded request as a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode(&mut out);
        out
    }

    /// Builds the decoder that understands this request's response.
    pub fn decoder(&self) -> ResponseDecoder {
        let keys = match self {
            Request::Retrieve { keys, .. } => {
                keys.iter().map(|key| key.as_bytes().to_vec()).collect()
            }
            _ => HashSet::new(),
        };
        ResponseDecoder {
            verb: self.verb(),
            keys,
        }
    }
}

/// One VALUE block of a retrieval response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueBlock {
    pub key: Vec<u8>,
    pub flags: u32,
    pub data: Vec<u8>,
    pub cas: Option<u64>,
}

/// Decoded server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,
    /// VALUE blocks up to END, possibly empty.
    Values(Vec<ValueBlock>),
    /// New counter value after incr/decr.
    Number(u64),
    /// Text after `VERSION `.
    Version(String),
    /// `ERROR`, `CLIENT_ERROR ...` or `SERVER_ERROR ...`, verbatim.
    ServerError(String),
}

/// Request-aware incremental response decoder.
#[derive(Debug, Clone)]
pub struct ResponseDecoder {
    verb: Verb,
    keys: HashSet<Vec<u8>>,
}

impl ResponseDecoder {
    /// Decodes one response from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, or the response and
    /// the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> ProtocolResult<Option<(Response, usize)>> {
        if self.verb.is_retrieval() {
            return self.decode_values(buf);
        }

        let (line, consumed) = match next_line(buf)? {
            Some(found) => found,
            None => return Ok(None),
        };
        if let Some(error) = server_error(line) {
            return Ok(Some((error, consumed)));
        }

        let response = match (self.verb, line) {
            (verb, b"STORED") if verb.is_storage() => Response::Stored,
            (verb, b"NOT_STORED") if verb.is_storage() => Response::NotStored,
            (Verb::Cas, b"EXISTS") => Response::Exists,
            (Verb::Cas | Verb::Delete | Verb::Touch | Verb::Incr | Verb::Decr, b"NOT_FOUND") => {
                Response::NotFound
            }
            (Verb::Delete, b"DELETED") => Response::Deleted,
            (Verb::Touch, b"TOUCHED") => Response::Touched,
            (Verb::FlushAll, b"OK") => Response::Ok,
            (Verb::Version, line) if line.starts_with(b"VERSION ") => {
                Response::Version(String::from_utf8_lossy(&line[8..]).into_owned())
            }
            (verb, line) if verb.is_arithmetic() => {
                // Servers may right-pad counters that shrank in width.
                let end = line.iter().rposition(|&b| b != b' ').map_or(0, |idx| idx + 1);
                match parse_u64(&line[..end]) {
                    Some(value) => Response::Number(value),
                    None => return Err(ProtocolError::UnknownToken(lossy(line))),
                }
            }
            (_, line) => return Err(ProtocolError::UnknownToken(lossy(line))),
        };
        Ok(Some((response, consumed)))
    }

    /// Decodes a retrieval response in two passes.
    ///
    /// The first pass only walks headers and checks terminators, so a
    /// response still arriving costs one header scan per read. Payloads are
    /// copied once, after `END` is buffered.
    fn decode_values(&self, buf: &[u8]) -> ProtocolResult<Option<(Response, usize)>> {
        let consumed = match self.walk_values(buf, |_, _| {})? {
            Some(ValuesEnd::End(consumed)) => consumed,
            Some(ValuesEnd::Error(error, consumed)) => return Ok(Some((error, consumed))),
            None => return Ok(None),
        };

        let mut values = Vec::new();
        self.walk_values(&buf[..consumed], |header, data| {
            values.push(ValueBlock {
                key: header.key.to_vec(),
                flags: header.flags,
                data: data.to_vec(),
                cas: header.cas,
            });
        })?;
        Ok(Some((Response::Values(values), consumed)))
    }

    /// Walks VALUE blocks up to `END`, handing each complete one to `visit`.
    fn walk_values<F>(&self, buf: &[u8], mut visit: F) -> ProtocolResult<Option<ValuesEnd>>
    where
        F: FnMut(&ValueHeader<'_>, &[u8]),
    {
        let mut pos = 0;
        loop {
            let (line, line_len) = match next_line(&buf[pos..])? {
                Some(found) => found,
                None => return Ok(None),
            };

            if line == b"END" {
                return Ok(Some(ValuesEnd::End(pos + line_len)));
            }
            if let Some(error) = server_error(line) {
                return Ok(Some(ValuesEnd::Error(error, pos + line_len)));
            }
            if !line.starts_with(b"VALUE ") {
                return Err(ProtocolError::UnknownToken(lossy(line)));
            }

            let header = parse_value_header(line, self.verb == Verb::Gets)?;
            if !self.keys.contains(header.key) {
                return Err(ProtocolError::UnexpectedKey(lossy(header.key)));
            }

            let data_start = pos + line_len;
            let data_end = data_start + header.len;
            if buf.len() < data_end + CRLF.len() {
                return Ok(None);
            }
            if &buf[data_end..data_end + CRLF.len()] != CRLF {
                return Err(ProtocolError::MissingTerminator);
            }

            visit(&header, &buf[data_start..data_end]);
            pos = data_end + CRLF.len();
        }
    }
}

/// How a walk over VALUE blocks finished.
enum ValuesEnd {
    End(usize),
    Error(Response, usize),
}

struct ValueHeader<'a> {
    key: &'a [u8],
    flags: u32,
    len: usize,
    cas: Option<u64>,
}

/// Parses `VALUE <key> <flags> <bytes>[ <cas>]`.
fn parse_value_header(line: &[u8], want_cas: bool) -> ProtocolResult<ValueHeader<'_>> {
    let mut tokens = line.split(|&b| b == b' ').filter(|token| !token.is_empty());
    let _ = tokens.next(); // VALUE
    let key = tokens
        .next()
        .ok_or_else(|| ProtocolError::MalformedLine(lossy(line)))?;
    let flags = tokens
        .next()
        .ok_or_else(|| ProtocolError::MalformedLine(lossy(line)))?;
    let len = tokens
        .next()
        .ok_or_else(|| ProtocolError::MalformedLine(lossy(line)))?;
    let cas = tokens.next();
    if tokens.next().is_some() || (want_cas && cas.is_none()) {
        return Err(ProtocolError::MalformedLine(lossy(line)));
    }

    let flags = parse_u64(flags)
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| ProtocolError::InvalidLength(lossy(flags)))?;
    let len = parse_u64(len).ok_or_else(|| ProtocolError::InvalidLength(lossy(len)))?;
    if len > MAX_VALUE_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge {
            limit: MAX_FRAME_SIZE,
        });
    }
    let cas = match cas {
        Some(token) => {
            Some(parse_u64(token).ok_or_else(|| ProtocolError::InvalidLength(lossy(token)))?)
        }
        None => None,
    };

    Ok(ValueHeader {
        key,
        flags,
        len: len as usize,
        cas,
    })
}

/// Finds the first CRLF-terminated line.
///
/// Returns the line without CRLF and the bytes consumed including CRLF.
fn next_line(buf: &[u8]) -> ProtocolResult<Option<(&[u8], usize)>> {
    let scan = &buf[..buf.len().min(MAX_LINE_SIZE + CRLF.len())];
    match scan.windows(2).position(|window| window == CRLF) {
        Some(end) => Ok(Some((&buf[..end], end + CRLF.len()))),
        None if buf.len() > MAX_LINE_SIZE + 1 => Err(ProtocolError::FrameTooLarge {
            limit: MAX_LINE_SIZE,
        }),
        None => Ok(None),
    }
}

fn server_error(line: &[u8]) -> Option<Response> {
    if line == b"ERROR" || line.starts_with(b"CLIENT_ERROR") || line.starts_with(b"SERVER_ERROR")
    {
        Some(Response::ServerError(lossy(line)))
    } else {
        None
    }
}

/// Parses an unsigned decimal, rejecting empty input and overflow.
pub fn parse_u64(data: &[u8]) -> Option<u64> {
    if data.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    Some(value)
}

fn push_token(out: &mut Vec<u8>, token: &[u8]) {
    out.push(b' ');
    out.extend_from_slice(token);
}

fn push_number(out: &mut Vec<u8>, mut value: u64) {
    // Digits go through a stack buffer to keep encoding allocation-free.
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
    out.push(b' ');
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name).unwrap()
    }

    #[test]
    fn encodes_set() {
        let request = Request::store(Verb::Set, key("user:1"), 7, 0, b"hello".to_vec(), None);
        assert_eq!(request.to_bytes(), b"set user:1 7 0 5\r\nhello\r\n");
    }

    #[test]
    fn encodes_cas_with_token() {
        let request = Request::store(Verb::Cas, key("k"), 0, 30, b"v".to_vec(), Some(99));
        assert_eq!(request.to_bytes(), b"cas k 0 30 1 99\r\nv\r\n");
    }

    #[test]
    fn encodes_multi_get() {
        let request = Request::retrieve(Verb::Get, vec![key("a"), key("b"), key("c")]);
        assert_eq!(request.to_bytes(), b"get a b c\r\n");
    }

    #[test]
    fn encodes_simple_commands() {
        assert_eq!(Request::Delete { key: key("k") }.to_bytes(), b"delete k\r\n");
        let incr = Request::Arithmetic {
            verb: Verb::Incr,
            key: key("n"),
            delta: 10,
        };
        assert_eq!(incr.to_bytes(), b"incr n 10\r\n");
        let touch = Request::Touch {
            key: key("k"),
            exptime: 5,
        };
        assert_eq!(touch.to_bytes(), b"touch k 5\r\n");
        assert_eq!(Request::Version.to_bytes(), b"version\r\n");
        assert_eq!(Request::FlushAll.to_bytes(), b"flush_all\r\n");
    }

    #[test]
    fn decodes_store_status() {
        let decoder = Request::store(Verb::Add, key("k"), 0, 0, b"v".to_vec(), None).decoder();
        assert_eq!(
            decoder.decode(b"STORED\r\n").unwrap(),
            Some((Response::Stored, 8))
        );
        assert_eq!(
            decoder.decode(b"NOT_STORED\r\n").unwrap(),
            Some((Response::NotStored, 12))
        );
    }

    #[test]
    fn incomplete_status_line_needs_more() {
        let decoder = Request::Delete { key: key("k") }.decoder();
        assert_eq!(decoder.decode(b"DELE").unwrap(), None);
        assert_eq!(decoder.decode(b"DELETED\r").unwrap(), None);
        assert_eq!(
            decoder.decode(b"DELETED\r\n").unwrap(),
            Some((Response::Deleted, 9))
        );
    }

    #[test]
    fn decodes_values_in_order_with_consumed_length() {
        let decoder = Request::retrieve(Verb::Get, vec![key("a"), key("b"), key("c")]).decoder();
        let frame = b"VALUE a 1 3\r\none\r\nVALUE c 2 5\r\nthree\r\nEND\r\ntrailing";
        let (response, consumed) = decoder.decode(frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len() - b"trailing".len());
        assert_eq!(
            response,
            Response::Values(vec![
                ValueBlock {
                    key: b"a".to_vec(),
                    flags: 1,
                    data: b"one".to_vec(),
                    cas: None,
                },
                ValueBlock {
                    key: b"c".to_vec(),
                    flags: 2,
                    data: b"three".to_vec(),
                    cas: None,
                },
            ])
        );
    }

    #[test]
    fn value_payload_may_contain_crlf() {
        let decoder = Request::retrieve(Verb::Get, vec![key("a")]).decoder();
        let frame = b"VALUE a 0 4\r\n\r\n\r\n\r\nEND\r\n";
        let (response, _) = decoder.decode(frame).unwrap().unwrap();
        match response {
            Response::Values(values) => assert_eq!(values[0].data, b"\r\n\r\n"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn partial_value_block_accumulates() {
        let decoder = Request::retrieve(Verb::Get, vec![key("a")]).decoder();
        let frame = b"VALUE a 0 5\r\nhello\r\nEND\r\n";
        for cut in 0..frame.len() {
            assert_eq!(decoder.decode(&frame[..cut]).unwrap(), None, "cut at {cut}");
        }
        assert!(decoder.decode(frame).unwrap().is_some());
    }

    #[test]
    fn large_multi_value_response_decodes_once_complete() {
        let names: Vec<String> = (0..4).map(|idx| format!("big:{idx}")).collect();
        let keys = names.iter().map(|name| key(name)).collect();
        let decoder = Request::retrieve(Verb::Get, keys).decoder();

        let payload = vec![b'x'; MAX_VALUE_SIZE];
        let mut frame = Vec::new();
        for name in &names {
            frame.extend_from_slice(format!("VALUE {name} 0 {}\r\n", payload.len()).as_bytes());
            frame.extend_from_slice(&payload);
            frame.extend_from_slice(CRLF);
        }
        frame.extend_from_slice(b"END\r\n");

        // Grows the buffer the way a connection does, one read at a time.
        let mut end = 0;
        while end < frame.len() - 1 {
            end = (end + 16 * 1024).min(frame.len() - 1);
            assert_eq!(decoder.decode(&frame[..end]).unwrap(), None);
        }
        let (response, consumed) = decoder.decode(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        match response {
            Response::Values(values) => {
                assert_eq!(values.len(), 4);
                assert!(values.iter().all(|value| value.data.len() == MAX_VALUE_SIZE));
                assert_eq!(values[3].key, b"big:3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_error_after_values_wins() {
        let decoder = Request::retrieve(Verb::Get, vec![key("a")]).decoder();
        let frame = b"VALUE a 0 1\r\nx\r\nSERVER_ERROR busy\r\n";
        assert_eq!(
            decoder.decode(frame).unwrap(),
            Some((Response::ServerError("SERVER_ERROR busy".to_string()), frame.len()))
        );
    }

    #[test]
    fn decodes_gets_cas_token() {
        let decoder = Request::retrieve(Verb::Gets, vec![key("a")]).decoder();
        let (response, _) = decoder
            .decode(b"VALUE a 0 1 42\r\nx\r\nEND\r\n")
            .unwrap()
            .unwrap();
        match response {
            Response::Values(values) => assert_eq!(values[0].cas, Some(42)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            decoder.decode(b"VALUE a 0 1\r\nx\r\nEND\r\n"),
            Err(ProtocolError::MalformedLine(_))
        ));
    }

    #[test]
    fn empty_retrieval_is_end_only() {
        let decoder = Request::retrieve(Verb::Get, vec![key("a")]).decoder();
        assert_eq!(
            decoder.decode(b"END\r\n").unwrap(),
            Some((Response::Values(Vec::new()), 5))
        );
    }

    #[test]
    fn rejects_unrequested_key() {
        let decoder = Request::retrieve(Verb::Get, vec![key("a")]).decoder();
        assert_eq!(
            decoder.decode(b"VALUE b 0 1\r\nx\r\nEND\r\n"),
            Err(ProtocolError::UnexpectedKey("b".to_string()))
        );
    }

    #[test]
    fn rejects_bad_length_and_terminator() {
        let decoder = Request::retrieve(Verb::Get, vec![key("a")]).decoder();
        assert!(matches!(
            decoder.decode(b"VALUE a 0 x\r\n"),
            Err(ProtocolError::InvalidLength(_))
        ));
        assert_eq!(
            decoder.decode(b"VALUE a 0 1\r\nxyz\r\n"),
            Err(ProtocolError::MissingTerminator)
        );
        let oversized = format!("VALUE a 0 {}\r\n", MAX_VALUE_SIZE + 1);
        assert!(matches!(
            decoder.decode(oversized.as_bytes()),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_unterminated_line_past_bound() {
        let decoder = Request::Version.decoder();
        let junk = vec![b'x'; MAX_LINE_SIZE + 8];
        assert!(matches!(
            decoder.decode(&junk),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_token_for_wrong_verb() {
        let decoder = Request::Delete { key: key("k") }.decoder();
        assert_eq!(
            decoder.decode(b"STORED\r\n"),
            Err(ProtocolError::UnknownToken("STORED".to_string()))
        );
    }

    #[test]
    fn decodes_counter_and_not_found() {
        let decoder = Request::Arithmetic {
            verb: Verb::Decr,
            key: key("n"),
            delta: 1,
        }
        .decoder();
        assert_eq!(
            decoder.decode(b"41\r\n").unwrap(),
            Some((Response::Number(41), 4))
        );
        assert_eq!(
            decoder.decode(b"9  \r\n").unwrap(),
            Some((Response::Number(9), 5))
        );
        assert_eq!(
            decoder.decode(b"NOT_FOUND\r\n").unwrap(),
            Some((Response::NotFound, 11))
        );
        assert!(matches!(
            decoder.decode(b"forty\r\n"),
            Err(ProtocolError::UnknownToken(_))
        ));
    }

    #[test]
    fn decodes_server_errors_for_any_verb() {
        let decoder = Request::Version.decoder();
        assert_eq!(
            decoder.decode(b"SERVER_ERROR out of memory\r\n").unwrap(),
            Some((Response::ServerError("SERVER_ERROR out of memory".to_string()), 28))
        );
        let decoder = Request::retrieve(Verb::Get, vec![key("a")]).decoder();
        assert_eq!(
            decoder.decode(b"ERROR\r\n").unwrap(),
            Some((Response::ServerError("ERROR".to_string()), 7))
        );
    }

    #[test]
    fn decodes_version_and_flush() {
        assert_eq!(
            Request::Version.decoder().decode(b"VERSION 1.6.21\r\n").unwrap(),
            Some((Response::Version("1.6.21".to_string()), 16))
        );
        assert_eq!(
            Request::FlushAll.decoder().decode(b"OK\r\n").unwrap(),
            Some((Response::Ok, 4))
        );
    }

    #[test]
    fn parse_u64_rejects_overflow() {
        assert_eq!(parse_u64(b"18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_u64(b"18446744073709551616"), None);
        assert_eq!(parse_u64(b""), None);
        assert_eq!(parse_u64(b"-1"), None);
    }
}
