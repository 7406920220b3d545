//! # Key/Value Type Definitions
//!
//! Core data types exchanged with a cache endpoint: validated keys, the
//! value envelope returned by retrievals, and the expiry encoding used by
//! storage commands.
//!
//! ## Design Principles
//!
//! 1. **Validate Once**: A `CacheKey` can only be built from bytes that are
//!    safe to place on a protocol line, so encoders never re-check.
//!
//! 2. **Opaque Payloads**: Values are raw bytes plus caller-defined 32-bit
//!    flags. Structured encoding is the caller's concern.
//!
//! 3. **Explicit Expiry**: `Expiry` distinguishes "never", a relative ttl and
//!    an absolute deadline, and knows how the protocol wants each spelled.
//!
//! ## Wire Limits
//!
//! ```text
//! key    : 1..=250 bytes, no bytes in 0x00..=0x20 or 0x7f
//! value  : 0..=1 MiB payload
//! exptime: 0 = never, 1..=2592000 = relative seconds, larger = unix time
//! ```

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::KeyError;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 250;

/// Maximum value payload size in bytes (1 MiB, the default server item size).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Relative expirations above this many seconds are read as unix timestamps.
pub const MAX_RELATIVE_EXPIRY_SECS: u64 = 60 * 60 * 24 * 30;

/// Validated cache key.
///
/// Keys are immutable once built; cloning shares nothing but is cheap for
/// the short keys the protocol allows.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Box<[u8]>);

impl CacheKey {
    /// Creates a key from a byte slice.
    ///
    /// # Errors
    /// Returns `KeyError` if the key is empty, longer than `MAX_KEY_SIZE`, or
    /// contains whitespace/control bytes.
    ///
    /// # Examples
    /// ```rust
    /// use mcr_common::{CacheKey, KeyError, MAX_KEY_SIZE};
    ///
    /// let key = CacheKey::new("user:1").expect("valid key");
    /// assert_eq!(key.as_bytes(), b"user:1");
    ///
    /// let too_long = vec![b'k'; MAX_KEY_SIZE + 1];
    /// assert!(matches!(CacheKey::new(&too_long), Err(KeyError::TooLong { .. })));
    /// ```
    pub fn new(data: impl AsRef<[u8]>) -> Result<Self, KeyError> {
        let data = data.as_ref();
        if data.is_empty() {
            return Err(KeyError::Empty);
        }
        if data.len() > MAX_KEY_SIZE {
            return Err(KeyError::TooLong {
                len: data.len(),
                max: MAX_KEY_SIZE,
            });
        }
        if let Some(&b) = data.iter().find(|&&b| b <= b' ' || b == 0x7f) {
            return Err(KeyError::ReservedByte(b));
        }
        Ok(CacheKey(data.into()))
    }

    /// Returns the key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the key length.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry with `len`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for CacheKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&str> for CacheKey {
    type Error = KeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        CacheKey::new(value)
    }
}

impl TryFrom<&[u8]> for CacheKey {
    type Error = KeyError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        CacheKey::new(value)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Value envelope returned by a retrieval.
///
/// `cas` is only populated by `gets`; plain `get` responses omit the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue {
    /// Opaque payload bytes.
    pub data: Vec<u8>,
    /// Caller-defined metadata stored alongside the payload.
    pub flags: u32,
    /// Compare-and-swap token, when requested.
    pub cas: Option<u64>,
}

impl CacheValue {
    /// Builds a value without a CAS token.
    pub fn new(data: impl Into<Vec<u8>>, flags: u32) -> Self {
        CacheValue {
            data: data.into(),
            flags,
            cas: None,
        }
    }

    /// Returns the payload as a slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Expiration attached to a storage command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// Kept until evicted by the server.
    #[default]
    Never,
    /// Expires this long after the server stores it.
    After(Duration),
    /// Expires at an absolute wall-clock time.
    At(SystemTime),
}

impl Expiry {
    /// Relative expiry in whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Expiry::Never
        } else {
            Expiry::After(Duration::from_secs(secs))
        }
    }

    /// Encodes the expiry as the protocol `exptime` field.
    ///
    /// Sub-second remainders round up so a short ttl never collapses into
    /// `0` ("never"). Relative values past the 30-day boundary and absolute
    /// deadlines become unix seconds. An absolute deadline close enough to
    /// the epoch to read as relative is lifted to the first absolute second,
    /// which is always in the past.
    pub fn to_wire(&self, now: SystemTime) -> u64 {
        match *self {
            Expiry::Never => 0,
            Expiry::After(ttl) if ttl.is_zero() => 0,
            Expiry::After(ttl) => {
                let secs = ceil_secs(ttl);
                if secs <= MAX_RELATIVE_EXPIRY_SECS {
                    secs
                } else {
                    unix_secs(now).saturating_add(secs)
                }
            }
            Expiry::At(deadline) => unix_secs(deadline).max(MAX_RELATIVE_EXPIRY_SECS + 1),
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(ceil_secs)
        .unwrap_or(0)
}
