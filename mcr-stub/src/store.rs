//! # In-Memory Item Store
//!
//! A single-lock map with memcached item semantics: flags, CAS tokens and
//! lazy expiry checked on access.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mcr_common::{parse_u64, Verb, MAX_RELATIVE_EXPIRY_SECS};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct Item {
    data: Vec<u8>,
    flags: u32,
    cas: u64,
    // Absolute expiration timestamp.
    expires_at: Option<Instant>,
}

impl Item {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// Item fields returned by a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub data: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
}

/// Result of a storage command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Stored,
    NotStored,
    Exists,
    NotFound,
}

/// Counter update failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    NonNumeric,
}

/// Parameters of a storage command.
#[derive(Debug, Clone)]
pub struct StoreArgs<'a> {
    pub verb: Verb,
    pub key: &'a [u8],
    pub flags: u32,
    pub exptime: u64,
    pub data: &'a [u8],
    pub cas: Option<u64>,
}

struct StoreInner {
    items: HashMap<Vec<u8>, Item>,
    next_cas: u64,
}

impl StoreInner {
    fn live(&mut self, key: &[u8], now: Instant) -> Option<&mut Item> {
        if self.items.get(key).is_some_and(|item| item.is_expired(now)) {
            self.items.remove(key);
        }
        self.items.get_mut(key)
    }

    fn bump_cas(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }
}

/// Item map shared by every connection of one stub.
pub struct Store {
    inner: Mutex<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            inner: Mutex::new(StoreInner {
                items: HashMap::new(),
                next_cas: 0,
            }),
        }
    }

    pub fn get(&self, key: &[u8], now: Instant) -> Option<StoredItem> {
        let mut inner = self.inner.lock();
        inner.live(key, now).map(|item| StoredItem {
            data: item.data.clone(),
            flags: item.flags,
            cas: item.cas,
        })
    }

    /// Applies set/add/replace/append/prepend/cas.
    pub fn store(&self, args: StoreArgs<'_>, now: Instant) -> StoreStatus {
        let mut inner = self.inner.lock();
        let cas = inner.bump_cas();
        let expires_at = deadline(args.exptime, now);

        let fresh = Item {
            data: args.data.to_vec(),
            flags: args.flags,
            cas,
            expires_at,
        };

        match args.verb {
            Verb::Set => {
                inner.items.insert(args.key.to_vec(), fresh);
                StoreStatus::Stored
            }
            Verb::Add => {
                if inner.live(args.key, now).is_some() {
                    return StoreStatus::NotStored;
                }
                inner.items.insert(args.key.to_vec(), fresh);
                StoreStatus::Stored
            }
            Verb::Replace => match inner.live(args.key, now) {
                Some(item) => {
                    *item = fresh;
                    StoreStatus::Stored
                }
                None => StoreStatus::NotStored,
            },
            Verb::Append | Verb::Prepend => match inner.live(args.key, now) {
                Some(item) => {
                    if args.verb == Verb::Append {
                        item.data.extend_from_slice(args.data);
                    } else {
                        let mut data = args.data.to_vec();
                        data.extend_from_slice(&item.data);
                        item.data = data;
                    }
                    item.cas = cas;
                    StoreStatus::Stored
                }
                None => StoreStatus::NotStored,
            },
            Verb::Cas => match inner.live(args.key, now) {
                Some(item) if Some(item.cas) == args.cas => {
                    *item = fresh;
                    StoreStatus::Stored
                }
                Some(_) => StoreStatus::Exists,
                None => StoreStatus::NotFound,
            },
            _ => StoreStatus::NotStored,
        }
    }

    pub fn delete(&self, key: &[u8], now: Instant) -> bool {
        let mut inner = self.inner.lock();
        inner.live(key, now).is_some() && inner.items.remove(key).is_some()
    }

    /// incr wraps at 2^64; decr stops at zero.
    pub fn apply_delta(
        &self,
        verb: Verb,
        key: &[u8],
        delta: u64,
        now: Instant,
    ) -> Result<Option<u64>, CounterError> {
        let mut inner = self.inner.lock();
        let cas = inner.bump_cas();
        let item = match inner.live(key, now) {
            Some(item) => item,
            None => return Ok(None),
        };
        let current = parse_u64(&item.data).ok_or(CounterError::NonNumeric)?;
        let next = if verb == Verb::Incr {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        item.data = next.to_string().into_bytes();
        item.cas = cas;
        Ok(Some(next))
    }

    pub fn touch(&self, key: &[u8], exptime: u64, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.live(key, now) {
            Some(item) => {
                item.expires_at = deadline(exptime, now);
                true
            }
            None => false,
        }
    }

    pub fn flush_all(&self) {
        self.inner.lock().items.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Converts a wire `exptime` into a deadline.
fn deadline(exptime: u64, now: Instant) -> Option<Instant> {
    if exptime == 0 {
        return None;
    }
    if exptime <= MAX_RELATIVE_EXPIRY_SECS {
        return Some(now + Duration::from_secs(exptime));
    }
    let unix_now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    Some(now + Duration::from_secs(exptime.saturating_sub(unix_now)))
}
