//! # Endpoint Ring
//!
//! Purpose: Map keys to endpoints with consistent hashing so that adding or
//! removing one endpoint only moves the keys that endpoint gains or loses.
//!
//! ## Design Principles
//! 1. **Virtual Points**: Every endpoint owns `points_per_endpoint` positions
//!    hashed from `"host:port-i"`, which evens out the key spread.
//! 2. **Immutable Snapshots**: Membership changes build a new sorted point
//!    table and swap it in; readers keep routing on the snapshot they hold.
//! 3. **Deterministic Ties**: Equal positions are ordered by endpoint, so
//!    every client with the same membership routes identically.
//!
//! ## Hashing
//!
//! ```text
//! position = fmix32(crc32(bytes))
//! route(k) = first point with position >= hash(k), wrapping to the first
//! ```

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::endpoint::Endpoint;

/// Ring positions per endpoint when not configured.
pub const DEFAULT_POINTS_PER_ENDPOINT: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Point {
    hash: u32,
    /// Index into `RingSnapshot::endpoints`, which is sorted.
    endpoint: usize,
}

/// Immutable view of the ring at one membership version.
#[derive(Debug, Default)]
pub struct RingSnapshot {
    endpoints: Vec<Endpoint>,
    points: Vec<Point>,
}

impl RingSnapshot {
    fn build(members: &BTreeSet<Endpoint>, points_per_endpoint: usize) -> Self {
        let endpoints: Vec<Endpoint> = members.iter().cloned().collect();
        let mut points = Vec::with_capacity(endpoints.len() * points_per_endpoint);
        let mut label = String::with_capacity(64);
        for (idx, endpoint) in endpoints.iter().enumerate() {
            for point in 0..points_per_endpoint {
                label.clear();
                let _ = write!(label, "{endpoint}-{point}");
                points.push(Point {
                    hash: hash_bytes(label.as_bytes()),
                    endpoint: idx,
                });
            }
        }
        points.sort_unstable();
        RingSnapshot { endpoints, points }
    }

    /// Endpoint that owns `key`, or `None` for an empty ring.
    pub fn route(&self, key: &[u8]) -> Option<&Endpoint> {
        if self.points.is_empty() {
            return None;
        }
        let hash = hash_bytes(key);
        let idx = self.points.partition_point(|point| point.hash < hash);
        let point = self.points.get(idx).unwrap_or(&self.points[0]);
        self.endpoints.get(point.endpoint)
    }

    /// Member endpoints in sorted order.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

struct RingState {
    members: BTreeSet<Endpoint>,
    snapshot: Arc<RingSnapshot>,
}

/// Consistent-hash ring of endpoints.
pub struct HashRing {
    points_per_endpoint: usize,
    state: RwLock<RingState>,
}

impl HashRing {
    pub fn new(points_per_endpoint: usize) -> Self {
        HashRing {
            points_per_endpoint: points_per_endpoint.max(1),
            state: RwLock::new(RingState {
                members: BTreeSet::new(),
                snapshot: Arc::new(RingSnapshot::default()),
            }),
        }
    }

    pub fn with_endpoints<I>(points_per_endpoint: usize, endpoints: I) -> Self
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let ring = HashRing::new(points_per_endpoint);
        {
            let mut state = ring.state.write();
            state.members.extend(endpoints);
            let snapshot = RingSnapshot::build(&state.members, ring.points_per_endpoint);
            state.snapshot = Arc::new(snapshot);
        }
        ring
    }

    /// Adds an endpoint; returns false if it was already a member.
    pub fn add_endpoint(&self, endpoint: Endpoint) -> bool {
        let mut state = self.state.write();
        if !state.members.insert(endpoint) {
            return false;
        }
        state.snapshot = Arc::new(RingSnapshot::build(&state.members, self.points_per_endpoint));
        true
    }

    /// Removes an endpoint; returns false if it was not a member.
    pub fn remove_endpoint(&self, endpoint: &Endpoint) -> bool {
        let mut state = self.state.write();
        if !state.members.remove(endpoint) {
            return false;
        }
        state.snapshot = Arc::new(RingSnapshot::build(&state.members, self.points_per_endpoint));
        true
    }

    /// Routes one key on the current snapshot.
    pub fn route(&self, key: &[u8]) -> Option<Endpoint> {
        self.snapshot().route(key).cloned()
    }

    /// Current snapshot; stays valid while membership changes.
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        Arc::clone(&self.state.read().snapshot)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.snapshot().endpoints().to_vec()
    }

    pub fn len(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ring hash of arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> u32 {
    fmix32(crc32fast::hash(data))
}

/// MurmurHash3 finalizer; spreads crc32's clustered outputs over the ring.
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
