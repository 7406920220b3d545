//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API for a set of memcached-compatible
//! endpoints, hiding routing, pooling, framing and retries.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` owns the ring, one pool per endpoint and
//!    the idle reaper; callers only see keys and values.
//! 2. **Borrow-Friendly API**: Keys and values are taken as `AsRef<[u8]>`.
//! 3. **Typed Outcomes**: Absent keys, refused stores and CAS conflicts are
//!    values, never errors; errors always mean the call did not complete.
//! 4. **Bounded Retries**: Transport failures are retried on the same
//!    endpoint with a fresh connection; keys are never rerouted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Instant, SystemTime};

use mcr_common::{
    CacheKey, CacheValue, Expiry, Request, Response, ValueBlock, Verb, MAX_VALUE_SIZE,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::endpoint::{Endpoint, EndpointHealth};
use crate::error::{ClientError, ClientResult};
use crate::pool::{ConnectionPool, PoolStats, Reaper, ReaperHandle};
use crate::ring::HashRing;

/// Outcome of `add`, `replace`, `append` and `prepend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// The command's precondition failed (key exists for `add`, missing for
    /// the others).
    NotStored,
}

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Stored,
    /// The item changed since the token was read.
    Exists,
    NotFound,
}

/// Merged result of a multi-key get.
///
/// Keys missing from `values` were either absent on their endpoint or owned
/// by an endpoint listed in `errors`.
#[derive(Debug, Default)]
pub struct MultiGet {
    pub values: HashMap<Vec<u8>, CacheValue>,
    pub errors: Vec<(Endpoint, ClientError)>,
}

impl MultiGet {
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&CacheValue> {
        self.values.get(key.as_ref())
    }

    /// True when every endpoint answered.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Per-endpoint client state.
struct Node {
    endpoint: Endpoint,
    pool: ConnectionPool,
    health: AtomicU8,
    failures: AtomicU32,
}

impl Node {
    fn new(endpoint: Endpoint, config: &ClientConfig) -> Self {
        Node {
            pool: ConnectionPool::new(endpoint.clone(), config.pool_config()),
            endpoint,
            health: AtomicU8::new(EndpointHealth::Healthy.as_u8()),
            failures: AtomicU32::new(0),
        }
    }

    fn health(&self) -> EndpointHealth {
        EndpointHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    fn mark_healthy(&self) {
        self.failures.store(0, Ordering::Release);
        let previous = self
            .health
            .swap(EndpointHealth::Healthy.as_u8(), Ordering::AcqRel);
        if previous != EndpointHealth::Healthy.as_u8() {
            info!(endpoint = %self.endpoint, "endpoint recovered");
        }
    }

    fn mark_failed(&self, down_after: u32) -> EndpointHealth {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let health = if failures >= down_after {
            EndpointHealth::Down
        } else {
            EndpointHealth::Suspected
        };
        self.health.store(health.as_u8(), Ordering::Release);
        warn!(endpoint = %self.endpoint, failures, ?health, "endpoint exhausted its retries");
        health
    }
}

struct Shared {
    config: ClientConfig,
    ring: HashRing,
    nodes: RwLock<HashMap<Endpoint, Arc<Node>>>,
    closed: AtomicBool,
}

impl Shared {
    fn node(&self, endpoint: &Endpoint) -> Option<Arc<Node>> {
        self.nodes.read().get(endpoint).cloned()
    }

    /// Finds the node owning `key`.
    ///
    /// A removal can land between routing and the node lookup; routing once
    /// more then sees the new membership.
    fn locate(&self, key: &CacheKey) -> ClientResult<Arc<Node>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ClientClosed);
        }
        for _ in 0..2 {
            let endpoint = self.ring.route(key.as_bytes()).ok_or(ClientError::NoEndpoints)?;
            if let Some(node) = self.node(&endpoint) {
                return Ok(node);
            }
        }
        Err(ClientError::NoEndpoints)
    }

    fn all_nodes(&self) -> ClientResult<Vec<Arc<Node>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ClientClosed);
        }
        let nodes = self.nodes.read();
        let mut all: Vec<Arc<Node>> = nodes.values().cloned().collect();
        if all.is_empty() {
            return Err(ClientError::NoEndpoints);
        }
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        Ok(all)
    }

    fn reap_idle(&self) {
        let now = Instant::now();
        let nodes: Vec<Arc<Node>> = self.nodes.read().values().cloned().collect();
        for node in nodes {
            node.pool.reap_idle(now);
        }
    }

    /// Sends one request to `node`, applying the retry policy.
    fn dispatch(&self, node: &Node, request: &Request) -> ClientResult<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt(node, request) {
                Ok(response) => {
                    node.mark_healthy();
                    return Ok(response);
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            // Siblings of a failed socket are suspect too.
            node.pool.purge_idle();

            if attempt > self.config.retry_count {
                node.mark_failed(self.config.down_after);
                return Err(ClientError::EndpointUnavailable {
                    endpoint: node.endpoint.clone(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            warn!(
                endpoint = %node.endpoint,
                verb = %request.verb(),
                attempt,
                error = %err,
                "request failed, retrying on a fresh connection"
            );
        }
    }

    fn attempt(&self, node: &Node, request: &Request) -> ClientResult<Response> {
        let mut conn = node.pool.acquire(self.config.acquire_timeout)?;
        // Error lines leave the stream in sync; the connection goes back.
        match conn.execute(request, self.config.io_timeout)? {
            Response::ServerError(message) => Err(ClientError::Server { message }),
            response => Ok(response),
        }
    }
}

/// Blocking memcached client over a consistent-hash ring of endpoints.
///
/// `Client` is `Send + Sync`; share it with `Arc<Client>`.
pub struct Client {
    shared: Arc<Shared>,
    reaper: Mutex<Option<ReaperHandle>>,
}

impl Client {
    /// Builds a client; connections are opened lazily on first use.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let endpoints = config.parsed_endpoints()?;
        if endpoints.is_empty() {
            return Err(ClientError::NoEndpoints);
        }

        let nodes = endpoints
            .iter()
            .map(|endpoint| (endpoint.clone(), Arc::new(Node::new(endpoint.clone(), &config))))
            .collect();
        let shared = Arc::new(Shared {
            ring: HashRing::with_endpoints(config.points_per_endpoint, endpoints),
            nodes: RwLock::new(nodes),
            closed: AtomicBool::new(false),
            config,
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let reaper = Reaper::spawn(shared.config.reap_interval, move || match weak.upgrade() {
            Some(shared) => {
                shared.reap_idle();
                true
            }
            None => false,
        })
        .map_err(|err| ClientError::Config(format!("cannot start idle reaper: {err}")))?;

        debug!(endpoints = shared.ring.len(), "client started");
        Ok(Client {
            shared,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Builds a client for `addrs` with default settings.
    pub fn connect<I, S>(addrs: I) -> ClientResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Client::new(ClientConfig::builder().endpoints(addrs).build())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------------

    /// Stores `value` unconditionally.
    pub fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        expiry: Expiry,
    ) -> ClientResult<()> {
        match self.store(Verb::Set, key, value, flags, expiry, None)? {
            Response::Stored => Ok(()),
            _ => Err(ClientError::UnexpectedResponse { verb: Verb::Set }),
        }
    }

    /// Stores only if the key is absent.
    pub fn add(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        expiry: Expiry,
    ) -> ClientResult<StoreOutcome> {
        let response = self.store(Verb::Add, key, value, flags, expiry, None)?;
        store_outcome(Verb::Add, response)
    }

    /// Stores only if the key is present.
    pub fn replace(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        expiry: Expiry,
    ) -> ClientResult<StoreOutcome> {
        let response = self.store(Verb::Replace, key, value, flags, expiry, None)?;
        store_outcome(Verb::Replace, response)
    }

    /// Appends bytes to an existing value; flags and expiry are unchanged.
    pub fn append(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> ClientResult<StoreOutcome> {
        let response = self.store(Verb::Append, key, value, 0, Expiry::Never, None)?;
        store_outcome(Verb::Append, response)
    }

    /// Prepends bytes to an existing value; flags and expiry are unchanged.
    pub fn prepend(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> ClientResult<StoreOutcome> {
        let response = self.store(Verb::Prepend, key, value, 0, Expiry::Never, None)?;
        store_outcome(Verb::Prepend, response)
    }

    /// Stores only if the item still carries `token` (from `gets`).
    pub fn cas(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        expiry: Expiry,
        token: u64,
    ) -> ClientResult<CasOutcome> {
        match self.store(Verb::Cas, key, value, flags, expiry, Some(token))? {
            Response::Stored => Ok(CasOutcome::Stored),
            Response::Exists => Ok(CasOutcome::Exists),
            Response::NotFound => Ok(CasOutcome::NotFound),
            _ => Err(ClientError::UnexpectedResponse { verb: Verb::Cas }),
        }
    }

    fn store(
        &self,
        verb: Verb,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        expiry: Expiry,
        cas: Option<u64>,
    ) -> ClientResult<Response> {
        let key = CacheKey::new(key)?;
        let value = value.as_ref();
        if value.len() > MAX_VALUE_SIZE {
            return Err(ClientError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        let node = self.shared.locate(&key)?;
        let exptime = expiry.to_wire(SystemTime::now());
        let request = Request::store(verb, key, flags, exptime, value, cas);
        self.shared.dispatch(&node, &request)
    }

    // ------------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------------

    /// Fetches one value; `None` when the key is absent.
    pub fn get(&self, key: impl AsRef<[u8]>) -> ClientResult<Option<CacheValue>> {
        self.retrieve_one(Verb::Get, key)
    }

    /// Like `get`, but the value carries its CAS token.
    pub fn gets(&self, key: impl AsRef<[u8]>) -> ClientResult<Option<CacheValue>> {
        self.retrieve_one(Verb::Gets, key)
    }

    fn retrieve_one(&self, verb: Verb, key: impl AsRef<[u8]>) -> ClientResult<Option<CacheValue>> {
        let key = CacheKey::new(key)?;
        let node = self.shared.locate(&key)?;
        let request = Request::retrieve(verb, vec![key]);
        match self.shared.dispatch(&node, &request)? {
            Response::Values(blocks) => Ok(blocks.into_iter().next().map(into_value)),
            _ => Err(ClientError::UnexpectedResponse { verb }),
        }
    }

    /// Fetches many keys with one batched `get` per endpoint.
    ///
    /// Endpoints are queried in parallel. A failing endpoint is reported in
    /// `MultiGet::errors` and does not fail the call; invalid keys do.
    pub fn get_multi<I, K>(&self, keys: I) -> ClientResult<MultiGet>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ClientError::ClientClosed);
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for key in keys {
            let key = CacheKey::new(key)?;
            if seen.insert(key.clone()) {
                unique.push(key);
            }
        }

        let mut result = MultiGet::default();
        if unique.is_empty() {
            return Ok(result);
        }

        // One snapshot for the whole batch so every key sees one membership.
        let snapshot = self.shared.ring.snapshot();
        let mut groups: BTreeMap<Endpoint, Vec<CacheKey>> = BTreeMap::new();
        for key in unique {
            let endpoint = snapshot.route(key.as_bytes()).ok_or(ClientError::NoEndpoints)?;
            groups.entry(endpoint.clone()).or_default().push(key);
        }

        let fetch = |endpoint: &Endpoint, keys: Vec<CacheKey>| -> ClientResult<Vec<ValueBlock>> {
            let node = self.shared.node(endpoint).ok_or(ClientError::NoEndpoints)?;
            match self.shared.dispatch(&node, &Request::retrieve(Verb::Get, keys))? {
                Response::Values(blocks) => Ok(blocks),
                _ => Err(ClientError::UnexpectedResponse { verb: Verb::Get }),
            }
        };

        let outcomes: Vec<(Endpoint, ClientResult<Vec<ValueBlock>>)> = if groups.len() == 1 {
            groups
                .into_iter()
                .map(|(endpoint, keys)| {
                    let outcome = fetch(&endpoint, keys);
                    (endpoint, outcome)
                })
                .collect()
        } else {
            thread::scope(|scope| {
                let handles: Vec<_> = groups
                    .into_iter()
                    .map(|(endpoint, keys)| {
                        let fetch = &fetch;
                        scope.spawn(move || {
                            let outcome = fetch(&endpoint, keys);
                            (endpoint, outcome)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                    })
                    .collect()
            })
        };

        for (endpoint, outcome) in outcomes {
            match outcome {
                Ok(blocks) => {
                    for block in blocks {
                        result.values.insert(block.key.clone(), into_value(block));
                    }
                }
                Err(err) => {
                    warn!(%endpoint, error = %err, "multi-get batch failed");
                    result.errors.push((endpoint, err));
                }
            }
        }
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Removal, counters, expiry
    // ------------------------------------------------------------------------

    /// Deletes a key; `false` when it was absent.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> ClientResult<bool> {
        let key = CacheKey::new(key)?;
        let node = self.shared.locate(&key)?;
        match self.shared.dispatch(&node, &Request::Delete { key })? {
            Response::Deleted => Ok(true),
            Response::NotFound => Ok(false),
            _ => Err(ClientError::UnexpectedResponse { verb: Verb::Delete }),
        }
    }

    /// Adds `delta` to a decimal counter; `None` when the key is absent.
    ///
    /// The server wraps at 2^64.
    pub fn increment(&self, key: impl AsRef<[u8]>, delta: u64) -> ClientResult<Option<u64>> {
        self.arithmetic(Verb::Incr, key, delta)
    }

    /// Subtracts `delta` from a decimal counter, saturating at zero.
    pub fn decrement(&self, key: impl AsRef<[u8]>, delta: u64) -> ClientResult<Option<u64>> {
        self.arithmetic(Verb::Decr, key, delta)
    }

    fn arithmetic(
        &self,
        verb: Verb,
        key: impl AsRef<[u8]>,
        delta: u64,
    ) -> ClientResult<Option<u64>> {
        let key = CacheKey::new(key)?;
        let node = self.shared.locate(&key)?;
        let request = Request::Arithmetic { verb, key, delta };
        match self.shared.dispatch(&node, &request)? {
            Response::Number(value) => Ok(Some(value)),
            Response::NotFound => Ok(None),
            _ => Err(ClientError::UnexpectedResponse { verb }),
        }
    }

    /// Updates the expiry of an existing key; `false` when it was absent.
    pub fn touch(&self, key: impl AsRef<[u8]>, expiry: Expiry) -> ClientResult<bool> {
        let key = CacheKey::new(key)?;
        let node = self.shared.locate(&key)?;
        let exptime = expiry.to_wire(SystemTime::now());
        match self.shared.dispatch(&node, &Request::Touch { key, exptime })? {
            Response::Touched => Ok(true),
            Response::NotFound => Ok(false),
            _ => Err(ClientError::UnexpectedResponse { verb: Verb::Touch }),
        }
    }

    // ------------------------------------------------------------------------
    // Whole-cluster commands
    // ------------------------------------------------------------------------

    /// Server version of every endpoint, in endpoint order.
    pub fn version(&self) -> ClientResult<Vec<(Endpoint, String)>> {
        self.shared
            .all_nodes()?
            .into_iter()
            .map(|node| match self.shared.dispatch(&node, &Request::Version)? {
                Response::Version(version) => Ok((node.endpoint.clone(), version)),
                _ => Err(ClientError::UnexpectedResponse {
                    verb: Verb::Version,
                }),
            })
            .collect()
    }

    /// Invalidates every item on every endpoint.
    ///
    /// All endpoints are attempted; the first failure is returned.
    pub fn flush_all(&self) -> ClientResult<()> {
        let mut first_err = None;
        for node in self.shared.all_nodes()? {
            let outcome = match self.shared.dispatch(&node, &Request::FlushAll) {
                Ok(Response::Ok) => Ok(()),
                Ok(_) => Err(ClientError::UnexpectedResponse {
                    verb: Verb::FlushAll,
                }),
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                warn!(endpoint = %node.endpoint, error = %err, "flush_all failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // ------------------------------------------------------------------------
    // Membership and introspection
    // ------------------------------------------------------------------------

    /// Adds an endpoint to the ring; returns false if already present.
    pub fn add_endpoint(&self, addr: &str) -> ClientResult<bool> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ClientError::ClientClosed);
        }
        let endpoint: Endpoint = addr.parse()?;
        {
            let mut nodes = self.shared.nodes.write();
            if nodes.contains_key(&endpoint) {
                return Ok(false);
            }
            let node = Arc::new(Node::new(endpoint.clone(), &self.shared.config));
            nodes.insert(endpoint.clone(), node);
        }
        // The node exists before any key can route to it.
        self.shared.ring.add_endpoint(endpoint.clone());
        info!(%endpoint, "endpoint added");
        Ok(true)
    }

    /// Removes an endpoint and closes its pool; returns false if unknown.
    pub fn remove_endpoint(&self, endpoint: &Endpoint) -> bool {
        if !self.shared.ring.remove_endpoint(endpoint) {
            return false;
        }
        let node = self.shared.nodes.write().remove(endpoint);
        if let Some(node) = node {
            node.pool.close();
        }
        info!(%endpoint, "endpoint removed");
        true
    }

    /// Endpoint that currently owns `key`.
    pub fn route(&self, key: impl AsRef<[u8]>) -> ClientResult<Endpoint> {
        let key = CacheKey::new(key)?;
        self.shared.ring.route(key.as_bytes()).ok_or(ClientError::NoEndpoints)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.shared.ring.endpoints()
    }

    pub fn endpoint_health(&self, endpoint: &Endpoint) -> Option<EndpointHealth> {
        self.shared.node(endpoint).map(|node| node.health())
    }

    pub fn pool_stats(&self, endpoint: &Endpoint) -> Option<PoolStats> {
        self.shared.node(endpoint).map(|node| node.pool.stats())
    }

    /// Stops the reaper and closes every pooled connection.
    ///
    /// Idempotent. Calls made afterwards fail with `ClientClosed`.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut reaper) = self.reaper.lock().take() {
            reaper.stop();
        }
        for node in self.shared.nodes.read().values() {
            node.pool.close();
        }
        debug!("client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn store_outcome(verb: Verb, response: Response) -> ClientResult<StoreOutcome> {
    match response {
        Response::Stored => Ok(StoreOutcome::Stored),
        Response::NotStored => Ok(StoreOutcome::NotStored),
        _ => Err(ClientError::UnexpectedResponse { verb }),
    }
}

fn into_value(block: ValueBlock) -> CacheValue {
    CacheValue {
        data: block.data,
        flags: block.flags,
        cas: block.cas,
    }
}
