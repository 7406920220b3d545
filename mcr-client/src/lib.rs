//! # McRing Sync Client
//!
//! Purpose: Provide a synchronous memcached text-protocol client that spreads
//! keys over several servers with consistent hashing and pools connections
//! per server.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Stable Routing**: A key always maps to the same endpoint for a given
//!    membership; failures never reroute it.
//! 3. **Minimal Allocation**: Reuse buffers for framing and parsing.
//! 4. **Explicit Lifecycle**: `Client::close` (or drop) stops the reaper and
//!    releases every pooled connection.
//!
//! ```no_run
//! use mcr_client::{Client, Expiry};
//!
//! # fn main() -> Result<(), mcr_client::ClientError> {
//! let client = Client::connect(["10.0.0.1:11211", "10.0.0.2:11211"])?;
//! client.set("user:1", b"alice", 0, Expiry::from_secs(60))?;
//! let value = client.get("user:1")?;
//! assert_eq!(value.map(|v| v.data), Some(b"alice".to_vec()));
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod endpoint;
mod error;
mod pool;
mod ring;

pub use client::{CasOutcome, Client, MultiGet, StoreOutcome};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use connection::Connection;
pub use endpoint::{Endpoint, EndpointHealth, DEFAULT_PORT};
pub use error::{ClientError, ClientResult};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use ring::{HashRing, RingSnapshot, DEFAULT_POINTS_PER_ENDPOINT};

pub use mcr_common::{CacheKey, CacheValue, Expiry, KeyError, ProtocolError, Verb};
