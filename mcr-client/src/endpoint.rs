//! # Endpoints
//!
//! An endpoint is one addressable cache server (`host:port`). Endpoints are
//! plain values: they are cloned into ring entries, pool handles and error
//! reports, and compared by host and port.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::ClientError;

/// Default memcached port, used when an address omits one.
pub const DEFAULT_PORT: u16 = 11211;

/// One cache server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Builds an endpoint from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the endpoint to socket addresses.
    ///
    /// Resolution happens on every connect so DNS changes are picked up by
    /// new connections.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        Ok((self.host.as_str(), self.port).to_socket_addrs()?.collect())
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    /// Parses `host:port`, `[v6]:port` or a bare host.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidAddress(s.to_string());
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid());
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail {
                "" => DEFAULT_PORT,
                tail => tail
                    .strip_prefix(':')
                    .and_then(|port| port.parse().ok())
                    .ok_or_else(invalid)?,
            };
            if host.is_empty() {
                return Err(invalid());
            }
            return Ok(Endpoint::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => Err(invalid()),
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().map_err(|_| invalid())?;
                Ok(Endpoint::new(host, port))
            }
            Some(_) => Err(invalid()),
            None => Ok(Endpoint::new(s, DEFAULT_PORT)),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Client-side view of an endpoint's recent behavior.
///
/// Health is advisory: routing never changes because of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointHealth {
    Healthy,
    /// The last operation exhausted its retries.
    Suspected,
    /// Several consecutive operations exhausted their retries.
    Down,
}

impl EndpointHealth {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            EndpointHealth::Healthy => 0,
            EndpointHealth::Suspected => 1,
            EndpointHealth::Down => 2,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => EndpointHealth::Healthy,
            1 => EndpointHealth::Suspected,
            _ => EndpointHealth::Down,
        }
    }
}
