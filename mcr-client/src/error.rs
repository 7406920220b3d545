//! Error types for the cache client.
//!
//! Every public call returns a value, an explicit absent outcome, or one of
//! these errors.

use mcr_common::{KeyError, ProtocolError, Verb};
use thiserror::Error;

use crate::endpoint::Endpoint;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client, pool and connections.
#[derive(Debug, Error)]
pub enum ClientError {
    // -------------------------------------------------------------------------
    // Transport errors (retried by the client)
    // -------------------------------------------------------------------------
    #[error("cannot connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out waiting for {endpoint}")]
    Timeout { endpoint: Endpoint },

    #[error("connection to {endpoint} broken: {reason}")]
    BrokenConnection { endpoint: Endpoint, reason: String },

    // -------------------------------------------------------------------------
    // Terminal errors
    // -------------------------------------------------------------------------
    #[error("protocol error from {endpoint}: {source}")]
    Protocol {
        endpoint: Endpoint,
        #[source]
        source: ProtocolError,
    },

    #[error("connection pool for {endpoint} exhausted")]
    PoolExhausted { endpoint: Endpoint },

    #[error("endpoint {endpoint} unavailable after {attempts} attempts")]
    EndpointUnavailable {
        endpoint: Endpoint,
        attempts: usize,
        #[source]
        last: Box<ClientError>,
    },

    #[error("server error: {message}")]
    Server { message: String },

    #[error("unexpected response to {verb}")]
    UnexpectedResponse { verb: Verb },

    // -------------------------------------------------------------------------
    // Caller errors
    // -------------------------------------------------------------------------
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("value is {len} bytes, limit is {max}")]
    ValueTooLarge { len: usize, max: usize },

    #[error("invalid endpoint address {0:?}")]
    InvalidAddress(String),

    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("client is closed")]
    ClientClosed,
}

impl ClientError {
    /// True for failures that leave the endpoint worth another attempt on a
    /// fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::Timeout { .. }
                | ClientError::BrokenConnection { .. }
        )
    }

    /// Endpoint the error is attributed to, when there is one.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            ClientError::Connect { endpoint, .. }
            | ClientError::Timeout { endpoint }
            | ClientError::BrokenConnection { endpoint, .. }
            | ClientError::Protocol { endpoint, .. }
            | ClientError::PoolExhausted { endpoint }
            | ClientError::EndpointUnavailable { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }
}
