// mcr-common - Shared types and wire codec for McRing
//
// This crate defines the key/value envelope and the text protocol framing
// used by the client and the loopback stub.

pub mod error;
pub mod protocol;
pub mod types;
pub mod verb;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
pub use verb::*;
