//! Transport layer for consensus RPC communication
//!
//! - `InMemoryTransport`: Channel-based transport for testing

pub mod inmemory;
pub mod traits;

pub use traits::{Transport, TransportError};
