//! Connection transports
//!
//! - [`memory`] - In-process duplex pair, used by tests and embedded peers
//! - [`framed`] - Length-prefixed JSON frames over any byte stream (TCP)

pub mod framed;
pub mod memory;

pub use framed::JsonFrameConnection;
pub use memory::{duplex, MemoryConnection};
