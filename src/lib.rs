//! Cache-consistency layer for the fleet maintenance API.
//!
//! Reads go through a query cache that de-duplicates fetches and discards
//! out-of-order responses. Writes are applied optimistically to every cached
//! list they affect and rolled back as a whole if the server rejects them.

pub mod cache;
pub mod config;
pub mod error;
pub mod fleet;
pub mod logging;
pub mod mutation;
pub mod query;
pub mod session;
pub mod transport;

pub use error::CacheError;
