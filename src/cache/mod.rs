//! Generic query cache for list views over server-held collections.
//!
//! This module is domain-agnostic. It provides:
//! - A keyed in-memory store with per-entry fetch status and staleness
//! - Observers that are notified on every write to the entry they watch
//! - A fetch controller with single-flight de-duplication, one retry on
//!   transient failures and a guard against out-of-order responses

mod controller;
mod lock;
pub(crate) mod store;
mod traits;

pub use controller::{fetcher, Disposition, FetchFuture, FetchOutcome, Fetcher, QueryController, SharedFetch};
pub use store::{CacheEntry, FetchStatus, QueryCacheStore};
pub use traits::{total_pages, Cacheable, PaginationMeta, QueryKey, QueryPage};

pub(crate) use lock::lock_or_recover;
