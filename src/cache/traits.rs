//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::hash::Hash;

/// Trait for entities that can live in a cached list.
///
/// Implementors must provide a stable unique key; no two items with the
/// same key may appear in one cache entry.
pub trait Cacheable: Clone + Debug + PartialEq + Send + Sync + 'static {
  /// Partial update that can be merged into an entity.
  type Patch: Clone + Debug + Send + Sync + 'static;

  /// Unique identifier for this entity (e.g., vessel id, issue id)
  fn cache_key(&self) -> &str;

  /// Shallow-merge the supplied fields and stamp the modification time.
  fn apply_patch(&mut self, patch: &Self::Patch, now: DateTime<Utc>);
}

/// Identity of a cached query.
///
/// Two keys describing the same logical query must compare equal (and hash
/// equally) however the caller assembled their parameters, so keys are
/// expected to hold normalized parameters.
pub trait QueryKey: Clone + Debug + Eq + Hash + Send + Sync + 'static {
  /// Entity stored in results of this query.
  type Entity: Cacheable;
  /// Name of the server-held collection a query reads from.
  type Collection: Copy + Debug + Eq + Hash + Send + Sync + 'static;

  fn collection(&self) -> Self::Collection;

  /// 1-based page this query asks for.
  fn page(&self) -> u32;

  /// Whether `entity` would appear under this query's filter.
  fn matches(&self, entity: &Self::Entity) -> bool;

  /// Whether `other` is the same cached query.
  fn same_signature(&self, other: &Self) -> bool {
    self == other
  }

  /// Stable, fixed-length hash for the key.
  fn cache_hash(&self) -> String;

  /// Human readable description for logs.
  fn description(&self) -> String;
}

/// Pagination metadata reported by the server for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationMeta {
  pub page: u32,
  pub limit: u32,
  pub total: u64,
  pub total_pages: u64,
}

impl PaginationMeta {
  pub fn new(page: u32, limit: u32, total: u64) -> Self {
    Self {
      page,
      limit,
      total,
      total_pages: total_pages(total, limit),
    }
  }

  /// Counts after one item was added to the result set.
  pub fn incremented(self) -> Self {
    Self::new(self.page, self.limit, self.total + 1)
  }

  /// Counts after one item was removed; `total` never drops below zero.
  pub fn decremented(self) -> Self {
    Self::new(self.page, self.limit, self.total.saturating_sub(1))
  }
}

/// `max(ceil(total / limit), 1)`. A zero limit is treated as a single page.
pub fn total_pages(total: u64, limit: u32) -> u64 {
  if limit == 0 {
    return 1;
  }
  total.div_ceil(u64::from(limit)).max(1)
}

/// One page of results as returned by a fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage<T> {
  pub items: Vec<T>,
  pub pagination: Option<PaginationMeta>,
}

impl<T> QueryPage<T> {
  pub fn new(items: Vec<T>, pagination: Option<PaginationMeta>) -> Self {
    Self { items, pagination }
  }

  pub fn map<U>(self, f: impl FnMut(T) -> U) -> QueryPage<U> {
    QueryPage {
      items: self.items.into_iter().map(f).collect(),
      pagination: self.pagination,
    }
  }
}
