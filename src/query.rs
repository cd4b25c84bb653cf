//! Live, re-render-triggering views over cached queries.
//!
//! Inspired by TanStack Query, a [`QueryObserver`] wraps a subscription to
//! one cache entry and exposes the familiar `data / isLoading / isFetching /
//! error` shape.
//!
//! # Example
//!
//! ```ignore
//! let mut issues = cache.observe(FleetQuery::issues(params));
//!
//! // In event loop tick
//! if issues.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! let view = issues.view();
//! if view.is_loading() {
//!     render_spinner();
//! } else if let Some(items) = view.data() {
//!     render_list(items);
//! }
//! ```

use tokio::sync::watch;

use crate::cache::{CacheEntry, PaginationMeta, QueryKey};
use crate::error::CacheError;

/// Snapshot of a query as a consumer renders it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryView<E> {
  data: Option<Vec<E>>,
  pagination: Option<PaginationMeta>,
  is_loading: bool,
  is_fetching: bool,
  is_stale: bool,
  error: Option<CacheError>,
}

impl<E: Clone> QueryView<E> {
  pub fn from_entry<Q: QueryKey<Entity = E>>(entry: Option<&CacheEntry<Q>>) -> Self {
    match entry {
      Some(entry) => Self {
        data: entry.has_data().then(|| entry.items.clone()),
        pagination: entry.pagination,
        is_loading: !entry.has_data() && entry.is_fetching(),
        is_fetching: entry.is_fetching(),
        is_stale: entry.stale,
        error: entry.error.clone(),
      },
      None => Self {
        data: None,
        pagination: None,
        is_loading: false,
        is_fetching: false,
        is_stale: false,
        error: None,
      },
    }
  }
}

impl<E> QueryView<E> {
  /// Items of the last known result (possibly speculative).
  pub fn data(&self) -> Option<&[E]> {
    self.data.as_deref()
  }

  pub fn into_data(self) -> Option<Vec<E>> {
    self.data
  }

  pub fn pagination(&self) -> Option<PaginationMeta> {
    self.pagination
  }

  /// First fetch in progress, nothing to show yet.
  pub fn is_loading(&self) -> bool {
    self.is_loading
  }

  /// Any fetch in progress, including background refetches.
  pub fn is_fetching(&self) -> bool {
    self.is_fetching
  }

  pub fn is_stale(&self) -> bool {
    self.is_stale
  }

  pub fn is_success(&self) -> bool {
    self.data.is_some() && self.error.is_none()
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }

  pub fn error(&self) -> Option<&CacheError> {
    self.error.as_ref()
  }

  fn is_settled(&self) -> bool {
    !self.is_fetching && (self.data.is_some() || self.error.is_some())
  }
}

/// Subscription to one query signature.
///
/// Dropping the observer stops observing; a fetch it started keeps running
/// but its result is no longer written for it.
pub struct QueryObserver<Q: QueryKey> {
  key: Q,
  rx: watch::Receiver<Option<CacheEntry<Q>>>,
}

impl<Q: QueryKey> QueryObserver<Q> {
  pub(crate) fn new(key: Q, rx: watch::Receiver<Option<CacheEntry<Q>>>) -> Self {
    Self { key, rx }
  }

  pub fn key(&self) -> &Q {
    &self.key
  }

  /// Current state of the query.
  pub fn view(&self) -> QueryView<Q::Entity> {
    QueryView::from_entry(self.rx.borrow().as_ref())
  }

  /// Check for a cache write since the last `poll`/`changed`.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    match self.rx.has_changed() {
      Ok(true) => {
        let _ = self.rx.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next cache write. Returns `false` once the store is gone.
  pub async fn changed(&mut self) -> bool {
    self.rx.changed().await.is_ok()
  }

  /// Wait until no fetch is running and there is data or an error to show.
  pub async fn settled(&mut self) -> QueryView<Q::Entity> {
    loop {
      let view = self.view();
      if view.is_settled() || !self.changed().await {
        return view;
      }
    }
  }
}

impl<Q: QueryKey> std::fmt::Debug for QueryObserver<Q> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key.description())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::tests::{item, key, page_of};
  use crate::cache::{FetchStatus, QueryCacheStore};
  use chrono::Utc;
  use std::time::Duration;

  #[test]
  fn test_absent_entry_view() {
    let view = QueryView::from_entry::<crate::cache::store::tests::Key>(None);
    assert!(view.data().is_none());
    assert!(!view.is_loading());
    assert!(!view.is_fetching());
  }

  #[test]
  fn test_loading_vs_refetching() {
    let mut entry = CacheEntry::empty(key(None, 1));
    entry.status = FetchStatus::Loading;
    let view = QueryView::from_entry(Some(&entry));
    assert!(view.is_loading());
    assert!(view.is_fetching());

    let mut entry = CacheEntry::resolved(key(None, 1), page_of(vec![item("a", "x")], 10, 1), Utc::now());
    entry.status = FetchStatus::Refetching;
    let view = QueryView::from_entry(Some(&entry));
    assert!(!view.is_loading());
    assert!(view.is_fetching());
    assert_eq!(view.data().map(|d| d.len()), Some(1));
  }

  #[tokio::test]
  async fn test_poll_reports_writes_once() {
    let store = QueryCacheStore::new();
    let k = key(None, 1);
    let mut observer = QueryObserver::new(k.clone(), store.subscribe(&k));
    assert!(!observer.poll());

    store.set(CacheEntry::resolved(k.clone(), page_of(vec![item("a", "x")], 10, 1), Utc::now()));
    assert!(observer.poll());
    assert!(!observer.poll());
    assert!(observer.view().is_success());
  }

  #[tokio::test]
  async fn test_settled_waits_for_data() {
    let store = std::sync::Arc::new(QueryCacheStore::new());
    let k = key(None, 1);
    let mut observer = QueryObserver::new(k.clone(), store.subscribe(&k));

    let writer = std::sync::Arc::clone(&store);
    let write_key = k.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      writer.set(CacheEntry::resolved(write_key, page_of(vec![item("a", "x")], 10, 1), Utc::now()));
    });

    let view = observer.settled().await;
    assert_eq!(view.data().map(|d| d.len()), Some(1));
  }
}
