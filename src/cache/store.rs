//! In-memory query cache with per-signature observers.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::lock::lock_or_recover;
use super::traits::{Cacheable, PaginationMeta, QueryKey, QueryPage};
use crate::error::CacheError;

const SOURCE: &str = "cache::store";

/// Fetch lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
  #[default]
  Idle,
  /// First fetch in progress, no data yet
  Loading,
  /// Fetch in progress while previous data is still served
  Refetching,
  /// Last fetch failed after retries
  Error,
}

/// Stored result and metadata for one query signature.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<Q: QueryKey> {
  pub signature: Q,
  /// Results in server order
  pub items: Vec<Q::Entity>,
  pub pagination: Option<PaginationMeta>,
  pub status: FetchStatus,
  /// Set by invalidation; cleared by the next authoritative write
  pub stale: bool,
  /// Error of the last failed fetch
  pub error: Option<CacheError>,
  /// When data last arrived from the server. `None` until the first fetch resolves.
  pub fetched_at: Option<DateTime<Utc>>,
}

impl<Q: QueryKey> CacheEntry<Q> {
  /// An entry that has never received data.
  pub fn empty(signature: Q) -> Self {
    Self {
      signature,
      items: Vec::new(),
      pagination: None,
      status: FetchStatus::Idle,
      stale: false,
      error: None,
      fetched_at: None,
    }
  }

  /// An entry holding a freshly fetched page.
  pub fn resolved(signature: Q, page: QueryPage<Q::Entity>, fetched_at: DateTime<Utc>) -> Self {
    Self {
      signature,
      items: page.items,
      pagination: page.pagination,
      status: FetchStatus::Idle,
      stale: false,
      error: None,
      fetched_at: Some(fetched_at),
    }
  }

  pub fn has_data(&self) -> bool {
    self.fetched_at.is_some()
  }

  pub fn is_fetching(&self) -> bool {
    matches!(self.status, FetchStatus::Loading | FetchStatus::Refetching)
  }

  pub fn position(&self, id: &str) -> Option<usize> {
    self.items.iter().position(|item| item.cache_key() == id)
  }
}

type Channel<Q> = watch::Sender<Option<CacheEntry<Q>>>;

struct StoreState<Q: QueryKey> {
  entries: HashMap<Q, CacheEntry<Q>>,
  channels: HashMap<Q, Channel<Q>>,
  /// Bumped by `init`/`clear` so results from a previous session can be told apart.
  generation: u64,
}

impl<Q: QueryKey> StoreState<Q> {
  fn notify(&mut self, key: &Q) {
    let Some(tx) = self.channels.get(key) else {
      return;
    };
    if tx.receiver_count() == 0 {
      self.channels.remove(key);
      return;
    }
    tx.send_replace(self.entries.get(key).cloned());
  }
}

/// Keyed storage of cached results, one entry per query signature.
///
/// All operations run under a single mutex and never hold it across an
/// await point, so readers never see a partially applied write. No
/// operation fails: a missing entry is reported as `None`.
pub struct QueryCacheStore<Q: QueryKey> {
  state: Mutex<StoreState<Q>>,
}

impl<Q: QueryKey> Default for QueryCacheStore<Q> {
  fn default() -> Self {
    Self::new()
  }
}

impl<Q: QueryKey> QueryCacheStore<Q> {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(StoreState {
        entries: HashMap::new(),
        channels: HashMap::new(),
        generation: 0,
      }),
    }
  }

  /// Start a new session with an empty cache.
  pub fn init(&self) {
    self.reset("init");
  }

  /// Drop every entry (e.g. on logout). Live observers see `None`.
  pub fn clear(&self) {
    self.reset("clear");
  }

  fn reset(&self, op: &'static str) {
    let mut state = lock_or_recover(&self.state, SOURCE, op);
    state.entries.clear();
    state.generation += 1;
    state.channels.retain(|_, tx| tx.receiver_count() > 0);
    for tx in state.channels.values() {
      tx.send_replace(None);
    }
    debug!(generation = state.generation, op, "Cache reset");
  }

  pub fn generation(&self) -> u64 {
    lock_or_recover(&self.state, SOURCE, "generation").generation
  }

  pub fn get(&self, key: &Q) -> Option<CacheEntry<Q>> {
    lock_or_recover(&self.state, SOURCE, "get")
      .entries
      .get(key)
      .cloned()
  }

  /// Replace the entry for `entry.signature` and notify its observers.
  pub fn set(&self, entry: CacheEntry<Q>) {
    let mut state = lock_or_recover(&self.state, SOURCE, "set");
    let key = entry.signature.clone();
    debug!(query = %key.description(), items = entry.items.len(), "Cache write");
    state.entries.insert(key.clone(), entry);
    state.notify(&key);
  }

  /// Put snapshot `entries` back in one critical section.
  ///
  /// An entry whose current data was fetched after the snapshot is left
  /// alone: it is newer authoritative data. Nothing is restored if the
  /// store was reset since `generation`. Returns the signatures left alone.
  pub fn restore(&self, entries: impl IntoIterator<Item = CacheEntry<Q>>, generation: u64) -> Vec<Q> {
    let mut state = lock_or_recover(&self.state, SOURCE, "restore");
    if state.generation != generation {
      debug!(generation, current = state.generation, "Snapshot from an earlier session, not restored");
      return Vec::new();
    }

    let mut refreshed = Vec::new();
    for entry in entries {
      let key = entry.signature.clone();
      let newer = state
        .entries
        .get(&key)
        .is_some_and(|current| current.fetched_at > entry.fetched_at);
      if newer {
        refreshed.push(key);
        continue;
      }
      state.entries.insert(key.clone(), entry);
      state.notify(&key);
    }
    refreshed
  }

  /// Modify an existing entry in place. Returns `false` if absent.
  pub fn update(&self, key: &Q, f: impl FnOnce(&mut CacheEntry<Q>)) -> bool {
    let mut state = lock_or_recover(&self.state, SOURCE, "update");
    match state.entries.get_mut(key) {
      Some(entry) => {
        f(entry);
        state.notify(key);
        true
      }
      None => false,
    }
  }

  /// Modify the entry for `key`, creating an empty one first if needed.
  pub fn upsert(&self, key: &Q, f: impl FnOnce(&mut CacheEntry<Q>)) {
    let mut state = lock_or_recover(&self.state, SOURCE, "upsert");
    let entry = state
      .entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::empty(key.clone()));
    f(entry);
    state.notify(key);
  }

  /// Every cached (signature, entry) pair of a collection, ordered by key hash.
  pub fn variants(&self, collection: Q::Collection) -> Vec<(Q, CacheEntry<Q>)> {
    let state = lock_or_recover(&self.state, SOURCE, "variants");
    let mut variants: Vec<(Q, CacheEntry<Q>)> = state
      .entries
      .iter()
      .filter(|(key, _)| key.collection() == collection)
      .map(|(key, entry)| (key.clone(), entry.clone()))
      .collect();
    variants.sort_by_cached_key(|(key, _)| key.cache_hash());
    variants
  }

  /// Signatures of every cached entry of `collections`.
  pub fn keys(&self, collections: &[Q::Collection]) -> Vec<Q> {
    lock_or_recover(&self.state, SOURCE, "keys")
      .entries
      .keys()
      .filter(|key| collections.contains(&key.collection()))
      .cloned()
      .collect()
  }

  /// Copies of every entry of `collections`, taken in one critical section.
  pub fn snapshot(&self, collections: &[Q::Collection]) -> Vec<CacheEntry<Q>> {
    let state = lock_or_recover(&self.state, SOURCE, "snapshot");
    let mut entries: Vec<CacheEntry<Q>> = state
      .entries
      .values()
      .filter(|entry| collections.contains(&entry.signature.collection()))
      .cloned()
      .collect();
    entries.sort_by_cached_key(|entry| entry.signature.cache_hash());
    entries
  }

  /// Apply `f` to every entry of `collections` atomically.
  ///
  /// `f` returns whether it changed the entry; only changed entries notify.
  /// Returns the number of changed entries.
  pub fn update_variants(
    &self,
    collections: &[Q::Collection],
    mut f: impl FnMut(&mut CacheEntry<Q>) -> bool,
  ) -> usize {
    let mut state = lock_or_recover(&self.state, SOURCE, "update_variants");
    let keys: Vec<Q> = state
      .entries
      .keys()
      .filter(|key| collections.contains(&key.collection()))
      .cloned()
      .collect();

    let mut changed = 0;
    for key in keys {
      let touched = match state.entries.get_mut(&key) {
        Some(entry) => f(entry),
        None => false,
      };
      if touched {
        changed += 1;
        state.notify(&key);
      }
    }
    changed
  }

  /// Flag entries as no longer trustworthy. Missing keys are skipped.
  pub fn mark_stale(&self, keys: &[Q]) -> usize {
    let mut state = lock_or_recover(&self.state, SOURCE, "mark_stale");
    let mut marked = 0;
    for key in keys {
      if let Some(entry) = state.entries.get_mut(key) {
        entry.stale = true;
        marked += 1;
        state.notify(key);
      }
    }
    marked
  }

  /// Watch the entry for `key`. The receiver sees every subsequent write.
  pub fn subscribe(&self, key: &Q) -> watch::Receiver<Option<CacheEntry<Q>>> {
    let mut state = lock_or_recover(&self.state, SOURCE, "subscribe");
    let current = state.entries.get(key).cloned();
    state
      .channels
      .entry(key.clone())
      .or_insert_with(|| watch::channel(current).0)
      .subscribe()
  }

  /// Whether any observer currently watches `key`.
  pub fn is_observed(&self, key: &Q) -> bool {
    lock_or_recover(&self.state, SOURCE, "is_observed")
      .channels
      .get(key)
      .is_some_and(|tx| tx.receiver_count() > 0)
  }

  pub fn len(&self) -> usize {
    lock_or_recover(&self.state, SOURCE, "len").entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use sha2::{Digest, Sha256};

  #[derive(Debug, Clone, PartialEq)]
  pub struct Item {
    pub id: String,
    pub tag: String,
  }

  impl Cacheable for Item {
    type Patch = String;

    fn cache_key(&self) -> &str {
      &self.id
    }

    fn apply_patch(&mut self, patch: &String, _now: DateTime<Utc>) {
      self.tag = patch.clone();
    }
  }

  pub fn item(id: &str, tag: &str) -> Item {
    Item {
      id: id.to_string(),
      tag: tag.to_string(),
    }
  }

  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub enum Kind {
    Items,
    Others,
  }

  #[derive(Debug, Clone, PartialEq, Eq, Hash)]
  pub struct Key {
    pub kind: Kind,
    pub tag: Option<String>,
    pub page: u32,
  }

  impl QueryKey for Key {
    type Entity = Item;
    type Collection = Kind;

    fn collection(&self) -> Kind {
      self.kind
    }

    fn page(&self) -> u32 {
      self.page
    }

    fn matches(&self, entity: &Item) -> bool {
      self.tag.as_ref().map_or(true, |tag| *tag == entity.tag)
    }

    fn cache_hash(&self) -> String {
      let input = format!("{:?}:{:?}:{}", self.kind, self.tag, self.page);
      hex::encode(Sha256::digest(input.as_bytes()))
    }

    fn description(&self) -> String {
      format!("{:?} tag={:?} page={}", self.kind, self.tag, self.page)
    }
  }

  pub fn key(tag: Option<&str>, page: u32) -> Key {
    Key {
      kind: Kind::Items,
      tag: tag.map(String::from),
      page,
    }
  }

  pub fn page_of(items: Vec<Item>, limit: u32, total: u64) -> QueryPage<Item> {
    QueryPage::new(items, Some(PaginationMeta::new(1, limit, total)))
  }

  #[test]
  fn test_get_missing_is_none() {
    let store: QueryCacheStore<Key> = QueryCacheStore::new();
    assert!(store.get(&key(None, 1)).is_none());
    assert!(store.is_empty());
  }

  #[test]
  fn test_set_then_get() {
    let store = QueryCacheStore::new();
    let k = key(None, 1);
    let entry = CacheEntry::resolved(k.clone(), page_of(vec![item("a", "x")], 10, 1), Utc::now());
    store.set(entry.clone());
    assert_eq!(store.get(&k), Some(entry));
  }

  #[test]
  fn test_variants_are_scoped_to_collection() {
    let store = QueryCacheStore::new();
    store.set(CacheEntry::empty(key(None, 1)));
    store.set(CacheEntry::empty(key(Some("x"), 1)));
    store.set(CacheEntry::empty(Key {
      kind: Kind::Others,
      tag: None,
      page: 1,
    }));

    let variants = store.variants(Kind::Items);
    assert_eq!(variants.len(), 2);
    assert!(variants.iter().all(|(k, _)| k.kind == Kind::Items));
  }

  #[test]
  fn test_snapshot_spans_collections() {
    let store = QueryCacheStore::new();
    store.set(CacheEntry::empty(key(None, 1)));
    store.set(CacheEntry::empty(key(None, 2)));
    store.set(CacheEntry::empty(Key {
      kind: Kind::Others,
      tag: None,
      page: 1,
    }));

    assert_eq!(store.snapshot(&[Kind::Items]).len(), 2);
    assert_eq!(store.snapshot(&[Kind::Items, Kind::Others]).len(), 3);
    assert_eq!(store.keys(&[Kind::Others]).len(), 1);
  }

  #[test]
  fn test_mark_stale_skips_missing() {
    let store = QueryCacheStore::new();
    store.set(CacheEntry::empty(key(None, 1)));
    let marked = store.mark_stale(&[key(None, 1), key(Some("nope"), 1)]);
    assert_eq!(marked, 1);
    assert!(store.get(&key(None, 1)).is_some_and(|e| e.stale));
  }

  #[tokio::test]
  async fn test_subscriber_sees_writes() {
    let store = QueryCacheStore::new();
    let k = key(None, 1);
    let mut rx = store.subscribe(&k);
    assert!(store.is_observed(&k));
    assert!(rx.borrow().is_none());

    store.set(CacheEntry::resolved(k.clone(), page_of(vec![item("a", "x")], 10, 1), Utc::now()));
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow_and_update().as_ref().map(|e| e.items.len()), Some(1));

    drop(rx);
    assert!(!store.is_observed(&k));
  }

  #[tokio::test]
  async fn test_clear_notifies_and_bumps_generation() {
    let store = QueryCacheStore::new();
    let k = key(None, 1);
    store.set(CacheEntry::empty(k.clone()));
    let mut rx = store.subscribe(&k);
    let before = store.generation();

    store.clear();
    rx.changed().await.unwrap();
    assert!(rx.borrow().is_none());
    assert!(store.is_empty());
    assert_eq!(store.generation(), before + 1);
  }

  #[test]
  fn test_restore_skips_entries_fetched_since_snapshot() {
    let store = QueryCacheStore::new();
    let earlier = Utc::now() - chrono::Duration::seconds(10);
    let (a, b) = (key(None, 1), key(Some("x"), 1));
    store.set(CacheEntry::resolved(a.clone(), page_of(vec![item("a", "x")], 10, 1), earlier));
    store.set(CacheEntry::resolved(b.clone(), page_of(vec![item("b", "x")], 10, 1), earlier));
    let snapshot = store.snapshot(&[Kind::Items]);
    let generation = store.generation();

    store.update(&a, |entry| entry.items[0].tag = "speculative".into());
    let fresh = CacheEntry::resolved(b.clone(), page_of(vec![item("b", "server")], 10, 1), Utc::now());
    store.set(fresh.clone());

    assert_eq!(store.restore(snapshot, generation), vec![b.clone()]);
    assert_eq!(store.get(&a).unwrap().items[0], item("a", "x"));
    assert_eq!(store.get(&b), Some(fresh));
  }

  #[test]
  fn test_restore_after_clear_is_a_noop() {
    let store = QueryCacheStore::new();
    let k = key(None, 1);
    store.set(CacheEntry::resolved(k.clone(), page_of(vec![item("a", "x")], 10, 1), Utc::now()));
    let snapshot = store.snapshot(&[Kind::Items]);
    let generation = store.generation();

    store.clear();
    assert!(store.restore(snapshot, generation).is_empty());
    assert!(store.get(&k).is_none());
  }
}
