//! Optimistic mutations with all-or-nothing rollback.
//!
//! A mutation moves through `Pending -> AppliedOptimistic -> Settled` on
//! success or `... -> RolledBack` on failure. The states are types:
//! [`MutationCoordinator::begin`] returns a [`PendingMutation`], `apply`
//! consumes it into an [`AppliedMutation`], and `commit`/`abort` consume
//! that. An applied mutation dropped without settling is rolled back.

use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::invalidation::{InvalidationPropagator, InvalidationReport};
use super::optimistic::{apply_to_entry, Optimistic};
use super::serial::{EntityGuard, EntityLocks};
use crate::cache::{CacheEntry, QueryController, QueryKey};
use crate::error::CacheError;

/// Lifecycle state of a mutation, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
  Pending,
  AppliedOptimistic,
  Settled,
  RolledBack,
}

/// What a mutation writes and where.
#[derive(Debug, Clone)]
pub struct MutationScope<C> {
  /// Serialization key of the written entity, e.g. `issue:42`
  pub entity: String,
  /// Collection the server-side write lands in; drives invalidation
  pub target: C,
  /// Collections whose cached variants receive the optimistic write
  pub touched: Vec<C>,
}

impl<C: Copy + PartialEq> MutationScope<C> {
  pub fn new(entity: impl Into<String>, target: C) -> Self {
    Self {
      entity: entity.into(),
      target,
      touched: vec![target],
    }
  }

  /// Also apply the optimistic write to `collection`.
  pub fn touching(mut self, collection: C) -> Self {
    if !self.touched.contains(&collection) {
      self.touched.push(collection);
    }
    self
  }
}

/// Entries as they were right before the optimistic write.
#[derive(Debug, Clone)]
pub struct MutationSnapshot<Q: QueryKey> {
  entries: Vec<CacheEntry<Q>>,
}

impl<Q: QueryKey> MutationSnapshot<Q> {
  pub fn entries(&self) -> &[CacheEntry<Q>] {
    &self.entries
  }

  pub fn signatures(&self) -> Vec<Q> {
    self.entries.iter().map(|entry| entry.signature.clone()).collect()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

struct MutationContext<Q: QueryKey> {
  id: u64,
  scope: MutationScope<Q::Collection>,
  snapshot: MutationSnapshot<Q>,
  /// Store generation the snapshot was taken in
  generation: u64,
  coordinator: MutationCoordinator<Q>,
  _guard: EntityGuard,
}

impl<Q: QueryKey> MutationContext<Q> {
  /// Put the snapshot back, except entries the server refreshed meanwhile.
  fn restore(&self) {
    let kept = self
      .coordinator
      .controller
      .store()
      .restore(self.snapshot.entries.iter().cloned(), self.generation);
    warn!(
      mutation = self.id,
      entity = %self.scope.entity,
      restored = self.snapshot.len() - kept.len(),
      kept = kept.len(),
      state = ?MutationState::RolledBack,
      "Rolled back optimistic write"
    );
  }
}

/// Applies speculative writes and settles them against the server outcome.
pub struct MutationCoordinator<Q: QueryKey> {
  controller: QueryController<Q>,
  propagator: InvalidationPropagator<Q>,
  locks: EntityLocks,
  next_id: Arc<AtomicU64>,
}

impl<Q: QueryKey> Clone for MutationCoordinator<Q> {
  fn clone(&self) -> Self {
    Self {
      controller: self.controller.clone(),
      propagator: self.propagator.clone(),
      locks: self.locks.clone(),
      next_id: Arc::clone(&self.next_id),
    }
  }
}

impl<Q: QueryKey> MutationCoordinator<Q> {
  pub fn new(controller: QueryController<Q>, propagator: InvalidationPropagator<Q>) -> Self {
    Self {
      controller,
      propagator,
      locks: EntityLocks::new(),
      next_id: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn propagator(&self) -> &InvalidationPropagator<Q> {
    &self.propagator
  }

  /// Start a mutation.
  ///
  /// Waits for earlier mutations of the same entity to settle, stops
  /// in-flight fetches on the touched collections from landing, and takes
  /// the snapshot.
  pub async fn begin(&self, scope: MutationScope<Q::Collection>) -> PendingMutation<Q> {
    let guard = self.locks.acquire(&scope.entity).await;
    let generation = self.controller.store().generation();
    let entries = self.controller.quiesce(&scope.touched);
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

    debug!(
      mutation = id,
      entity = %scope.entity,
      snapshot = entries.len(),
      state = ?MutationState::Pending,
      "Mutation started"
    );

    PendingMutation {
      ctx: MutationContext {
        id,
        scope,
        snapshot: MutationSnapshot { entries },
        generation,
        coordinator: self.clone(),
        _guard: guard,
      },
    }
  }

  /// Run a whole mutation: optimistic write, then `request`, then settle.
  ///
  /// `request` is only called after the optimistic write is in the cache.
  /// On failure the snapshot is restored before the error is returned.
  pub async fn mutate<T, F, Fut>(
    &self,
    scope: MutationScope<Q::Collection>,
    op: Optimistic<Q::Entity>,
    request: F,
  ) -> Result<T, CacheError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
  {
    let applied = self.begin(scope).await.apply(op);
    match request().await {
      Ok(confirmed) => {
        applied.commit();
        Ok(confirmed)
      }
      Err(err) => Err(applied.abort(err)),
    }
  }
}

/// A mutation whose snapshot is taken but nothing is written yet.
pub struct PendingMutation<Q: QueryKey> {
  ctx: MutationContext<Q>,
}

impl<Q: QueryKey> PendingMutation<Q> {
  pub fn id(&self) -> u64 {
    self.ctx.id
  }

  pub fn state(&self) -> MutationState {
    MutationState::Pending
  }

  pub fn snapshot(&self) -> &MutationSnapshot<Q> {
    &self.ctx.snapshot
  }

  /// Write `op` into every cached variant of the touched collections.
  pub fn apply(self, op: Optimistic<Q::Entity>) -> AppliedMutation<Q> {
    let ctx = self.ctx;
    let now = Utc::now();
    let changed = ctx
      .coordinator
      .controller
      .store()
      .update_variants(&ctx.scope.touched, |entry| apply_to_entry(entry, &op, now));

    debug!(
      mutation = ctx.id,
      entity = %ctx.scope.entity,
      op = op.kind(),
      changed,
      state = ?MutationState::AppliedOptimistic,
      "Applied optimistic write"
    );

    AppliedMutation { ctx: Some(ctx) }
  }
}

/// A mutation whose speculative write is visible in the cache.
pub struct AppliedMutation<Q: QueryKey> {
  ctx: Option<MutationContext<Q>>,
}

impl<Q: QueryKey> AppliedMutation<Q> {
  pub fn state(&self) -> MutationState {
    MutationState::AppliedOptimistic
  }

  pub fn snapshot(&self) -> Option<&MutationSnapshot<Q>> {
    self.ctx.as_ref().map(|ctx| &ctx.snapshot)
  }

  /// The server confirmed the write: keep it and invalidate dependents.
  pub fn commit(mut self) -> InvalidationReport {
    let Some(ctx) = self.ctx.take() else {
      return InvalidationReport::default();
    };
    let report = ctx.coordinator.propagator.on_settled(ctx.scope.target);
    info!(
      mutation = ctx.id,
      entity = %ctx.scope.entity,
      marked = report.marked,
      state = ?MutationState::Settled,
      "Mutation settled"
    );
    report
  }

  /// The server rejected the write: restore the snapshot and hand `err` back.
  ///
  /// A conflict means the snapshot itself may be outdated, so the target
  /// collection and its dependents are invalidated on top of the restore.
  /// Other failures only revalidate restored entries that were already stale.
  pub fn abort(mut self, err: CacheError) -> CacheError {
    let Some(ctx) = self.ctx.take() else {
      return err;
    };
    warn!(mutation = ctx.id, entity = %ctx.scope.entity, error = %err, "Mutation failed");
    ctx.restore();

    if err.is_conflict() {
      ctx.coordinator.propagator.on_settled(ctx.scope.target);
    } else {
      ctx.coordinator.propagator.revalidate(&ctx.snapshot.signatures());
    }
    err
  }
}

impl<Q: QueryKey> Drop for AppliedMutation<Q> {
  fn drop(&mut self) {
    if let Some(ctx) = self.ctx.take() {
      warn!(mutation = ctx.id, "Mutation dropped before settling");
      ctx.restore();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::tests::{item, key, page_of, Item, Key, Kind};
  use crate::cache::{FetchStatus, PaginationMeta, QueryCacheStore, QueryPage};
  use crate::mutation::DependencyTable;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;
  use tokio::sync::oneshot;

  fn coordinator() -> MutationCoordinator<Key> {
    let controller = QueryController::new(Arc::new(QueryCacheStore::new())).with_retry_delay(Duration::ZERO);
    let table = DependencyTable::new().with(Kind::Items, [Kind::Others]);
    let propagator = InvalidationPropagator::new(controller.clone(), table);
    MutationCoordinator::new(controller, propagator)
  }

  fn store(coordinator: &MutationCoordinator<Key>) -> Arc<QueryCacheStore<Key>> {
    Arc::clone(coordinator.controller.store())
  }

  fn seed(store: &QueryCacheStore<Key>) {
    let now = Utc::now();
    let listed: Vec<Item> = (0..5).map(|i| item(&format!("v{}", i), "x")).collect();
    store.set(CacheEntry::resolved(key(None, 1), page_of(listed.clone(), 5, 12), now));
    store.set(CacheEntry::resolved(
      key(None, 2),
      QueryPage::new(vec![item("v5", "x")], Some(PaginationMeta::new(2, 5, 12))),
      now,
    ));
    store.set(CacheEntry::resolved(key(Some("x"), 1), page_of(listed, 5, 5), now));
    store.set(CacheEntry::resolved(key(Some("y"), 1), page_of(vec![], 5, 0), now));
  }

  fn scope() -> MutationScope<Kind> {
    MutationScope::new("item:v3", Kind::Items)
  }

  #[tokio::test]
  async fn test_insert_scenario_updates_counts() {
    let coordinator = coordinator();
    let store = store(&coordinator);
    seed(&store);

    let applied = coordinator
      .begin(MutationScope::new("item:new", Kind::Items))
      .await
      .apply(Optimistic::Insert(item("new", "x")));

    let first = store.get(&key(None, 1)).unwrap();
    let meta = first.pagination.unwrap();
    assert_eq!((first.items.len(), meta.total, meta.total_pages), (6, 13, 3));
    assert_eq!(store.get(&key(None, 2)).unwrap().items.len(), 1);
    assert!(store.get(&key(Some("y"), 1)).unwrap().items.is_empty());

    applied.commit();
  }

  #[tokio::test]
  async fn test_failed_patch_restores_every_variant() {
    let coordinator = coordinator();
    let store = store(&coordinator);
    seed(&store);
    let before = store.snapshot(&[Kind::Items]);

    let pending = coordinator.begin(scope()).await;
    assert_eq!(pending.snapshot().entries(), before.as_slice());
    let applied = pending.apply(Optimistic::Patch {
      id: "v3".into(),
      patch: "y".into(),
    });
    assert_eq!(store.get(&key(None, 1)).unwrap().items[3], item("v3", "y"));

    let err = applied.abort(CacheError::from_status(422, "invalid status"));
    assert!(matches!(err, CacheError::Validation { .. }));
    assert_eq!(store.snapshot(&[Kind::Items]), before);
  }

  #[tokio::test]
  async fn test_commit_keeps_write_and_marks_dependents_stale() {
    let coordinator = coordinator();
    let store = store(&coordinator);
    seed(&store);
    let other = Key {
      kind: Kind::Others,
      tag: None,
      page: 1,
    };
    store.set(CacheEntry::resolved(other.clone(), page_of(vec![], 5, 0), Utc::now()));

    let report = coordinator
      .begin(scope())
      .await
      .apply(Optimistic::Remove { id: "v3".into() })
      .commit();

    assert_eq!(report.marked, 5);
    let first = store.get(&key(None, 1)).unwrap();
    assert!(first.stale);
    assert!(first.position("v3").is_none());
    assert_eq!(first.pagination.unwrap().total, 11);
    assert!(store.get(&other).unwrap().stale);
  }

  #[tokio::test]
  async fn test_conflict_restores_then_invalidates() {
    let coordinator = coordinator();
    let store = store(&coordinator);
    seed(&store);

    let result: Result<(), CacheError> = coordinator
      .mutate(scope(), Optimistic::Remove { id: "v3".into() }, || async {
        Err(CacheError::Conflict("changed elsewhere".into()))
      })
      .await;

    assert!(result.unwrap_err().is_conflict());
    let first = store.get(&key(None, 1)).unwrap();
    assert!(first.position("v3").is_some());
    assert!(first.stale);
  }

  #[tokio::test]
  async fn test_optimistic_write_lands_before_request() {
    let coordinator = coordinator();
    let store = store(&coordinator);
    seed(&store);
    let observer = Arc::clone(&store);

    let confirmed = coordinator
      .mutate(scope(), Optimistic::Remove { id: "v3".into() }, move || {
        let listed = observer.get(&key(None, 1)).unwrap().position("v3").is_some();
        async move { Ok(listed) }
      })
      .await
      .unwrap();
    assert!(!confirmed);
  }

  #[tokio::test]
  async fn test_dropped_mutation_rolls_back() {
    let coordinator = coordinator();
    let store = store(&coordinator);
    seed(&store);
    let before = store.snapshot(&[Kind::Items]);

    let applied = coordinator
      .begin(scope())
      .await
      .apply(Optimistic::Remove { id: "v3".into() });
    assert_eq!(applied.state(), MutationState::AppliedOptimistic);
    drop(applied);

    assert_eq!(store.snapshot(&[Kind::Items]), before);
  }

  #[tokio::test]
  async fn test_in_flight_fetch_cannot_overwrite_optimistic_write() {
    let coordinator = coordinator();
    let store = store(&coordinator);
    seed(&store);
    let k = key(None, 1);
    let (tx, rx) = oneshot::channel();
    let rx = Arc::new(std::sync::Mutex::new(Some(rx)));

    let pending_fetch = coordinator.controller.run(
      k.clone(),
      crate::cache::fetcher(move || {
        let rx = rx.lock().unwrap().take();
        async move {
          match rx {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(CacheError::Unknown("dropped".into()))),
            None => Err(CacheError::Unknown("called twice".into())),
          }
        }
      }),
    );

    let applied = coordinator
      .begin(scope())
      .await
      .apply(Optimistic::Remove { id: "v3".into() });
    tx.send(Ok(page_of(vec![item("old", "x")], 5, 1))).unwrap();
    pending_fetch.await.unwrap();

    let entry = store.get(&k).unwrap();
    assert!(entry.position("v3").is_none());
    assert!(entry.position("old").is_none());
    assert_eq!(entry.status, FetchStatus::Idle);
    drop(applied);
  }

  #[tokio::test]
  async fn test_same_entity_mutations_snapshot_in_order() {
    let coordinator = coordinator();
    let store = store(&coordinator);
    seed(&store);

    let (release_tx, release_rx) = oneshot::channel::<()>();
    let first_coordinator = coordinator.clone();
    let first = tokio::spawn(async move {
      first_coordinator
        .mutate(
          scope(),
          Optimistic::Patch {
            id: "v3".into(),
            patch: "first".into(),
          },
          || async move {
            release_rx.await.ok();
            Ok(())
          },
        )
        .await
    });
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second_coordinator = coordinator.clone();
    let second = tokio::spawn(async move {
      let pending = second_coordinator.begin(scope()).await;
      let seen = pending.snapshot().entries().iter().find(|e| e.signature == key(None, 1)).cloned();
      let applied = pending.apply(Optimistic::Patch {
        id: "v3".into(),
        patch: "second".into(),
      });
      let _ = applied.abort(CacheError::Network("offline".into()));
      seen
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!second.is_finished());

    release_tx.send(()).unwrap();
    first.await.unwrap().unwrap();
    let seen = second.await.unwrap().unwrap();

    // The second mutation saw the first one's write, and its rollback kept it.
    assert_eq!(seen.items[3], item("v3", "first"));
    assert_eq!(store.get(&key(None, 1)).unwrap().items[3], item("v3", "first"));
  }

  #[tokio::test]
  async fn test_rollback_keeps_data_refetched_after_snapshot() {
    let coordinator = coordinator();
    let store = store(&coordinator);
    let k = key(None, 1);
    let _observer = store.subscribe(&k);

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    coordinator
      .controller
      .run(
        k.clone(),
        crate::cache::fetcher(move || {
          let tag = if counted.fetch_add(1, Ordering::SeqCst) == 0 { "x" } else { "b" };
          async move { Ok(page_of(vec![item("v1", "x"), item("v2", tag)], 5, 2)) }
        }),
      )
      .await
      .unwrap();

    let first = coordinator
      .begin(MutationScope::new("item:v1", Kind::Items))
      .await
      .apply(Optimistic::Patch {
        id: "v1".into(),
        patch: "a".into(),
      });

    let patch = Optimistic::Patch {
      id: "v2".into(),
      patch: "b".into(),
    };
    coordinator
      .mutate(MutationScope::new("item:v2", Kind::Items), patch, || async { Ok(()) })
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let _ = first.abort(CacheError::Network("offline".into()));

    let entry = store.get(&k).unwrap();
    assert_eq!(entry.items, vec![item("v1", "x"), item("v2", "b")]);
    assert!(!entry.stale);
  }

  #[tokio::test]
  async fn test_rollback_after_clear_restores_nothing() {
    let coordinator = coordinator();
    let store = store(&coordinator);
    seed(&store);

    let applied = coordinator
      .begin(scope())
      .await
      .apply(Optimistic::Remove { id: "v3".into() });
    store.clear();
    drop(applied);

    assert!(store.is_empty());
  }
}
