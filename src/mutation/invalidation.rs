//! Marking cached collections stale after a mutation settles.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{QueryController, QueryKey};

/// Which collections a mutation of each collection affects.
///
/// A collection always invalidates itself; dependents are added on top.
#[derive(Debug, Clone)]
pub struct DependencyTable<C> {
  dependents: HashMap<C, Vec<C>>,
}

impl<C: Copy + Eq + Hash> Default for DependencyTable<C> {
  fn default() -> Self {
    Self::new()
  }
}

impl<C: Copy + Eq + Hash> DependencyTable<C> {
  pub fn new() -> Self {
    Self {
      dependents: HashMap::new(),
    }
  }

  /// Declare that mutating `mutated` also invalidates `dependents`.
  pub fn with(mut self, mutated: C, dependents: impl IntoIterator<Item = C>) -> Self {
    let entry = self.dependents.entry(mutated).or_default();
    for dependent in dependents {
      if dependent != mutated && !entry.contains(&dependent) {
        entry.push(dependent);
      }
    }
    self
  }

  /// `mutated` followed by everything that depends on it.
  pub fn affected_by(&self, mutated: C) -> Vec<C> {
    let mut affected = vec![mutated];
    if let Some(dependents) = self.dependents.get(&mutated) {
      affected.extend(dependents.iter().copied());
    }
    affected
  }
}

/// Result of one invalidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
  /// Cached variants marked stale
  pub marked: usize,
  /// Observed variants that got a background refetch
  pub refetched: usize,
}

/// Marks affected variants stale and refetches the observed ones.
///
/// Stale entries keep serving their current (possibly speculative) items
/// until the refetch lands. Unobserved variants refetch when next observed.
pub struct InvalidationPropagator<Q: QueryKey> {
  controller: QueryController<Q>,
  table: Arc<DependencyTable<Q::Collection>>,
}

impl<Q: QueryKey> Clone for InvalidationPropagator<Q> {
  fn clone(&self) -> Self {
    Self {
      controller: self.controller.clone(),
      table: Arc::clone(&self.table),
    }
  }
}

impl<Q: QueryKey> InvalidationPropagator<Q> {
  pub fn new(controller: QueryController<Q>, table: DependencyTable<Q::Collection>) -> Self {
    Self {
      controller,
      table: Arc::new(table),
    }
  }

  pub fn table(&self) -> &DependencyTable<Q::Collection> {
    &self.table
  }

  /// Invalidate `mutated` and its dependents.
  pub fn on_settled(&self, mutated: Q::Collection) -> InvalidationReport {
    self.invalidate(&self.table.affected_by(mutated))
  }

  /// Invalidate every cached variant of `collections`.
  pub fn invalidate(&self, collections: &[Q::Collection]) -> InvalidationReport {
    let store = self.controller.store();
    let keys = store.keys(collections);
    let marked = store.mark_stale(&keys);
    let refetched = self.refetch_observed(&keys);

    info!(
      collections = ?collections,
      marked,
      refetched,
      "Invalidated cached queries"
    );
    InvalidationReport { marked, refetched }
  }

  /// Refetch those of `keys` that are observed and stale.
  pub fn revalidate(&self, keys: &[Q]) -> usize {
    let store = self.controller.store();
    let stale: Vec<Q> = keys
      .iter()
      .filter(|key| store.get(key).is_some_and(|entry| entry.stale))
      .cloned()
      .collect();
    self.refetch_observed(&stale)
  }

  fn refetch_observed(&self, keys: &[Q]) -> usize {
    let store = self.controller.store();
    let mut refetched = 0;
    for key in keys.iter().filter(|key| store.is_observed(key)) {
      match self.controller.refetch(key) {
        Some(_) => refetched += 1,
        None => debug!(query = %key.description(), "No fetcher known, refetch deferred"),
      }
    }
    refetched
  }
}
