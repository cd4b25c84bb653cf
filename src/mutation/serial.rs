//! Per-entity serialization of mutations.
//!
//! Two mutations of the same entity run one after the other: the second
//! one takes its snapshot only after the first has settled, so a rollback
//! never resurrects or erases the other mutation's speculative state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::cache::lock_or_recover;

const SOURCE: &str = "mutation::serial";

/// Held for the lifetime of one mutation.
#[derive(Debug)]
pub struct EntityGuard {
  _guard: OwnedMutexGuard<()>,
}

/// Registry of per-entity async locks, keyed by e.g. `"issue:<id>"`.
#[derive(Clone, Default)]
pub struct EntityLocks {
  locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl EntityLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait until no other mutation holds `entity`, then hold it.
  pub async fn acquire(&self, entity: &str) -> EntityGuard {
    let lock = {
      let mut locks = lock_or_recover(&self.locks, SOURCE, "acquire");
      // Locks referenced only by the map are neither held nor awaited.
      locks.retain(|_, lock| Arc::strong_count(lock) > 1);
      Arc::clone(locks.entry(entity.to_string()).or_default())
    };

    if lock.try_lock().is_err() {
      debug!(entity, "Waiting for earlier mutation of the same entity");
    }

    EntityGuard {
      _guard: lock.lock_owned().await,
    }
  }

  /// Number of entities currently locked or awaited.
  pub fn active(&self) -> usize {
    lock_or_recover(&self.locks, SOURCE, "active")
      .values()
      .filter(|lock| Arc::strong_count(lock) > 1)
      .count()
  }
}
