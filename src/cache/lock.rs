//! Mutex access that survives a panic in another task.

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock `lock`, recovering the guard if a previous holder panicked.
///
/// Cache state is plain data; a panic mid-update can at worst leave an
/// entry that the next authoritative fetch overwrites.
pub(crate) fn lock_or_recover<'a, T>(
  lock: &'a Mutex<T>,
  owner: &'static str,
  op: &'static str,
) -> MutexGuard<'a, T> {
  match lock.lock() {
    Ok(guard) => guard,
    Err(poisoned) => {
      warn!(
        op,
        owner,
        result = "poisoned_recovered",
        "Recovered from poisoned cache lock"
      );
      poisoned.into_inner()
    }
  }
}
