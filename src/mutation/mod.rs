//! Speculative writes on top of the query cache.
//!
//! - [`optimistic`]: how one insert/patch/remove lands on one cached variant
//! - [`coordinator`]: snapshot, apply, then commit or roll back
//! - [`serial`]: one mutation at a time per entity
//! - [`invalidation`]: which collections go stale when a mutation settles

mod coordinator;
mod invalidation;
mod optimistic;
mod serial;

pub use coordinator::{
  AppliedMutation, MutationCoordinator, MutationScope, MutationSnapshot, MutationState, PendingMutation,
};
pub use invalidation::{DependencyTable, InvalidationPropagator, InvalidationReport};
pub use optimistic::{apply_to_entry, Optimistic};
pub use serial::{EntityGuard, EntityLocks};
