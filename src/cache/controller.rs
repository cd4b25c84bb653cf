//! Query execution: de-duplicated, retried, order-guarded fetches.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::lock::lock_or_recover;
use super::store::{CacheEntry, FetchStatus, QueryCacheStore};
use super::traits::{QueryKey, QueryPage};
use crate::error::CacheError;

const SOURCE: &str = "cache::controller";

/// A single network attempt for one query.
pub type FetchFuture<E> = BoxFuture<'static, Result<QueryPage<E>, CacheError>>;

/// Factory for fetch attempts. Called again for the retry.
pub type Fetcher<E> = Arc<dyn Fn() -> FetchFuture<E> + Send + Sync>;

/// Pending outcome of a fetch, shared by every caller that joined it.
pub type SharedFetch<E> = Shared<BoxFuture<'static, Result<FetchOutcome<E>, CacheError>>>;

/// Box a closure into a [`Fetcher`].
pub fn fetcher<E, F, Fut>(f: F) -> Fetcher<E>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<QueryPage<E>, CacheError>> + Send + 'static,
{
  Arc::new(move || f().boxed())
}

/// What happened to a successful response once it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  /// Written to the store
  Applied,
  /// A newer response for the same query had already been applied
  Superseded,
  /// The fetch was cancelled (by a mutation) before it resolved
  Cancelled,
  /// Nobody observed the query anymore when it resolved
  Unobserved,
  /// The cache was cleared while the fetch was in flight
  SessionEnded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome<E> {
  pub page: QueryPage<E>,
  /// Per-query sequence number assigned when the fetch was issued
  pub seq: u64,
  pub disposition: Disposition,
}

struct InFlight<E> {
  seq: u64,
  shared: SharedFetch<E>,
}

struct ControllerState<Q: QueryKey> {
  /// Highest sequence number issued per query
  issued: HashMap<Q, u64>,
  /// Highest sequence number whose result reached the store
  applied: HashMap<Q, u64>,
  /// Results with a lower sequence number are ignored (set by `cancel`)
  floor: HashMap<Q, u64>,
  in_flight: HashMap<Q, InFlight<Q::Entity>>,
  /// Last fetcher used per query, for background refetches
  fetchers: HashMap<Q, Fetcher<Q::Entity>>,
}

struct Inner<Q: QueryKey> {
  store: Arc<QueryCacheStore<Q>>,
  state: Mutex<ControllerState<Q>>,
  retry_delay: Duration,
}

/// Drives asynchronous fetches per query signature.
///
/// - Concurrent `run` calls for the same query share one network call.
/// - Every fetch gets a per-query sequence number; a response is written
///   only if no newer response has been written already.
/// - Transient failures are retried exactly once; client errors never are.
/// - Fetches keep running when their consumers go away; only the cache
///   write is skipped.
pub struct QueryController<Q: QueryKey> {
  inner: Arc<Inner<Q>>,
}

impl<Q: QueryKey> Clone for QueryController<Q> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<Q: QueryKey> QueryController<Q> {
  pub fn new(store: Arc<QueryCacheStore<Q>>) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        state: Mutex::new(ControllerState {
          issued: HashMap::new(),
          applied: HashMap::new(),
          floor: HashMap::new(),
          in_flight: HashMap::new(),
          fetchers: HashMap::new(),
        }),
        retry_delay: Duration::from_millis(500),
      }),
    }
  }

  /// Set the delay before the single retry of a transient failure.
  ///
  /// Must be called before the controller is cloned or used.
  pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
    if let Some(inner) = Arc::get_mut(&mut self.inner) {
      inner.retry_delay = retry_delay;
    }
    self
  }

  pub fn store(&self) -> &Arc<QueryCacheStore<Q>> {
    &self.inner.store
  }

  /// Fetch `key`, joining an in-flight fetch for it if there is one.
  pub fn run(&self, key: Q, fetcher: Fetcher<Q::Entity>) -> SharedFetch<Q::Entity> {
    self.start(key, fetcher, false)
  }

  /// Like [`run`](Self::run), on behalf of an observer: if the observer is
  /// gone when the response arrives, the response is not written.
  pub fn run_observed(&self, key: Q, fetcher: Fetcher<Q::Entity>) -> SharedFetch<Q::Entity> {
    self.start(key, fetcher, true)
  }

  fn start(&self, key: Q, fetcher: Fetcher<Q::Entity>, observed: bool) -> SharedFetch<Q::Entity> {
    let mut state = lock_or_recover(&self.inner.state, SOURCE, "run");
    state.fetchers.insert(key.clone(), Arc::clone(&fetcher));

    if let Some(pending) = state.in_flight.get(&key) {
      debug!(query = %key.description(), seq = pending.seq, "Joining in-flight fetch");
      return pending.shared.clone();
    }

    self.launch(&mut state, key, fetcher, observed)
  }

  /// Issue a new fetch for `key` with its last known fetcher, even if one
  /// is already in flight. Returns `None` if `key` was never fetched.
  pub fn refetch(&self, key: &Q) -> Option<SharedFetch<Q::Entity>> {
    let mut state = lock_or_recover(&self.inner.state, SOURCE, "refetch");
    let fetcher = state.fetchers.get(key).cloned()?;
    let observed = self.inner.store.is_observed(key);
    Some(self.launch(&mut state, key.clone(), fetcher, observed))
  }

  /// Ignore the results of every fetch issued so far for `keys`.
  ///
  /// Interrupted entries are marked stale so the next observer refetches.
  pub fn cancel(&self, keys: &[Q]) {
    let mut state = lock_or_recover(&self.inner.state, SOURCE, "cancel");
    self.cancel_locked(&mut state, keys);
  }

  /// Cancel every fetch on `collections` and copy their entries. No fetch
  /// can be issued between the two steps.
  pub fn quiesce(&self, collections: &[Q::Collection]) -> Vec<CacheEntry<Q>> {
    let mut state = lock_or_recover(&self.inner.state, SOURCE, "quiesce");
    let keys = self.inner.store.keys(collections);
    self.cancel_locked(&mut state, &keys);
    self.inner.store.snapshot(collections)
  }

  fn cancel_locked(&self, state: &mut ControllerState<Q>, keys: &[Q]) {
    for key in keys {
      let issued = state.issued.get(key).copied().unwrap_or(0);
      state.floor.insert(key.clone(), issued + 1);
      if let Some(pending) = state.in_flight.remove(key) {
        debug!(query = %key.description(), seq = pending.seq, "Cancelled in-flight fetch");
        self.inner.store.update(key, |entry| {
          entry.status = FetchStatus::Idle;
          entry.stale = true;
        });
      }
    }
  }

  pub fn is_in_flight(&self, key: &Q) -> bool {
    lock_or_recover(&self.inner.state, SOURCE, "is_in_flight")
      .in_flight
      .contains_key(key)
  }

  /// Forget all bookkeeping (session end). Pending fetches settle as
  /// [`Disposition::SessionEnded`] because the store generation changes.
  pub fn reset(&self) {
    let mut state = lock_or_recover(&self.inner.state, SOURCE, "reset");
    state.in_flight.clear();
    state.fetchers.clear();
  }

  fn launch(
    &self,
    state: &mut ControllerState<Q>,
    key: Q,
    fetcher: Fetcher<Q::Entity>,
    observed: bool,
  ) -> SharedFetch<Q::Entity> {
    let seq = {
      let issued = state.issued.entry(key.clone()).or_insert(0);
      *issued += 1;
      *issued
    };
    let generation = self.inner.store.generation();

    self.inner.store.upsert(&key, |entry| {
      entry.status = if entry.has_data() {
        FetchStatus::Refetching
      } else {
        FetchStatus::Loading
      };
    });
    debug!(query = %key.description(), seq, observed, "Issuing fetch");

    // The first attempt is issued now, not when the task is first polled.
    let first_attempt = fetcher();
    let inner = Arc::clone(&self.inner);
    let task_key = key.clone();
    let shared = async move {
      let result = fetch_with_retry(first_attempt, &fetcher, &task_key, inner.retry_delay).await;
      inner.settle(&task_key, seq, generation, observed, result)
    }
    .boxed()
    .shared();

    state.in_flight.insert(
      key,
      InFlight {
        seq,
        shared: shared.clone(),
      },
    );
    tokio::spawn(shared.clone());
    shared
  }
}

impl<Q: QueryKey> Inner<Q> {
  fn settle(
    &self,
    key: &Q,
    seq: u64,
    generation: u64,
    observed: bool,
    result: Result<QueryPage<Q::Entity>, CacheError>,
  ) -> Result<FetchOutcome<Q::Entity>, CacheError> {
    let mut state = lock_or_recover(&self.state, SOURCE, "settle");
    if state.in_flight.get(key).is_some_and(|f| f.seq == seq) {
      state.in_flight.remove(key);
    }
    let still_pending = state.in_flight.contains_key(key);

    let disposition = if self.store.generation() != generation {
      Disposition::SessionEnded
    } else if seq < state.floor.get(key).copied().unwrap_or(0) {
      Disposition::Cancelled
    } else if seq < state.applied.get(key).copied().unwrap_or(0) {
      Disposition::Superseded
    } else if observed && !self.store.is_observed(key) {
      Disposition::Unobserved
    } else {
      Disposition::Applied
    };

    match disposition {
      Disposition::Applied => {
        state.applied.insert(key.clone(), seq);
        match &result {
          Ok(page) => self.store.upsert(key, |entry| {
            entry.items = page.items.clone();
            entry.pagination = page.pagination;
            entry.status = if still_pending {
              FetchStatus::Refetching
            } else {
              FetchStatus::Idle
            };
            entry.stale = false;
            entry.error = None;
            entry.fetched_at = Some(Utc::now());
          }),
          Err(err) => {
            warn!(query = %key.description(), seq, error = %err, "Fetch failed");
            self.store.upsert(key, |entry| {
              entry.status = FetchStatus::Error;
              entry.error = Some(err.clone());
            });
          }
        }
      }
      Disposition::SessionEnded => {}
      other => {
        warn!(query = %key.description(), seq, disposition = ?other, "Discarding fetch result");
        if !still_pending {
          self.store.update(key, |entry| {
            if entry.is_fetching() {
              entry.status = if entry.error.is_some() {
                FetchStatus::Error
              } else {
                FetchStatus::Idle
              };
            }
          });
        }
      }
    }

    result.map(|page| FetchOutcome {
      page,
      seq,
      disposition,
    })
  }
}

/// One attempt, plus one retry if the first failure was transient.
async fn fetch_with_retry<Q: QueryKey>(
  first_attempt: FetchFuture<Q::Entity>,
  fetcher: &Fetcher<Q::Entity>,
  key: &Q,
  retry_delay: Duration,
) -> Result<QueryPage<Q::Entity>, CacheError> {
  match first_attempt.await {
    Err(err) if err.is_transient() => {
      warn!(query = %key.description(), error = %err, "Transient fetch failure, retrying once");
      if !retry_delay.is_zero() {
        tokio::time::sleep(retry_delay).await;
      }
      fetcher().await
    }
    other => other,
  }
}
