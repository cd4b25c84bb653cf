//! Cached fleet client: observe queries, mutate optimistically, invalidate.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{fetcher, CacheEntry, Fetcher, QueryCacheStore, QueryController, QueryKey, QueryPage};
use crate::config::{CacheConfig, Config};
use crate::error::CacheError;
use crate::mutation::{
  DependencyTable, InvalidationPropagator, InvalidationReport, MutationCoordinator, MutationScope, Optimistic,
};
use crate::query::QueryObserver;
use crate::session::SessionProvider;
use crate::transport::{HttpTransport, Transport};

use super::cache::{FleetCollection, FleetQuery, PageParams, Record, RecordPatch};
use super::client::FleetClient;
use super::derive;
use super::filter::IssueFilter;
use super::types::{AssignedVessel, Issue, IssuePatch, MaintenanceScan, NewIssue, NewVessel, Vessel, VesselPatch};

/// A write against the fleet API.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationSpec {
  CreateVessel(NewVessel),
  UpdateVessel { id: String, patch: VesselPatch },
  DeleteVessel { id: String },
  CreateIssue(NewIssue),
  UpdateIssue { id: String, patch: IssuePatch },
  DeleteIssue { id: String },
}

impl MutationSpec {
  pub fn name(&self) -> &'static str {
    match self {
      Self::CreateVessel(_) => "create-vessel",
      Self::UpdateVessel { .. } => "update-vessel",
      Self::DeleteVessel { .. } => "delete-vessel",
      Self::CreateIssue(_) => "create-issue",
      Self::UpdateIssue { .. } => "update-issue",
      Self::DeleteIssue { .. } => "delete-issue",
    }
  }
}

/// What the server returned for a settled mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  Vessel(Vessel),
  Issue(Issue),
  Deleted { message: String },
}

/// Collections invalidated when a write to the key collection settles.
///
/// Vessel lists carry open-issue counts, so issue writes reach them too.
pub fn dependency_table() -> DependencyTable<FleetCollection> {
  DependencyTable::new()
    .with(
      FleetCollection::Issues,
      [
        FleetCollection::MyIssues,
        FleetCollection::Issue,
        FleetCollection::Vessels,
        FleetCollection::Vessel,
      ],
    )
    .with(FleetCollection::Vessels, [FleetCollection::Vessel])
}

/// Fleet client with a shared query cache.
///
/// One instance per session; clones share the cache.
#[derive(Clone)]
pub struct FleetCache {
  client: FleetClient,
  controller: QueryController<FleetQuery>,
  coordinator: MutationCoordinator<FleetQuery>,
  session: Arc<dyn SessionProvider>,
  stale_time: Duration,
}

impl FleetCache {
  /// Create a cached client talking HTTP to the configured API.
  pub fn new(config: &Config, session: Arc<dyn SessionProvider>) -> Result<Self> {
    let transport = HttpTransport::new(&config.api, Arc::clone(&session))?;
    Ok(Self::with_transport(Arc::new(transport), session, &config.cache))
  }

  pub fn with_transport(transport: Arc<dyn Transport>, session: Arc<dyn SessionProvider>, config: &CacheConfig) -> Self {
    let controller = QueryController::new(Arc::new(QueryCacheStore::new())).with_retry_delay(config.retry_delay());
    let propagator = InvalidationPropagator::new(controller.clone(), dependency_table());
    let coordinator = MutationCoordinator::new(controller.clone(), propagator);

    Self {
      client: FleetClient::with_transport(transport),
      controller,
      coordinator,
      session,
      stale_time: config.stale_time(),
    }
  }

  pub fn store(&self) -> &Arc<QueryCacheStore<FleetQuery>> {
    self.controller.store()
  }

  pub fn client(&self) -> &FleetClient {
    &self.client
  }

  /// Start a session (login) with an empty cache.
  pub fn init(&self) {
    self.store().init();
    self.controller.reset();
  }

  /// End the session (logout). Observers see no data; late responses are dropped.
  pub fn clear(&self) {
    self.store().clear();
    self.controller.reset();
  }

  /// Subscribe to `query`, fetching it in the background if needed.
  ///
  /// Cached data is shown immediately, even when stale; a refetch replaces
  /// it when it lands.
  pub fn observe(&self, query: FleetQuery) -> QueryObserver<FleetQuery> {
    let rx = self.store().subscribe(&query);
    let entry = self.store().get(&query);
    if self.needs_fetch(entry.as_ref(), Utc::now()) {
      // The fetch runs in its own task; the handle is not needed.
      let _ = self.controller.run_observed(query.clone(), self.fetcher_for(&query));
    }
    QueryObserver::new(query, rx)
  }

  /// Return `query`'s result, from the cache if it is fresh.
  pub async fn fetch(&self, query: FleetQuery) -> Result<QueryPage<Record>, CacheError> {
    if let Some(entry) = self.store().get(&query) {
      if entry.has_data() && !self.needs_fetch(Some(&entry), Utc::now()) {
        debug!(query = %query.description(), "Serving from cache");
        return Ok(QueryPage::new(entry.items, entry.pagination));
      }
    }

    let fetcher = self.fetcher_for(&query);
    let outcome = self.controller.run(query, fetcher).await?;
    Ok(outcome.page)
  }

  /// Mark every cached variant of `collection` stale and refetch the observed ones.
  pub fn invalidate(&self, collection: FleetCollection) -> InvalidationReport {
    self.coordinator.propagator().invalidate(&[collection])
  }

  /// Apply `spec` to the cache, send it, and settle.
  ///
  /// The optimistic write is visible before the request is sent. On
  /// failure every touched query is restored before the error is returned.
  pub async fn mutate(&self, spec: MutationSpec) -> Result<MutationOutcome, CacheError> {
    let (scope, op) = self.plan(&spec, Utc::now());
    let name = spec.name();
    let client = self.client.clone();

    let outcome = self
      .coordinator
      .mutate(scope, op, move || async move { send(&client, spec).await })
      .await?;
    info!(mutation = name, "Mutation confirmed");
    Ok(outcome)
  }

  /// Recompute vessel statuses on the server. Every vessel and issue
  /// list may change, so all of them are invalidated.
  pub async fn run_maintenance_scan(&self) -> Result<MaintenanceScan, CacheError> {
    let scan = self.client.run_maintenance_scan().await?;
    let report = self.coordinator.propagator().invalidate(&[
      FleetCollection::Vessels,
      FleetCollection::Vessel,
      FleetCollection::Issues,
      FleetCollection::MyIssues,
    ]);
    info!(
      total = scan.total,
      updated = scan.updated,
      marked = report.marked,
      "Maintenance scan finished"
    );
    Ok(scan)
  }

  /// Vessels the current user has issues on.
  pub async fn assigned_vessels(&self, filter: IssueFilter) -> Result<Vec<AssignedVessel>, CacheError> {
    let page = self
      .fetch(FleetQuery::my_issues(filter, PageParams::default()))
      .await?;
    let issues: Vec<Issue> = page.items.into_iter().filter_map(Record::into_issue).collect();
    Ok(derive::assigned_vessels(&issues))
  }

  /// Issues suggested for `category` on vessels of `vessel_type`.
  ///
  /// Nothing is requested until both are chosen.
  pub async fn recommendations(&self, category: &str, vessel_type: &str) -> Result<Vec<Issue>, CacheError> {
    let Some(query) = FleetQuery::recommendations(category, vessel_type) else {
      debug!(category, vessel_type, "Recommendations disabled until category and vessel type are set");
      return Ok(Vec::new());
    };
    let page = self.fetch(query).await?;
    Ok(page.items.into_iter().filter_map(Record::into_issue).collect())
  }

  fn needs_fetch(&self, entry: Option<&CacheEntry<FleetQuery>>, now: DateTime<Utc>) -> bool {
    let Some(entry) = entry else {
      return true;
    };
    if entry.is_fetching() {
      return false;
    }
    if entry.stale || !entry.has_data() {
      return true;
    }
    let stale_time = entry.signature.stale_time().unwrap_or(self.stale_time);
    entry
      .fetched_at
      .and_then(|at| (now - at).to_std().ok())
      .is_some_and(|age| age >= stale_time)
  }

  fn fetcher_for(&self, query: &FleetQuery) -> Fetcher<Record> {
    let client = self.client.clone();
    let query = query.clone();
    fetcher(move || {
      let client = client.clone();
      let query = query.clone();
      async move { client.fetch_page(&query).await }
    })
  }

  fn plan(&self, spec: &MutationSpec, now: DateTime<Utc>) -> (MutationScope<FleetCollection>, Optimistic<Record>) {
    match spec {
      MutationSpec::CreateVessel(new) => {
        let vessel = Vessel::optimistic(new, now);
        (vessel_scope(&vessel.id), Optimistic::Insert(Record::Vessel(vessel)))
      }
      MutationSpec::UpdateVessel { id, patch } => (
        vessel_scope(id),
        Optimistic::Patch {
          id: id.clone(),
          patch: RecordPatch::Vessel(patch.clone()),
        },
      ),
      MutationSpec::DeleteVessel { id } => (vessel_scope(id), Optimistic::Remove { id: id.clone() }),
      MutationSpec::CreateIssue(new) => {
        let created_by = self.session.user_id();
        let issue = Issue::optimistic(new, created_by.as_deref(), now);
        (issue_scope(&issue.id), Optimistic::Insert(Record::Issue(issue)))
      }
      MutationSpec::UpdateIssue { id, patch } => (
        issue_scope(id),
        Optimistic::Patch {
          id: id.clone(),
          patch: RecordPatch::Issue(patch.clone()),
        },
      ),
      MutationSpec::DeleteIssue { id } => (issue_scope(id), Optimistic::Remove { id: id.clone() }),
    }
  }
}

fn vessel_scope(id: &str) -> MutationScope<FleetCollection> {
  MutationScope::new(format!("vessel:{}", id), FleetCollection::Vessels).touching(FleetCollection::Vessel)
}

fn issue_scope(id: &str) -> MutationScope<FleetCollection> {
  MutationScope::new(format!("issue:{}", id), FleetCollection::Issues)
    .touching(FleetCollection::MyIssues)
    .touching(FleetCollection::Issue)
}

async fn send(client: &FleetClient, spec: MutationSpec) -> Result<MutationOutcome, CacheError> {
  Ok(match spec {
    MutationSpec::CreateVessel(new) => MutationOutcome::Vessel(client.create_vessel(&new).await?),
    MutationSpec::UpdateVessel { id, patch } => MutationOutcome::Vessel(client.update_vessel(&id, &patch).await?),
    MutationSpec::DeleteVessel { id } => MutationOutcome::Deleted {
      message: client.delete_vessel(&id).await?,
    },
    MutationSpec::CreateIssue(new) => MutationOutcome::Issue(client.create_issue(&new).await?),
    MutationSpec::UpdateIssue { id, patch } => MutationOutcome::Issue(client.update_issue(&id, &patch).await?),
    MutationSpec::DeleteIssue { id } => MutationOutcome::Deleted {
      message: client.delete_issue(&id).await?,
    },
  })
}
