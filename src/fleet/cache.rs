//! Caching implementations for fleet types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::{Cacheable, QueryKey};

use super::filter::{IssueFilter, VesselFilter};
use super::types::{Issue, IssuePatch, ParseEnumError, Vessel, VesselPatch};

// ============================================================================
// Cacheable implementations
// ============================================================================

/// Any entity a fleet query can list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Record {
  Vessel(Vessel),
  Issue(Issue),
}

/// Partial update for a [`Record`]. A patch of the other kind is ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPatch {
  Vessel(VesselPatch),
  Issue(IssuePatch),
}

impl Record {
  pub fn as_vessel(&self) -> Option<&Vessel> {
    match self {
      Self::Vessel(vessel) => Some(vessel),
      Self::Issue(_) => None,
    }
  }

  pub fn as_issue(&self) -> Option<&Issue> {
    match self {
      Self::Issue(issue) => Some(issue),
      Self::Vessel(_) => None,
    }
  }

  pub fn into_issue(self) -> Option<Issue> {
    match self {
      Self::Issue(issue) => Some(issue),
      Self::Vessel(_) => None,
    }
  }
}

impl Cacheable for Record {
  type Patch = RecordPatch;

  fn cache_key(&self) -> &str {
    match self {
      Self::Vessel(vessel) => &vessel.id,
      Self::Issue(issue) => &issue.id,
    }
  }

  fn apply_patch(&mut self, patch: &RecordPatch, now: DateTime<Utc>) {
    match (self, patch) {
      (Self::Vessel(vessel), RecordPatch::Vessel(patch)) => vessel.apply_patch(patch, now),
      (Self::Issue(issue), RecordPatch::Issue(patch)) => issue.apply_patch(patch, now),
      _ => {}
    }
  }
}

// ============================================================================
// Query key types
// ============================================================================

/// Server-held collections, one per cached query family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FleetCollection {
  Vessels,
  Issues,
  /// Issues on the vessels the current crew member is assigned to
  MyIssues,
  /// Single vessel detail
  Vessel,
  /// Single issue detail
  Issue,
  /// Issues the server suggests for a category and vessel type
  Recommendations,
}

impl FleetCollection {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Vessels => "vessels",
      Self::Issues => "issues",
      Self::MyIssues => "my-issues",
      Self::Vessel => "vessel",
      Self::Issue => "issue",
      Self::Recommendations => "recommendations",
    }
  }
}

impl fmt::Display for FleetCollection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.name())
  }
}

impl FromStr for FleetCollection {
  type Err = QueryParamError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "vessels" => Ok(Self::Vessels),
      "issues" => Ok(Self::Issues),
      "my-issues" | "my_issues" => Ok(Self::MyIssues),
      "vessel" => Ok(Self::Vessel),
      "issue" => Ok(Self::Issue),
      "recommendations" => Ok(Self::Recommendations),
      other => Err(QueryParamError::UnknownCollection(other.to_string())),
    }
  }
}

/// Error building a [`FleetQuery`] from loose parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryParamError {
  #[error("unknown collection '{0}'")]
  UnknownCollection(String),
  #[error("'{key}' is not a parameter of {collection}")]
  UnknownParam { collection: FleetCollection, key: String },
  #[error("invalid value for '{key}': {reason}")]
  InvalidValue { key: String, reason: String },
  #[error("{0} query needs an 'id'")]
  MissingId(FleetCollection),
  #[error("{collection} query needs a non-empty '{key}'")]
  MissingParam { collection: FleetCollection, key: &'static str },
}

impl From<ParseEnumError> for QueryParamError {
  fn from(err: ParseEnumError) -> Self {
    Self::InvalidValue {
      key: err.kind.to_string(),
      reason: err.to_string(),
    }
  }
}

/// Page selection of a list query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageParams {
  /// 1-based
  pub page: u32,
  /// `None` lets the server pick its default page size
  pub limit: Option<u32>,
}

impl Default for PageParams {
  fn default() -> Self {
    Self { page: 1, limit: None }
  }
}

impl PageParams {
  pub fn new(page: u32, limit: Option<u32>) -> Self {
    Self { page, limit }.normalized()
  }

  pub fn normalized(self) -> Self {
    Self {
      page: self.page.max(1),
      limit: self.limit.filter(|limit| *limit > 0),
    }
  }
}

/// Query key for fleet API calls.
///
/// Construct through the associated functions so parameters are normalized:
/// two keys for the same logical query are then equal however they were
/// assembled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FleetQuery {
  Vessels { filter: VesselFilter, page: PageParams },
  Issues { filter: IssueFilter, page: PageParams },
  MyIssues { filter: IssueFilter, page: PageParams },
  Vessel { id: String },
  Issue { id: String },
  Recommendations { category: String, vessel_type: String },
}

/// Recommendations are cached server-side for five minutes.
const RECOMMENDATIONS_STALE_TIME: Duration = Duration::from_secs(5 * 60);

impl FleetQuery {
  pub fn vessels(filter: VesselFilter, page: PageParams) -> Self {
    Self::Vessels {
      filter: filter.normalized(),
      page: page.normalized(),
    }
  }

  pub fn issues(filter: IssueFilter, page: PageParams) -> Self {
    Self::Issues {
      filter: filter.normalized(),
      page: page.normalized(),
    }
  }

  /// The vessel filter does not apply: the server scopes my-issues itself.
  pub fn my_issues(filter: IssueFilter, page: PageParams) -> Self {
    Self::MyIssues {
      filter: IssueFilter {
        vessel_id: None,
        ..filter.normalized()
      },
      page: page.normalized(),
    }
  }

  pub fn vessel(id: impl Into<String>) -> Self {
    Self::Vessel {
      id: id.into().trim().to_string(),
    }
  }

  pub fn issue(id: impl Into<String>) -> Self {
    Self::Issue {
      id: id.into().trim().to_string(),
    }
  }

  /// `None` unless both parameters are non-empty: the query is only
  /// enabled once a category and a vessel type are chosen.
  pub fn recommendations(category: impl Into<String>, vessel_type: impl Into<String>) -> Option<Self> {
    let category = category.into().trim().to_string();
    let vessel_type = vessel_type.into().trim().to_string();
    if category.is_empty() || vessel_type.is_empty() {
      return None;
    }
    Some(Self::Recommendations { category, vessel_type })
  }

  /// How long a result stays fresh when it differs from the cache default.
  pub fn stale_time(&self) -> Option<Duration> {
    match self {
      Self::Recommendations { .. } => Some(RECOMMENDATIONS_STALE_TIME),
      _ => None,
    }
  }

  /// Build a query from unordered `key=value` parameters.
  pub fn from_pairs<K, V>(
    collection: FleetCollection,
    pairs: impl IntoIterator<Item = (K, V)>,
  ) -> Result<Self, QueryParamError>
  where
    K: AsRef<str>,
    V: AsRef<str>,
  {
    let mut vessel_filter = VesselFilter::default();
    let mut issue_filter = IssueFilter::default();
    let mut page = PageParams::default();
    let mut id = None;
    let (mut category, mut vessel_type) = (String::new(), String::new());

    for (key, value) in pairs {
      let (key, value) = (key.as_ref(), value.as_ref().to_string());
      match (collection, key) {
        (FleetCollection::Vessel | FleetCollection::Issue, "id") => id = Some(value),
        (FleetCollection::Vessel | FleetCollection::Issue, _) => {
          return Err(unknown(collection, key));
        }
        (FleetCollection::Recommendations, "category") => category = value,
        (FleetCollection::Recommendations, "vesselType") => vessel_type = value,
        (FleetCollection::Recommendations, _) => return Err(unknown(collection, key)),
        (_, "page") => page.page = parse_number(key, &value)?,
        (_, "limit") => page.limit = Some(parse_number(key, &value)?),
        (_, "search") => {
          vessel_filter.search = Some(value.clone());
          issue_filter.search = Some(value);
        }
        (FleetCollection::Vessels, "status") => vessel_filter.status = Some(value.parse()?),
        (FleetCollection::Vessels, "type") => vessel_filter.vessel_type = Some(value),
        (FleetCollection::Vessels, "flag") => vessel_filter.flag = Some(value),
        (FleetCollection::Issues, "vesselId") => issue_filter.vessel_id = Some(value),
        (FleetCollection::Issues | FleetCollection::MyIssues, "status") => {
          issue_filter.status = Some(value.parse()?)
        }
        (FleetCollection::Issues | FleetCollection::MyIssues, "priority") => {
          issue_filter.priority = Some(value.parse()?)
        }
        (FleetCollection::Issues | FleetCollection::MyIssues, "category") => {
          issue_filter.category = Some(value)
        }
        _ => return Err(unknown(collection, key)),
      }
    }

    Ok(match collection {
      FleetCollection::Vessels => Self::vessels(vessel_filter, page),
      FleetCollection::Issues => Self::issues(issue_filter, page),
      FleetCollection::MyIssues => Self::my_issues(issue_filter, page),
      FleetCollection::Vessel => Self::vessel(id.ok_or(QueryParamError::MissingId(collection))?),
      FleetCollection::Issue => Self::issue(id.ok_or(QueryParamError::MissingId(collection))?),
      FleetCollection::Recommendations => {
        let missing = if category.trim().is_empty() { "category" } else { "vesselType" };
        Self::recommendations(category, vessel_type).ok_or(QueryParamError::MissingParam { collection, key: missing })?
      }
    })
  }

  /// API path relative to the base URL.
  pub fn path(&self) -> String {
    match self {
      Self::Vessels { .. } => "/vessels".to_string(),
      Self::Issues { .. } => "/issues".to_string(),
      Self::MyIssues { .. } => "/issues/my-issues".to_string(),
      Self::Vessel { id } => format!("/vessels/{}", id),
      Self::Issue { id } => format!("/issues/{}", id),
      Self::Recommendations { .. } => "/issues/recommend".to_string(),
    }
  }

  /// Query string parameters, sorted by name.
  pub fn params(&self) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    let (page, search) = match self {
      Self::Vessels { filter, page } => {
        push(&mut params, "status", filter.status.map(|s| s.to_string()));
        push(&mut params, "type", filter.vessel_type.clone());
        push(&mut params, "flag", filter.flag.clone());
        (page, &filter.search)
      }
      Self::Issues { filter, page } | Self::MyIssues { filter, page } => {
        push(&mut params, "vesselId", filter.vessel_id.clone());
        push(&mut params, "status", filter.status.map(|s| s.to_string()));
        push(&mut params, "priority", filter.priority.map(|p| p.to_string()));
        push(&mut params, "category", filter.category.clone());
        (page, &filter.search)
      }
      Self::Recommendations { category, vessel_type } => {
        params.push(("category", category.clone()));
        params.push(("vesselType", vessel_type.clone()));
        return params;
      }
      Self::Vessel { .. } | Self::Issue { .. } => return params,
    };
    push(&mut params, "search", search.clone());
    push(&mut params, "page", Some(page.page.to_string()));
    push(&mut params, "limit", page.limit.map(|l| l.to_string()));
    params.sort_by_key(|(key, _)| *key);
    params
  }
}

fn push(params: &mut Vec<(&'static str, String)>, key: &'static str, value: Option<String>) {
  if let Some(value) = value {
    params.push((key, value));
  }
}

fn unknown(collection: FleetCollection, key: &str) -> QueryParamError {
  QueryParamError::UnknownParam {
    collection,
    key: key.to_string(),
  }
}

fn parse_number(key: &str, value: &str) -> Result<u32, QueryParamError> {
  value.trim().parse().map_err(|e: std::num::ParseIntError| QueryParamError::InvalidValue {
    key: key.to_string(),
    reason: e.to_string(),
  })
}

impl QueryKey for FleetQuery {
  type Entity = Record;
  type Collection = FleetCollection;

  fn collection(&self) -> FleetCollection {
    match self {
      Self::Vessels { .. } => FleetCollection::Vessels,
      Self::Issues { .. } => FleetCollection::Issues,
      Self::MyIssues { .. } => FleetCollection::MyIssues,
      Self::Vessel { .. } => FleetCollection::Vessel,
      Self::Issue { .. } => FleetCollection::Issue,
      Self::Recommendations { .. } => FleetCollection::Recommendations,
    }
  }

  fn page(&self) -> u32 {
    match self {
      Self::Vessels { page, .. } | Self::Issues { page, .. } | Self::MyIssues { page, .. } => page.page,
      Self::Vessel { .. } | Self::Issue { .. } | Self::Recommendations { .. } => 1,
    }
  }

  /// Detail and recommendation queries never match: new entities are not
  /// inserted into them.
  fn matches(&self, record: &Record) -> bool {
    match (self, record) {
      (Self::Vessels { filter, .. }, Record::Vessel(vessel)) => filter.matches(vessel),
      (Self::Issues { filter, .. } | Self::MyIssues { filter, .. }, Record::Issue(issue)) => {
        filter.matches(issue)
      }
      _ => false,
    }
  }

  fn cache_hash(&self) -> String {
    let input = match self {
      Self::Vessel { id } | Self::Issue { id } => format!("{}:{}", self.collection(), id),
      _ => format!("{}?{}", self.collection(), encode_params(&self.params())),
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match self {
      Self::Vessel { id } => format!("vessel {}", id),
      Self::Issue { id } => format!("issue {}", id),
      _ => {
        let params = self.params();
        if params.is_empty() {
          self.collection().to_string()
        } else {
          format!("{} {}", self.collection(), encode_params(&params))
        }
      }
    }
  }
}

fn encode_params(params: &[(&'static str, String)]) -> String {
  params
    .iter()
    .map(|(key, value)| format!("{}={}", key, value))
    .collect::<Vec<_>>()
    .join("&")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fleet::types::{IssuePriority, IssueStatus, NewIssue, NewVessel};
  use proptest::prelude::*;

  #[test]
  fn test_param_order_does_not_matter() {
    let a = FleetQuery::from_pairs(
      FleetCollection::Issues,
      [("status", "Open"), ("page", "2"), ("vesselId", "v1")],
    )
    .unwrap();
    let b = FleetQuery::from_pairs(
      FleetCollection::Issues,
      [("vesselId", "v1"), ("status", "open"), ("page", "2")],
    )
    .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert!(a.same_signature(&b));
  }

  #[test]
  fn test_different_params_hash_differently() {
    let page_one = FleetQuery::issues(IssueFilter::default(), PageParams::default());
    let page_two = FleetQuery::issues(IssueFilter::default(), PageParams::new(2, None));
    let mine = FleetQuery::my_issues(IssueFilter::default(), PageParams::default());
    assert_ne!(page_one.cache_hash(), page_two.cache_hash());
    assert_ne!(page_one.cache_hash(), mine.cache_hash());
    assert_eq!(page_one.cache_hash().len(), 64);
  }

  #[test]
  fn test_my_issues_ignores_vessel_filter() {
    let filter = IssueFilter {
      vessel_id: Some("v1".into()),
      ..Default::default()
    };
    assert_eq!(
      FleetQuery::my_issues(filter, PageParams::default()),
      FleetQuery::my_issues(IssueFilter::default(), PageParams::default())
    );
    assert!(FleetQuery::from_pairs(FleetCollection::MyIssues, [("vesselId", "v1")]).is_err());
  }

  #[test]
  fn test_from_pairs_rejects_bad_input() {
    assert!(matches!(
      FleetQuery::from_pairs(FleetCollection::Vessels, [("priority", "High")]),
      Err(QueryParamError::UnknownParam { .. })
    ));
    assert!(matches!(
      FleetQuery::from_pairs(FleetCollection::Issues, [("page", "two")]),
      Err(QueryParamError::InvalidValue { .. })
    ));
    assert!(matches!(
      FleetQuery::from_pairs(FleetCollection::Issues, [("status", "Blocked")]),
      Err(QueryParamError::InvalidValue { .. })
    ));
    assert_eq!(
      FleetQuery::from_pairs(FleetCollection::Issue, Vec::<(&str, &str)>::new()),
      Err(QueryParamError::MissingId(FleetCollection::Issue))
    );
  }

  #[test]
  fn test_params_and_path() {
    let query = FleetQuery::issues(
      IssueFilter {
        status: Some(IssueStatus::InProgress),
        priority: Some(IssuePriority::High),
        ..Default::default()
      },
      PageParams::new(0, Some(10)),
    );
    assert_eq!(query.path(), "/issues");
    assert_eq!(
      query.params(),
      vec![
        ("limit", "10".to_string()),
        ("page", "1".to_string()),
        ("priority", "High".to_string()),
        ("status", "In Progress".to_string()),
      ]
    );
    assert_eq!(FleetQuery::vessel("v9").path(), "/vessels/v9");
    assert!(FleetQuery::vessel("v9").params().is_empty());
  }

  #[test]
  fn test_detail_queries_never_match_inserts() {
    let issue = Issue::optimistic(&NewIssue::default(), None, Utc::now());
    assert!(!FleetQuery::issue(issue.id.clone()).matches(&Record::Issue(issue.clone())));
    assert!(FleetQuery::issues(IssueFilter::default(), PageParams::default()).matches(&Record::Issue(issue)));
  }

  #[test]
  fn test_records_only_match_their_collection() {
    let vessel = Record::Vessel(Vessel::optimistic(&NewVessel::default(), Utc::now()));
    assert!(FleetQuery::vessels(VesselFilter::default(), PageParams::default()).matches(&vessel));
    assert!(!FleetQuery::issues(IssueFilter::default(), PageParams::default()).matches(&vessel));
  }

  #[test]
  fn test_mismatched_patch_is_ignored() {
    let mut vessel = Record::Vessel(Vessel::optimistic(&NewVessel::default(), Utc::now()));
    let before = vessel.clone();
    vessel.apply_patch(&RecordPatch::Issue(IssuePatch::default()), Utc::now());
    assert_eq!(vessel, before);
  }

  #[test]
  fn test_recommendations_need_both_params() {
    assert!(FleetQuery::recommendations("Engine", "").is_none());
    assert!(FleetQuery::recommendations("  ", "Tanker").is_none());

    let query = FleetQuery::recommendations(" Engine ", "Tanker").unwrap();
    assert_eq!(query.path(), "/issues/recommend");
    assert_eq!(
      query.params(),
      vec![("category", "Engine".to_string()), ("vesselType", "Tanker".to_string())]
    );
    assert_eq!(query.stale_time(), Some(Duration::from_secs(300)));
    assert_eq!(query.description(), "recommendations category=Engine&vesselType=Tanker");

    let parsed =
      FleetQuery::from_pairs(FleetCollection::Recommendations, [("vesselType", "Tanker"), ("category", "Engine")]);
    assert_eq!(parsed, Ok(query));
    assert_eq!(
      FleetQuery::from_pairs(FleetCollection::Recommendations, [("category", "Engine")]),
      Err(QueryParamError::MissingParam {
        collection: FleetCollection::Recommendations,
        key: "vesselType",
      })
    );
  }

  #[test]
  fn test_recommendations_are_never_insert_targets() {
    let query = FleetQuery::recommendations("Engine", "Tanker").unwrap();
    let issue = Record::Issue(Issue::optimistic(
      &NewIssue {
        category: "Engine".into(),
        ..Default::default()
      },
      None,
      Utc::now(),
    ));
    assert!(!query.matches(&issue));
    assert_eq!(query.page(), 1);
    assert!(FleetQuery::issues(IssueFilter::default(), PageParams::default()).stale_time().is_none());
  }

  proptest! {
    #[test]
    fn any_param_permutation_is_one_signature(
      rotate in 0usize..5,
      search in "[a-zA-Z ]{0,12}",
      page in 0u32..5,
    ) {
      let page = page.to_string();
      let mut pairs = vec![
        ("status", "Open"),
        ("priority", "Low"),
        ("category", "Engine"),
        ("search", search.as_str()),
        ("page", page.as_str()),
      ];
      let canonical = FleetQuery::from_pairs(FleetCollection::Issues, pairs.clone()).unwrap();
      pairs.rotate_left(rotate);
      let rotated = FleetQuery::from_pairs(FleetCollection::Issues, pairs).unwrap();
      prop_assert_eq!(canonical.cache_hash(), rotated.cache_hash());
      prop_assert_eq!(canonical, rotated);
    }
  }
}
