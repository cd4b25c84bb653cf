//! Filter parameters for list queries and the predicate deciding whether an
//! entity would be listed under them.
//!
//! The predicates are pure: no cache state, no clock, no network.

use super::types::{Issue, IssuePriority, IssueStatus, Vessel, VesselStatus};

/// Normalize a free-form parameter: trimmed, empty means unset.
fn clean(value: Option<String>) -> Option<String> {
  value
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
}

/// Search terms compare case-insensitively, so they are stored lowercased.
fn clean_search(value: Option<String>) -> Option<String> {
  clean(value).map(|v| v.to_lowercase())
}

fn contains_term(fields: &[&str], term: &str) -> bool {
  fields.iter().any(|field| field.to_lowercase().contains(term))
}

/// Filters of the vessels list
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VesselFilter {
  pub status: Option<VesselStatus>,
  pub vessel_type: Option<String>,
  pub flag: Option<String>,
  pub search: Option<String>,
}

impl VesselFilter {
  pub fn normalized(self) -> Self {
    Self {
      status: self.status,
      vessel_type: clean(self.vessel_type),
      flag: clean(self.flag),
      search: clean_search(self.search),
    }
  }

  /// Whether `vessel` would be listed under this filter.
  ///
  /// Categorical fields compare exactly; the search term is a
  /// case-insensitive substring of name, registry number, flag or type.
  pub fn matches(&self, vessel: &Vessel) -> bool {
    if self.status.is_some_and(|status| status != vessel.status) {
      return false;
    }
    if self.vessel_type.as_ref().is_some_and(|t| *t != vessel.vessel_type) {
      return false;
    }
    if self.flag.as_ref().is_some_and(|flag| *flag != vessel.flag) {
      return false;
    }
    match &self.search {
      Some(term) => contains_term(
        &[&vessel.name, &vessel.imo, &vessel.flag, &vessel.vessel_type],
        &term.to_lowercase(),
      ),
      None => true,
    }
  }
}

/// Filters of the issues and my-issues lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IssueFilter {
  /// Only on the issues list; my-issues is scoped by the server
  pub vessel_id: Option<String>,
  pub status: Option<IssueStatus>,
  pub priority: Option<IssuePriority>,
  pub category: Option<String>,
  pub search: Option<String>,
}

impl IssueFilter {
  pub fn normalized(self) -> Self {
    Self {
      vessel_id: clean(self.vessel_id),
      status: self.status,
      priority: self.priority,
      category: clean(self.category),
      search: clean_search(self.search),
    }
  }

  /// Whether `issue` would be listed under this filter.
  ///
  /// The vessel reference is compared by id whether it is bare or embedded.
  /// The search term is matched against description and category.
  pub fn matches(&self, issue: &Issue) -> bool {
    if self.vessel_id.as_ref().is_some_and(|id| id != issue.vessel_id()) {
      return false;
    }
    if self.status.is_some_and(|status| status != issue.status) {
      return false;
    }
    if self.priority.is_some_and(|priority| priority != issue.priority) {
      return false;
    }
    if self.category.as_ref().is_some_and(|c| *c != issue.category) {
      return false;
    }
    match &self.search {
      Some(term) => contains_term(&[&issue.description, &issue.category], &term.to_lowercase()),
      None => true,
    }
  }
}
