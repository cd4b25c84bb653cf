//! Views computed from cached data rather than fetched.

use std::collections::HashMap;

use super::types::{AssignedVessel, Issue};

/// The vessels a crew member works on, derived from their issues.
///
/// A vessel is listed once, in order of first appearance, if at least one
/// issue embeds its summary; bare vessel ids carry no name to show. Open and
/// in-progress issues count towards `open_issues_count`, whichever shape
/// their vessel reference has.
pub fn assigned_vessels(issues: &[Issue]) -> Vec<AssignedVessel> {
  let mut vessels: Vec<AssignedVessel> = Vec::new();
  let mut index: HashMap<&str, usize> = HashMap::new();

  for issue in issues {
    let Some(summary) = issue.vessel.summary() else {
      continue;
    };
    if index.contains_key(summary.id.as_str()) {
      continue;
    }
    index.insert(&summary.id, vessels.len());
    vessels.push(AssignedVessel {
      id: summary.id.clone(),
      name: summary.name.clone(),
      imo: summary.imo.clone(),
      status: summary.status,
      vessel_type: summary.vessel_type.clone(),
      open_issues_count: 0,
    });
  }

  for issue in issues.iter().filter(|issue| issue.status.is_open()) {
    if let Some(&position) = index.get(issue.vessel_id()) {
      vessels[position].open_issues_count += 1;
    }
  }

  vessels
}
