use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operational state of a vessel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VesselStatus {
  #[default]
  Active,
  #[serde(rename = "Under Maintenance")]
  UnderMaintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IssuePriority {
  Low,
  #[default]
  Medium,
  High,
  Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IssueStatus {
  #[default]
  Open,
  #[serde(rename = "In Progress")]
  InProgress,
  Resolved,
  Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
  Admin,
  #[default]
  Crew,
}

/// Error for a categorical value the server does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}'")]
pub struct ParseEnumError {
  pub kind: &'static str,
  pub value: String,
}

macro_rules! wire_enum {
  ($ty:ident, $kind:literal, { $($variant:ident => $wire:literal),+ $(,)? }) => {
    impl $ty {
      /// Value as sent over the wire and in query strings.
      pub fn as_str(&self) -> &'static str {
        match self {
          $(Self::$variant => $wire),+
        }
      }
    }

    impl fmt::Display for $ty {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
      }
    }

    impl FromStr for $ty {
      type Err = ParseEnumError;

      /// Accepts the wire value, case-insensitively, with `-`/`_` for spaces.
      fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace(['-', '_'], " ");
        $(
          if wanted.eq_ignore_ascii_case($wire) {
            return Ok(Self::$variant);
          }
        )+
        Err(ParseEnumError {
          kind: $kind,
          value: s.to_string(),
        })
      }
    }
  };
}

wire_enum!(VesselStatus, "vessel status", {
  Active => "Active",
  UnderMaintenance => "Under Maintenance",
});

wire_enum!(IssuePriority, "issue priority", {
  Low => "Low",
  Medium => "Medium",
  High => "High",
  Critical => "Critical",
});

wire_enum!(IssueStatus, "issue status", {
  Open => "Open",
  InProgress => "In Progress",
  Resolved => "Resolved",
  Closed => "Closed",
});

wire_enum!(UserRole, "role", {
  Admin => "admin",
  Crew => "crew",
});

impl IssueStatus {
  /// Still needs work (counted towards a vessel's open issues).
  pub fn is_open(&self) -> bool {
    matches!(self, Self::Open | Self::InProgress)
  }
}

/// Vessel as listed by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vessel {
  #[serde(rename = "_id")]
  pub id: String,
  pub name: String,
  /// Registry number
  pub imo: String,
  pub flag: String,
  #[serde(rename = "type")]
  pub vessel_type: String,
  #[serde(default)]
  pub status: VesselStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_inspection_date: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub open_issues_count: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<DateTime<Utc>>,
}

/// Partial vessel embedded in an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselSummary {
  #[serde(rename = "_id")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub imo: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<VesselStatus>,
  #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
  pub vessel_type: Option<String>,
}

/// Issue -> vessel reference: a bare id, or a populated summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VesselRef {
  Id(String),
  Embedded(VesselSummary),
}

impl VesselRef {
  pub fn id(&self) -> &str {
    match self {
      Self::Id(id) => id,
      Self::Embedded(summary) => &summary.id,
    }
  }

  pub fn summary(&self) -> Option<&VesselSummary> {
    match self {
      Self::Id(_) => None,
      Self::Embedded(summary) => Some(summary),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
  #[serde(rename = "_id")]
  pub id: String,
  #[serde(default)]
  pub email: String,
  #[serde(default)]
  pub role: UserRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserRef {
  Id(String),
  Embedded(UserSummary),
}

impl UserRef {
  pub fn id(&self) -> &str {
    match self {
      Self::Id(id) => id,
      Self::Embedded(user) => &user.id,
    }
  }
}

/// Reported problem on a vessel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
  #[serde(rename = "_id")]
  pub id: String,
  #[serde(rename = "vesselId")]
  pub vessel: VesselRef,
  pub category: String,
  pub description: String,
  #[serde(default)]
  pub priority: IssuePriority,
  #[serde(default)]
  pub status: IssueStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_by: Option<UserRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resolved_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Body of a vessel create request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVessel {
  pub name: String,
  pub imo: String,
  pub flag: String,
  #[serde(rename = "type")]
  pub vessel_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<VesselStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_inspection_date: Option<String>,
}

/// Body of a vessel update request; also the optimistic patch
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VesselPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub imo: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub flag: Option<String>,
  #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
  pub vessel_type: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<VesselStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_inspection_date: Option<String>,
}

/// Body of an issue create request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIssue {
  pub vessel_id: String,
  pub category: String,
  pub description: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<IssuePriority>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<IssueStatus>,
}

/// Body of an issue update request; also the optimistic patch
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IssuePatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<IssuePriority>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<IssueStatus>,
}

impl Vessel {
  /// Placeholder shown until the server returns the created vessel.
  pub fn optimistic(new: &NewVessel, now: DateTime<Utc>) -> Self {
    Self {
      id: temp_id(now),
      name: new.name.clone(),
      imo: new.imo.clone(),
      flag: new.flag.clone(),
      vessel_type: new.vessel_type.clone(),
      status: new.status.unwrap_or_default(),
      last_inspection_date: new.last_inspection_date.clone(),
      open_issues_count: Some(0),
      created_at: Some(now),
      updated_at: Some(now),
    }
  }

  pub fn apply_patch(&mut self, patch: &VesselPatch, now: DateTime<Utc>) {
    if let Some(name) = &patch.name {
      self.name = name.clone();
    }
    if let Some(imo) = &patch.imo {
      self.imo = imo.clone();
    }
    if let Some(flag) = &patch.flag {
      self.flag = flag.clone();
    }
    if let Some(vessel_type) = &patch.vessel_type {
      self.vessel_type = vessel_type.clone();
    }
    if let Some(status) = patch.status {
      self.status = status;
    }
    if let Some(date) = &patch.last_inspection_date {
      self.last_inspection_date = Some(date.clone());
    }
    self.updated_at = Some(now);
  }
}

impl Issue {
  /// Placeholder shown until the server returns the created issue.
  pub fn optimistic(new: &NewIssue, created_by: Option<&str>, now: DateTime<Utc>) -> Self {
    Self {
      id: temp_id(now),
      vessel: VesselRef::Id(new.vessel_id.clone()),
      category: new.category.clone(),
      description: new.description.clone(),
      priority: new.priority.unwrap_or_default(),
      status: new.status.unwrap_or_default(),
      created_by: created_by.map(|id| UserRef::Id(id.to_string())),
      resolved_at: None,
      created_at: now,
      updated_at: now,
    }
  }

  pub fn apply_patch(&mut self, patch: &IssuePatch, now: DateTime<Utc>) {
    if let Some(category) = &patch.category {
      self.category = category.clone();
    }
    if let Some(description) = &patch.description {
      self.description = description.clone();
    }
    if let Some(priority) = patch.priority {
      self.priority = priority;
    }
    if let Some(status) = patch.status {
      self.status = status;
    }
    self.updated_at = now;
  }

  pub fn vessel_id(&self) -> &str {
    self.vessel.id()
  }
}

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(0);

/// Id given to optimistically created entities, unique within the process.
pub fn temp_id(now: DateTime<Utc>) -> String {
  let n = NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed);
  format!("temp-{}-{}", now.timestamp_millis(), n)
}

pub fn is_temp_id(id: &str) -> bool {
  id.starts_with("temp-")
}

/// Authenticated user as known to the cache layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub user_id: String,
  pub role: UserRole,
}

/// Vessel derived from a crew member's issues
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedVessel {
  pub id: String,
  pub name: String,
  pub imo: Option<String>,
  pub status: Option<VesselStatus>,
  pub vessel_type: Option<String>,
  pub open_issues_count: u32,
}

/// Outcome of a maintenance scan job
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaintenanceScan {
  pub message: String,
  pub total: u64,
  pub updated: u64,
  pub active: u64,
  pub under_maintenance: u64,
  pub details: Vec<ScanDetail>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanDetail {
  pub vessel_id: String,
  pub vessel_name: String,
  pub imo: String,
  pub previous_status: String,
  pub current_status: String,
  pub open_issues: u64,
  pub status_changed: bool,
}
