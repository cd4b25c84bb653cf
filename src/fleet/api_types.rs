//! Serde-deserializable types matching fleet API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::{de::DeserializeOwned, Deserialize};

use crate::cache::{PaginationMeta, QueryPage};
use crate::error::CacheError;

use super::cache::Record;
use super::types::{Issue, MaintenanceScan, ScanDetail, Vessel};

/// Decode a JSON payload returned by the transport.
pub fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, CacheError> {
  serde_json::from_value(value).map_err(|e| CacheError::Unknown(format!("unexpected response shape: {}", e)))
}

// ============================================================================
// Common envelope fields
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiPagination {
  #[serde(default = "first_page")]
  pub page: u32,
  pub limit: u32,
  #[serde(default)]
  pub total: u64,
}

fn first_page() -> u32 {
  1
}

impl From<ApiPagination> for PaginationMeta {
  /// `totalPages` is recomputed rather than trusted so it always agrees
  /// with `total` and `limit`.
  fn from(api: ApiPagination) -> Self {
    PaginationMeta::new(api.page, api.limit, api.total)
  }
}

/// Error payload of a non-2xx response
#[derive(Debug, Deserialize, Default)]
pub struct ApiErrorBody {
  pub message: Option<String>,
  pub error: Option<String>,
}

impl ApiErrorBody {
  /// Best human readable message from a raw response body.
  pub fn message_from(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
      Ok(ApiErrorBody {
        message: Some(message), ..
      })
      | Ok(ApiErrorBody {
        error: Some(message), ..
      }) => message,
      _ if body.trim().is_empty() => "no response body".to_string(),
      _ => body.trim().to_string(),
    }
  }
}

// ============================================================================
// Vessels endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiVesselsData {
  #[serde(default)]
  pub vessels: Vec<Vessel>,
}

#[derive(Debug, Deserialize)]
pub struct ApiVesselsResponse {
  pub data: ApiVesselsData,
  pub pagination: Option<ApiPagination>,
}

impl ApiVesselsResponse {
  pub fn into_page(self) -> QueryPage<Record> {
    QueryPage::new(
      self.data.vessels.into_iter().map(Record::Vessel).collect(),
      self.pagination.map(PaginationMeta::from),
    )
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiVesselData {
  pub vessel: Vessel,
}

#[derive(Debug, Deserialize)]
pub struct ApiVesselResponse {
  pub data: ApiVesselData,
}

// ============================================================================
// Issues endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIssuesData {
  #[serde(default)]
  pub issues: Vec<Issue>,
  /// Set by my-issues when the crew member has no assignment
  pub message: Option<String>,
  pub assigned_vessels: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ApiIssuesResponse {
  pub data: ApiIssuesData,
  pub pagination: Option<ApiPagination>,
}

impl ApiIssuesResponse {
  pub fn into_page(self) -> QueryPage<Record> {
    QueryPage::new(
      self.data.issues.into_iter().map(Record::Issue).collect(),
      self.pagination.map(PaginationMeta::from),
    )
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiIssueData {
  pub issue: Issue,
}

#[derive(Debug, Deserialize)]
pub struct ApiIssueResponse {
  pub data: ApiIssueData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRecommendationsData {
  #[serde(default)]
  pub recommendations: Vec<Issue>,
  #[serde(default)]
  pub category: String,
  #[serde(default)]
  pub vessel_type: String,
  #[serde(default)]
  pub count: u64,
}

#[derive(Debug, Deserialize)]
pub struct ApiRecommendationsResponse {
  pub data: ApiRecommendationsData,
  /// Whether the server answered from its own cache
  #[serde(default)]
  pub cached: bool,
}

impl ApiRecommendationsResponse {
  /// Recommendations are a short ranked list, never paginated.
  pub fn into_page(self) -> QueryPage<Record> {
    QueryPage::new(self.data.recommendations.into_iter().map(Record::Issue).collect(), None)
  }
}

// ============================================================================
// Misc endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiMessageResponse {
  #[serde(default)]
  pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiScanDetail {
  pub vessel_id: String,
  #[serde(default)]
  pub vessel_name: String,
  #[serde(default)]
  pub imo: String,
  #[serde(default)]
  pub previous_status: String,
  #[serde(default)]
  pub current_status: String,
  #[serde(default)]
  pub open_issues: u64,
  #[serde(default)]
  pub status_changed: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiScanData {
  #[serde(default)]
  pub total: u64,
  #[serde(default)]
  pub updated: u64,
  #[serde(default)]
  pub active: u64,
  #[serde(default)]
  pub under_maintenance: u64,
  #[serde(default)]
  pub details: Vec<ApiScanDetail>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMaintenanceScanResponse {
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub data: ApiScanData,
}

impl From<ApiMaintenanceScanResponse> for MaintenanceScan {
  fn from(api: ApiMaintenanceScanResponse) -> Self {
    Self {
      message: api.message,
      total: api.data.total,
      updated: api.data.updated,
      active: api.data.active,
      under_maintenance: api.data.under_maintenance,
      details: api
        .data
        .details
        .into_iter()
        .map(|d| ScanDetail {
          vessel_id: d.vessel_id,
          vessel_name: d.vessel_name,
          imo: d.imo,
          previous_status: d.previous_status,
          current_status: d.current_status,
          open_issues: d.open_issues,
          status_changed: d.status_changed,
        })
        .collect(),
    }
  }
}
