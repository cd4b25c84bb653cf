use std::sync::Arc;
use tracing::debug;

use crate::cache::QueryPage;
use crate::error::CacheError;
use crate::fleet::api_types::{
  decode, ApiIssueResponse, ApiIssuesResponse, ApiMaintenanceScanResponse, ApiMessageResponse,
  ApiRecommendationsResponse, ApiVesselResponse, ApiVesselsResponse,
};
use crate::fleet::cache::{FleetQuery, Record};
use crate::fleet::types::{Issue, IssuePatch, MaintenanceScan, NewIssue, NewVessel, Vessel, VesselPatch};
use crate::transport::{ApiRequest, Transport};

/// Fleet API client
#[derive(Clone)]
pub struct FleetClient {
  transport: Arc<dyn Transport>,
}

impl FleetClient {
  pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
    Self { transport }
  }

  /// Run a cached query against the API.
  ///
  /// Detail queries come back as a single-item page without pagination,
  /// recommendations as an unpaginated list.
  pub async fn fetch_page(&self, query: &FleetQuery) -> Result<QueryPage<Record>, CacheError> {
    let request = ApiRequest::get(query.path()).with_query(query.params());
    let payload = self.transport.request(request).await?;

    Ok(match query {
      FleetQuery::Vessels { .. } => decode::<ApiVesselsResponse>(payload)?.into_page(),
      FleetQuery::Issues { .. } | FleetQuery::MyIssues { .. } => decode::<ApiIssuesResponse>(payload)?.into_page(),
      FleetQuery::Vessel { .. } => {
        let vessel = decode::<ApiVesselResponse>(payload)?.data.vessel;
        QueryPage::new(vec![Record::Vessel(vessel)], None)
      }
      FleetQuery::Issue { .. } => {
        let issue = decode::<ApiIssueResponse>(payload)?.data.issue;
        QueryPage::new(vec![Record::Issue(issue)], None)
      }
      FleetQuery::Recommendations { .. } => {
        let response = decode::<ApiRecommendationsResponse>(payload)?;
        debug!(count = response.data.count, cached = response.cached, "Fetched recommendations");
        response.into_page()
      }
    })
  }

  pub async fn create_vessel(&self, new: &NewVessel) -> Result<Vessel, CacheError> {
    let request = ApiRequest::post("/vessels").with_json(new)?;
    let payload = self.transport.request(request).await?;
    Ok(decode::<ApiVesselResponse>(payload)?.data.vessel)
  }

  pub async fn update_vessel(&self, id: &str, patch: &VesselPatch) -> Result<Vessel, CacheError> {
    let request = ApiRequest::put(format!("/vessels/{}", id)).with_json(patch)?;
    let payload = self.transport.request(request).await?;
    Ok(decode::<ApiVesselResponse>(payload)?.data.vessel)
  }

  /// Delete a vessel. Returns the server's confirmation message.
  pub async fn delete_vessel(&self, id: &str) -> Result<String, CacheError> {
    let payload = self.transport.request(ApiRequest::delete(format!("/vessels/{}", id))).await?;
    decode_message(payload)
  }

  pub async fn create_issue(&self, new: &NewIssue) -> Result<Issue, CacheError> {
    let request = ApiRequest::post("/issues").with_json(new)?;
    let payload = self.transport.request(request).await?;
    Ok(decode::<ApiIssueResponse>(payload)?.data.issue)
  }

  pub async fn update_issue(&self, id: &str, patch: &IssuePatch) -> Result<Issue, CacheError> {
    let request = ApiRequest::put(format!("/issues/{}", id)).with_json(patch)?;
    let payload = self.transport.request(request).await?;
    Ok(decode::<ApiIssueResponse>(payload)?.data.issue)
  }

  /// Delete an issue. Returns the server's confirmation message.
  pub async fn delete_issue(&self, id: &str) -> Result<String, CacheError> {
    let payload = self.transport.request(ApiRequest::delete(format!("/issues/{}", id))).await?;
    decode_message(payload)
  }

  /// Recompute every vessel's status from its open issues on the server
  pub async fn run_maintenance_scan(&self) -> Result<MaintenanceScan, CacheError> {
    let payload = self.transport.request(ApiRequest::post("/jobs/maintenance-scan")).await?;
    Ok(decode::<ApiMaintenanceScanResponse>(payload)?.into())
  }
}

/// Delete endpoints may answer with an empty body.
fn decode_message(payload: serde_json::Value) -> Result<String, CacheError> {
  if payload.is_null() {
    return Ok(String::new());
  }
  Ok(decode::<ApiMessageResponse>(payload)?.message)
}
