//! Fleet maintenance domain: vessels, issues and their cached queries.

pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
pub mod derive;
pub mod filter;
pub mod types;

pub use cache::{FleetCollection, FleetQuery, PageParams, QueryParamError, Record, RecordPatch};
pub use cached_client::{dependency_table, FleetCache, MutationOutcome, MutationSpec};
pub use client::FleetClient;
pub use filter::{IssueFilter, VesselFilter};
