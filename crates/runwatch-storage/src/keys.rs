//! Persisted key layout shared by every component that touches the store.

use runwatch_core::{OrganizationId, RunId};

/// Index prefix listing every organization with a cached run set.
pub const RUN_ORGS_PREFIX: &str = "runs";
/// Index prefix listing every organization with at least one tracked run.
pub const TRACKED_ORGS_PREFIX: &str = "tracked-orgs";

pub fn runs_key(organization_id: OrganizationId) -> String {
    format!("runs:{organization_id}")
}

pub fn tracked_key(organization_id: OrganizationId, run_id: RunId) -> String {
    format!("tracked:{organization_id}:{run_id}")
}

/// Index prefix listing the tracked-run keys of one organization.
pub fn tracked_prefix(organization_id: OrganizationId) -> String {
    format!("tracked:{organization_id}")
}

pub fn sync_state_key(organization_id: OrganizationId) -> String {
    format!("syncstate:{organization_id}")
}

pub fn index_key(prefix: &str) -> String {
    format!("index:{prefix}")
}

pub fn parse_organization_key(key: &str) -> Option<OrganizationId> {
    key.rsplit(':').next()?.parse().ok()
}
