use crate::cache::RunCache;
use crate::registry::TrackedRegistry;
use crate::source::RunSource;
use crate::{OrgLocks, SyncError};
use chrono::Duration;
use futures_util::future::join_all;
use runwatch_core::{Clock, OrganizationId, RunId, StatusChange};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Compares tracked runs against fresh remote snapshots.
///
/// Fetches for one organization run concurrently. Registry writes happen
/// afterwards, one run at a time under the organization lock, so a status
/// is recorded before the next run is looked at and a transition is never
/// reported twice.
pub struct StatusChangeDetector {
    registry: TrackedRegistry,
    cache: RunCache,
    source: Arc<dyn RunSource>,
    locks: Arc<OrgLocks>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl StatusChangeDetector {
    pub fn new(
        registry: TrackedRegistry,
        cache: RunCache,
        source: Arc<dyn RunSource>,
        locks: Arc<OrgLocks>,
        clock: Arc<dyn Clock>,
        retention: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            source,
            locks,
            clock,
            retention,
        }
    }

    pub fn registry(&self) -> &TrackedRegistry {
        &self.registry
    }

    /// Changes in registry order. Runs whose fetch or registry update fails
    /// are skipped and retried on the next pass.
    pub async fn check_for_status_changes(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<StatusChange>, SyncError> {
        let tracked = self.registry.list(organization_id)?;
        if tracked.is_empty() {
            return Ok(Vec::new());
        }

        let results = join_all(
            tracked
                .iter()
                .map(|run| self.source.fetch_run(organization_id, run.id)),
        )
        .await;

        let _guard = self.locks.lock(organization_id).await;
        let mut changes = Vec::new();

        for (snapshot, result) in tracked.iter().zip(results) {
            let current = match result {
                Ok(current) => current,
                Err(err) => {
                    warn!(
                        event = "tracked_fetch_failed",
                        org_id = organization_id,
                        run_id = snapshot.id,
                        error = %err
                    );
                    continue;
                }
            };

            if let Err(err) = self.cache.update_run(organization_id, &current) {
                warn!(
                    event = "run_cache_write_failed",
                    org_id = organization_id,
                    run_id = current.id,
                    error = %err
                );
            }

            // Another pass may have advanced or removed the entry since it
            // was listed.
            let latest = match self.registry.get(organization_id, snapshot.id) {
                Ok(Some(latest)) => latest,
                Ok(None) => {
                    debug!(event = "tracked_run_gone", org_id = organization_id, run_id = snapshot.id);
                    continue;
                }
                Err(err) => {
                    warn!(
                        event = "tracked_read_failed",
                        org_id = organization_id,
                        run_id = snapshot.id,
                        error = %err
                    );
                    continue;
                }
            };
            if latest.last_known_status == Some(current.status) {
                continue;
            }

            // A change is only emitted once its status is stored; a failed
            // write leaves the old status so the next pass reports it.
            if let Err(err) = self
                .registry
                .record_status(organization_id, latest.id, current.status)
            {
                warn!(
                    event = "tracked_write_failed",
                    org_id = organization_id,
                    run_id = latest.id,
                    error = %err
                );
                continue;
            }
            let change = StatusChange {
                agent_run_id: latest.id,
                organization_id,
                old_status: latest.last_known_status,
                new_status: current.status,
                timestamp: self.clock.now(),
                web_url: latest.web_url.clone(),
            };
            info!(
                event = "status_change",
                org_id = organization_id,
                run_id = change.agent_run_id,
                old = change.old_status.map(|status| status.as_str()).unwrap_or("none"),
                new = change.new_status.as_str()
            );
            changes.push(change);
        }

        Ok(changes)
    }

    /// Removes terminal tracked runs older than the retention window.
    pub async fn cleanup_completed_runs(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<RunId>, SyncError> {
        let _guard = self.locks.lock(organization_id).await;
        let removed = self
            .registry
            .cleanup_completed(organization_id, self.retention)?;
        if !removed.is_empty() {
            info!(
                event = "tracked_cleanup",
                org_id = organization_id,
                removed = removed.len()
            );
        }
        Ok(removed)
    }
}
