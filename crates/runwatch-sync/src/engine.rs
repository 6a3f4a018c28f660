use crate::cache::RunCache;
use crate::source::RunSource;
use crate::{OrgLocks, SyncError};
use futures_util::future::join_all;
use runwatch_core::{AgentRun, Clock, OrganizationId, RunId, SyncState};
use runwatch_storage::keys::sync_state_key;
use runwatch_storage::{read_json, write_json, KvStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub cached: usize,
    pub refreshed: usize,
    pub failed: Vec<RunId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshScope {
    AllCached,
    PollingOnly,
}

/// Bulk refresh of cached runs. One sync per organization is in flight at
/// a time; individual fetch failures keep the previous snapshot.
pub struct SyncEngine {
    cache: RunCache,
    source: Arc<dyn RunSource>,
    store: Arc<dyn KvStore>,
    locks: Arc<OrgLocks>,
    clock: Arc<dyn Clock>,
}

impl SyncEngine {
    pub fn new(
        cache: RunCache,
        source: Arc<dyn RunSource>,
        store: Arc<dyn KvStore>,
        locks: Arc<OrgLocks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            source,
            store,
            locks,
            clock,
        }
    }

    pub fn cache(&self) -> &RunCache {
        &self.cache
    }

    /// Re-fetches every cached run of the organization. Ends in `Error`
    /// only when the pass itself cannot run.
    pub async fn sync_runs(&self, organization_id: OrganizationId) -> SyncState {
        self.sync_scope(organization_id, RefreshScope::AllCached).await
    }

    /// Like [`Self::sync_runs`] but only for runs that can still change.
    pub async fn sync_polling_runs(&self, organization_id: OrganizationId) -> SyncState {
        self.sync_scope(organization_id, RefreshScope::PollingOnly)
            .await
    }

    pub async fn sync_all(&self) -> Vec<(OrganizationId, SyncState)> {
        let organizations = match self.cache.cached_organizations() {
            Ok(organizations) => organizations,
            Err(err) => {
                error!(event = "sync_all_failed", error = %err);
                return Vec::new();
            }
        };
        let mut states = Vec::with_capacity(organizations.len());
        for organization_id in organizations {
            states.push((organization_id, self.sync_runs(organization_id).await));
        }
        states
    }

    /// Last persisted state; idle when never synced or unreadable.
    pub fn sync_state(&self, organization_id: OrganizationId) -> SyncState {
        match read_json(self.store.as_ref(), &sync_state_key(organization_id)) {
            Ok(state) => state.unwrap_or_default(),
            Err(err) => {
                warn!(event = "sync_state_read_failed", org_id = organization_id, error = %err);
                SyncState::default()
            }
        }
    }

    async fn sync_scope(&self, organization_id: OrganizationId, scope: RefreshScope) -> SyncState {
        let _guard = self.locks.lock(organization_id).await;

        let previous = self.sync_state(organization_id);
        self.persist_state(organization_id, &SyncState::syncing(&previous));

        let state = match self.refresh(organization_id, scope).await {
            Ok(report) => {
                info!(
                    event = "sync_complete",
                    org_id = organization_id,
                    scope = ?scope,
                    cached = report.cached,
                    refreshed = report.refreshed,
                    failed = report.failed.len()
                );
                SyncState::success(self.clock.now())
            }
            Err(err) => {
                error!(event = "sync_failed", org_id = organization_id, error = %err);
                SyncState::error(&previous, err.to_string())
            }
        };

        self.persist_state(organization_id, &state);
        state
    }

    async fn refresh(
        &self,
        organization_id: OrganizationId,
        scope: RefreshScope,
    ) -> Result<SyncReport, SyncError> {
        let mut cached = self.cache.get_runs(organization_id)?;
        let targets = match scope {
            RefreshScope::AllCached => cached.iter().map(|run| run.id).collect::<Vec<_>>(),
            RefreshScope::PollingOnly => {
                let polling = self.cache.get_polling_runs(organization_id)?;
                let targets = polling.iter().map(|run| run.id).collect::<Vec<_>>();
                // Running jobs past their TTL are polled and written back too.
                for run in polling {
                    if !cached.iter().any(|existing| existing.id == run.id) {
                        cached.push(run);
                    }
                }
                targets
            }
        };

        let results = join_all(
            targets
                .iter()
                .map(|run_id| self.source.fetch_run(organization_id, *run_id)),
        )
        .await;

        let mut fresh = HashMap::<RunId, AgentRun>::new();
        let mut failed = Vec::new();
        for (run_id, result) in targets.iter().zip(results) {
            match result {
                Ok(run) => {
                    fresh.insert(*run_id, run);
                }
                Err(err) => {
                    warn!(
                        event = "run_fetch_failed",
                        org_id = organization_id,
                        run_id = *run_id,
                        error = %err
                    );
                    failed.push(*run_id);
                }
            }
        }

        let report = SyncReport {
            cached: cached.len(),
            refreshed: fresh.len(),
            failed,
        };

        let mut seen = HashSet::new();
        let merged = cached
            .into_iter()
            .map(|run| fresh.remove(&run.id).unwrap_or(run))
            .filter(|run| seen.insert(run.id))
            .collect::<Vec<_>>();
        self.cache.set_runs(organization_id, &merged)?;

        Ok(report)
    }

    fn persist_state(&self, organization_id: OrganizationId, state: &SyncState) {
        if let Err(err) = write_json(self.store.as_ref(), &sync_state_key(organization_id), state) {
            warn!(event = "sync_state_write_failed", org_id = organization_id, error = %err);
        }
    }
}
