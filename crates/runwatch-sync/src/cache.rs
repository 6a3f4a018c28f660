use chrono::{DateTime, Duration, Utc};
use runwatch_core::{AgentRun, CacheEntry, Clock, OrganizationId, RunId};
use runwatch_storage::keys::{parse_organization_key, runs_key, RUN_ORGS_PREFIX};
use runwatch_storage::{read_json, write_json, KeyIndex, KvStore, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedRun {
    #[serde(flatten)]
    run: AgentRun,
    needs_polling: bool,
}

/// Organization-scoped run snapshots, stored as one batch per organization
/// under `runs:{org}`.
///
/// Reads drop expired entries without deleting them; the next write of the
/// batch does. Callers that read-modify-write (`update_run`, `remove_run`)
/// must hold the organization's lock in [`crate::OrgLocks`].
#[derive(Clone)]
pub struct RunCache {
    store: Arc<dyn KvStore>,
    index: KeyIndex,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl RunCache {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            index: KeyIndex::new(store.clone()),
            store,
            clock,
            ttl,
        }
    }

    /// Live runs, newest first.
    pub fn get_runs(&self, organization_id: OrganizationId) -> Result<Vec<AgentRun>, StorageError> {
        let now = self.clock.now();
        let mut runs = self
            .live_entries(organization_id, now)?
            .into_iter()
            .map(|cached| cached.run)
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    pub fn get_run(
        &self,
        organization_id: OrganizationId,
        run_id: RunId,
    ) -> Result<Option<AgentRun>, StorageError> {
        Ok(self
            .get_runs(organization_id)?
            .into_iter()
            .find(|run| run.id == run_id))
    }

    /// Replaces the whole batch. Every entry gets a fresh expiry and its
    /// polling flag recomputed from its status.
    pub fn set_runs(
        &self,
        organization_id: OrganizationId,
        runs: &[AgentRun],
    ) -> Result<(), StorageError> {
        let now = self.clock.now();
        let entries = runs
            .iter()
            .map(|run| {
                CacheEntry::new(
                    CachedRun {
                        run: run.clone(),
                        needs_polling: run.status.needs_polling(),
                    },
                    now,
                    Some(self.ttl),
                )
            })
            .collect::<Vec<_>>();

        let key = runs_key(organization_id);
        write_json(self.store.as_ref(), &key, &entries)?;
        self.index.add(RUN_ORGS_PREFIX, &key)?;
        debug!(
            event = "run_cache_write",
            org_id = organization_id,
            runs = entries.len()
        );
        Ok(())
    }

    /// Replaces the run with the same id, or prepends it if new.
    pub fn update_run(
        &self,
        organization_id: OrganizationId,
        run: &AgentRun,
    ) -> Result<(), StorageError> {
        let mut runs = self.get_runs(organization_id)?;
        match runs.iter_mut().find(|existing| existing.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.insert(0, run.clone()),
        }
        self.set_runs(organization_id, &runs)
    }

    pub fn remove_run(
        &self,
        organization_id: OrganizationId,
        run_id: RunId,
    ) -> Result<bool, StorageError> {
        let mut runs = self.get_runs(organization_id)?;
        let before = runs.len();
        runs.retain(|run| run.id != run_id);
        if runs.len() == before {
            return Ok(false);
        }
        self.set_runs(organization_id, &runs)?;
        Ok(true)
    }

    /// Runs that are still executing remotely. Expiry does not apply here:
    /// an in-flight run stays in this set until a fetch shows it finished.
    pub fn get_polling_runs(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<AgentRun>, StorageError> {
        let mut runs = self
            .current_entries(organization_id)?
            .into_iter()
            .map(|entry| entry.data)
            .filter(|cached| cached.needs_polling)
            .map(|cached| cached.run)
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    pub fn cached_organizations(&self) -> Result<Vec<OrganizationId>, StorageError> {
        Ok(self
            .index
            .list_keys(RUN_ORGS_PREFIX)?
            .iter()
            .filter_map(|key| parse_organization_key(key))
            .collect())
    }

    fn live_entries(
        &self,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CachedRun>, StorageError> {
        Ok(self
            .current_entries(organization_id)?
            .into_iter()
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.data)
            .collect())
    }

    fn current_entries(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<CacheEntry<CachedRun>>, StorageError> {
        let entries: Option<Vec<CacheEntry<CachedRun>>> =
            read_json(self.store.as_ref(), &runs_key(organization_id))?;
        Ok(entries
            .unwrap_or_default()
            .into_iter()
            .filter(|entry| entry.is_current_schema())
            .collect())
    }
}
