use chrono::Duration;
use runwatch_core::{AgentRun, CacheEntry, Clock, OrganizationId, RunId, RunStatus, TrackedRun};
use runwatch_storage::keys::{parse_organization_key, tracked_key, tracked_prefix, TRACKED_ORGS_PREFIX};
use runwatch_storage::{read_json, write_json, KeyIndex, KvStore, StorageError};
use std::sync::Arc;
use tracing::{debug, info};

/// Runs the user explicitly asked to monitor, one blob per run under
/// `tracked:{org}:{run}`. Membership is independent of the run cache.
#[derive(Clone)]
pub struct TrackedRegistry {
    store: Arc<dyn KvStore>,
    index: KeyIndex,
    clock: Arc<dyn Clock>,
}

impl TrackedRegistry {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            index: KeyIndex::new(store.clone()),
            store,
            clock,
        }
    }

    /// Starts monitoring `run`. Tracking an already tracked run keeps the
    /// existing record untouched.
    pub fn track(&self, run: &AgentRun) -> Result<TrackedRun, StorageError> {
        if let Some(existing) = self.get(run.organization_id, run.id)? {
            return Ok(existing);
        }

        let now = self.clock.now();
        let tracked = TrackedRun::from_run(run, now);
        let key = tracked_key(run.organization_id, run.id);
        write_json(self.store.as_ref(), &key, &CacheEntry::new(&tracked, now, None))?;
        self.index.add(&tracked_prefix(run.organization_id), &key)?;
        self.index
            .add(TRACKED_ORGS_PREFIX, &run.organization_id.to_string())?;

        info!(
            event = "run_tracked",
            org_id = run.organization_id,
            run_id = run.id
        );
        Ok(tracked)
    }

    pub fn get(
        &self,
        organization_id: OrganizationId,
        run_id: RunId,
    ) -> Result<Option<TrackedRun>, StorageError> {
        self.read_key(&tracked_key(organization_id, run_id))
    }

    pub fn is_tracked(
        &self,
        organization_id: OrganizationId,
        run_id: RunId,
    ) -> Result<bool, StorageError> {
        Ok(self.get(organization_id, run_id)?.is_some())
    }

    /// Tracked runs in the order they were added. Indexed keys whose blob is
    /// gone are skipped.
    pub fn list(&self, organization_id: OrganizationId) -> Result<Vec<TrackedRun>, StorageError> {
        let mut runs = Vec::new();
        for key in self.index.list_keys(&tracked_prefix(organization_id))? {
            match self.read_key(&key)? {
                Some(tracked) => runs.push(tracked),
                None => debug!(event = "tracked_entry_missing", key = %key),
            }
        }
        Ok(runs)
    }

    pub fn tracked_organizations(&self) -> Result<Vec<OrganizationId>, StorageError> {
        Ok(self
            .index
            .list_keys(TRACKED_ORGS_PREFIX)?
            .iter()
            .filter_map(|key| parse_organization_key(key))
            .collect())
    }

    /// Stores the latest observed status and refreshes the entry timestamp.
    pub fn record_status(
        &self,
        organization_id: OrganizationId,
        run_id: RunId,
        status: RunStatus,
    ) -> Result<Option<TrackedRun>, StorageError> {
        let key = tracked_key(organization_id, run_id);
        let Some(mut tracked) = self.read_key(&key)? else {
            return Ok(None);
        };
        tracked.last_known_status = Some(status);
        write_json(
            self.store.as_ref(),
            &key,
            &CacheEntry::new(&tracked, self.clock.now(), None),
        )?;
        Ok(Some(tracked))
    }

    pub fn untrack(
        &self,
        organization_id: OrganizationId,
        run_id: RunId,
    ) -> Result<bool, StorageError> {
        let key = tracked_key(organization_id, run_id);
        let existed = self.store.get(&key)?.is_some();
        self.store.remove(&key)?;
        let indexed = self.index.remove(&tracked_prefix(organization_id), &key)?;

        if self
            .index
            .list_keys(&tracked_prefix(organization_id))?
            .is_empty()
        {
            self.index
                .remove(TRACKED_ORGS_PREFIX, &organization_id.to_string())?;
        }

        if existed || indexed {
            info!(event = "run_untracked", org_id = organization_id, run_id = run_id);
        }
        Ok(existed || indexed)
    }

    /// Drops terminal runs added more than `retention` ago. Non-terminal
    /// runs are never removed here.
    pub fn cleanup_completed(
        &self,
        organization_id: OrganizationId,
        retention: Duration,
    ) -> Result<Vec<RunId>, StorageError> {
        let now = self.clock.now();
        let expired = self
            .list(organization_id)?
            .into_iter()
            .filter(|tracked| tracked.is_terminal() && now - tracked.added_at > retention)
            .map(|tracked| tracked.id)
            .collect::<Vec<_>>();

        for run_id in &expired {
            self.untrack(organization_id, *run_id)?;
        }
        Ok(expired)
    }

    fn read_key(&self, key: &str) -> Result<Option<TrackedRun>, StorageError> {
        let entry: Option<CacheEntry<TrackedRun>> = read_json(self.store.as_ref(), key)?;
        Ok(entry
            .filter(|entry| entry.is_current_schema())
            .map(|entry| entry.data))
    }
}
