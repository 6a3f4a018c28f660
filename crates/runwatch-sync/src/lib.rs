use runwatch_core::OrganizationId;
use runwatch_storage::StorageError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub mod cache;
pub mod detector;
pub mod engine;
pub mod notifier;
pub mod registry;
pub mod scheduler;
pub mod source;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::RunCache;
pub use detector::StatusChangeDetector;
pub use engine::{SyncEngine, SyncReport};
pub use notifier::{dispatch, CommandNotifier, Notifier, NotifyError, TracingNotifier};
pub use registry::TrackedRegistry;
pub use scheduler::{PassReport, Scheduler, SchedulerHandle};
pub use source::{HttpRunSource, RunSource, SourceError};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_RUN_TTL_MINUTES: i64 = 5;
const DEFAULT_TRACKED_RETENTION_HOURS: i64 = 24;

/// Failure of a whole pass for one organization, as opposed to a single run
/// fetch, which is always absorbed.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("run source error: {0}")]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub poll_interval: std::time::Duration,
    pub run_ttl: chrono::Duration,
    pub tracked_retention: chrono::Duration,
    /// Also re-fetch cached runs that are still executing on every pass.
    pub refresh_polling_runs: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            run_ttl: chrono::Duration::minutes(DEFAULT_RUN_TTL_MINUTES),
            tracked_retention: chrono::Duration::hours(DEFAULT_TRACKED_RETENTION_HOURS),
            refresh_polling_runs: true,
        }
    }
}

/// One async mutex per organization. Every read-modify-write of an
/// organization's run set or tracked runs happens while holding its lock.
#[derive(Debug, Default)]
pub struct OrgLocks {
    locks: Mutex<HashMap<OrganizationId, Arc<AsyncMutex<()>>>>,
}

impl OrgLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, organization_id: OrganizationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            locks.entry(organization_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn org_locks_serialize_same_organization_only() {
        let locks = Arc::new(OrgLocks::new());
        let held = locks.lock(1).await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock(2)).await;
        assert!(other.is_ok(), "different organization must not block");

        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock(1)).await;
        assert!(same.is_err(), "same organization must wait");

        drop(held);
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock(1)).await;
        assert!(same.is_ok());
    }

    #[test]
    fn default_config_matches_polling_contract() {
        let config = WatchConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.run_ttl, chrono::Duration::minutes(5));
        assert_eq!(config.tracked_retention, chrono::Duration::hours(24));
    }
}
