use crate::detector::StatusChangeDetector;
use crate::engine::SyncEngine;
use crate::notifier::{dispatch, Notifier};
use crate::WatchConfig;
use runwatch_core::{OrganizationId, StatusChange};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub organizations: usize,
    pub changes: Vec<StatusChange>,
    pub notifications_sent: usize,
    pub cleaned_up: usize,
    pub refreshed_organizations: usize,
    pub failed_organizations: Vec<OrganizationId>,
}

/// Drives detection, notification and cleanup for every organization with
/// tracked runs, once immediately and then on a fixed interval.
pub struct Scheduler {
    detector: Arc<StatusChangeDetector>,
    engine: Arc<SyncEngine>,
    notifier: Arc<dyn Notifier>,
    config: WatchConfig,
}

impl Scheduler {
    pub fn new(
        detector: Arc<StatusChangeDetector>,
        engine: Arc<SyncEngine>,
        notifier: Arc<dyn Notifier>,
        config: WatchConfig,
    ) -> Self {
        Self {
            detector,
            engine,
            notifier,
            config,
        }
    }

    /// One pass over all tracked organizations. A failing organization is
    /// logged and skipped; the pass always finishes.
    pub async fn run_pass(&self) -> PassReport {
        let mut report = PassReport::default();

        let organizations = match self.detector.registry().tracked_organizations() {
            Ok(organizations) => organizations,
            Err(err) => {
                error!(event = "pass_failed", error = %err);
                return report;
            }
        };
        report.organizations = organizations.len();

        for organization_id in organizations {
            let changes = match self.detector.check_for_status_changes(organization_id).await {
                Ok(changes) => changes,
                Err(err) => {
                    error!(event = "org_pass_failed", org_id = organization_id, error = %err);
                    report.failed_organizations.push(organization_id);
                    continue;
                }
            };

            for change in &changes {
                if dispatch(self.notifier.as_ref(), change).await {
                    report.notifications_sent += 1;
                }
            }
            report.changes.extend(changes);

            match self.detector.cleanup_completed_runs(organization_id).await {
                Ok(removed) => report.cleaned_up += removed.len(),
                Err(err) => {
                    error!(event = "cleanup_failed", org_id = organization_id, error = %err);
                }
            }
        }

        if self.config.refresh_polling_runs {
            report.refreshed_organizations = self.refresh_polling_runs().await;
        }

        debug!(
            event = "pass_complete",
            organizations = report.organizations,
            changes = report.changes.len(),
            notified = report.notifications_sent,
            cleaned_up = report.cleaned_up,
            failed = report.failed_organizations.len()
        );
        report
    }

    async fn refresh_polling_runs(&self) -> usize {
        let organizations = match self.engine.cache().cached_organizations() {
            Ok(organizations) => organizations,
            Err(err) => {
                error!(event = "polling_refresh_failed", error = %err);
                return 0;
            }
        };
        let mut refreshed = 0;
        for organization_id in organizations {
            let has_polling = match self.engine.cache().get_polling_runs(organization_id) {
                Ok(runs) => !runs.is_empty(),
                Err(err) => {
                    error!(event = "polling_refresh_failed", org_id = organization_id, error = %err);
                    continue;
                }
            };
            if has_polling {
                self.engine.sync_polling_runs(organization_id).await;
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Spawns the periodic loop. The first pass starts immediately.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let trigger = Arc::new(Notify::new());
        let wake = trigger.clone();
        let interval = self.config.poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(event = "scheduler_start", interval_secs = interval.as_secs());

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                self.run_pass().await;
            }

            info!(event = "scheduler_stop");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            trigger,
            task,
        }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    trigger: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Requests an extra pass as soon as the current one (if any) is done.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// No pass starts after this returns; a pass already running is allowed
    /// to finish first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            error!(event = "scheduler_join_failed", error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RunCache;
    use crate::registry::TrackedRegistry;
    use crate::test_support::{run, ts, RecordingNotifier, ScriptedSource};
    use crate::OrgLocks;
    use chrono::Duration;
    use runwatch_core::{ManualClock, RunStatus};
    use runwatch_storage::MemoryStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        source: Arc<ScriptedSource>,
        notifier: Arc<RecordingNotifier>,
        registry: TrackedRegistry,
        scheduler: Arc<Scheduler>,
    }

    fn fixture(config: WatchConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(ts(0)));
        let source = Arc::new(ScriptedSource::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let locks = Arc::new(OrgLocks::new());
        let registry = TrackedRegistry::new(store.clone(), clock.clone());
        let cache = RunCache::new(store.clone(), clock.clone(), config.run_ttl);
        let detector = Arc::new(StatusChangeDetector::new(
            registry.clone(),
            cache.clone(),
            source.clone(),
            locks.clone(),
            clock.clone(),
            config.tracked_retention,
        ));
        let engine = Arc::new(SyncEngine::new(
            cache,
            source.clone(),
            store,
            locks,
            clock.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            detector,
            engine,
            notifier.clone(),
            config,
        ));
        Fixture {
            clock,
            source,
            notifier,
            registry,
            scheduler,
        }
    }

    #[tokio::test]
    async fn pass_notifies_and_is_quiet_afterwards() {
        let fx = fixture(WatchConfig::default());
        fx.registry.track(&run(1, 42, RunStatus::Active, 0)).expect("track");
        fx.registry.record_status(1, 42, RunStatus::Active).expect("seed");
        fx.source.set_run(run(1, 42, RunStatus::Complete, 0));

        let report = fx.scheduler.run_pass().await;
        assert_eq!(report.organizations, 1);
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.notifications_sent, 1);
        assert_eq!(fx.notifier.delivered()[0].title, "Agent Run Complete");

        let report = fx.scheduler.run_pass().await;
        assert!(report.changes.is_empty());
        assert_eq!(fx.notifier.delivered().len(), 1);
    }

    #[tokio::test]
    async fn pass_cleans_up_old_terminal_runs() {
        let fx = fixture(WatchConfig::default());
        fx.registry.track(&run(1, 5, RunStatus::Complete, 0)).expect("track");
        fx.registry.record_status(1, 5, RunStatus::Complete).expect("seed");
        fx.source.set_run(run(1, 5, RunStatus::Complete, 0));

        fx.clock.advance(Duration::hours(25));
        let report = fx.scheduler.run_pass().await;
        assert_eq!(report.cleaned_up, 1);
        assert!(fx.registry.tracked_organizations().expect("orgs").is_empty());
    }

    #[tokio::test]
    async fn pass_refreshes_running_cached_jobs() {
        let fx = fixture(WatchConfig::default());
        fx.scheduler
            .engine
            .cache()
            .set_runs(2, &[run(2, 9, RunStatus::Active, 0)])
            .expect("seed cache");
        fx.source.set_run(run(2, 9, RunStatus::Complete, 0));

        let report = fx.scheduler.run_pass().await;
        assert_eq!(report.organizations, 0);
        assert_eq!(report.refreshed_organizations, 1);
        let cached = fx
            .scheduler
            .engine
            .cache()
            .get_run(2, 9)
            .expect("get")
            .expect("cached");
        assert_eq!(cached.status, RunStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_immediately_then_on_interval_until_stopped() {
        let fx = fixture(WatchConfig {
            refresh_polling_runs: false,
            ..WatchConfig::default()
        });
        fx.registry.track(&run(1, 1, RunStatus::Active, 0)).expect("track");
        fx.source.set_run(run(1, 1, RunStatus::Active, 0));

        let handle = fx.scheduler.clone().start();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert_eq!(fx.source.fetches(), 1);

        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert_eq!(fx.source.fetches(), 2);

        handle.stop().await;
        let after_stop = fx.source.fetches();
        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        assert_eq!(fx.source.fetches(), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_runs_an_extra_pass() {
        let fx = fixture(WatchConfig {
            refresh_polling_runs: false,
            ..WatchConfig::default()
        });
        fx.registry.track(&run(1, 1, RunStatus::Active, 0)).expect("track");
        fx.source.set_run(run(1, 1, RunStatus::Active, 0));

        let handle = fx.scheduler.clone().start();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        handle.trigger();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert_eq!(fx.source.fetches(), 2);

        handle.stop().await;
    }
}
