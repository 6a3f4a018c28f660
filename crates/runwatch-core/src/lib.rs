use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod clock;
pub mod notify_policy;
pub mod run_ref;

pub use clock::{Clock, ManualClock, SystemClock};
pub use notify_policy::{decide, NotificationDecision, Severity};
pub use run_ref::{RunRef, RunRefError};

/// Bumped whenever the persisted shape of any cached value changes.
/// Entries written under another version read back as absent.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

pub type RunId = u64;
pub type OrganizationId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Active,
    Evaluation,
    Complete,
    Error,
    Cancelled,
    Timeout,
    MaxIterationsReached,
    OutOfTokens,
    Failed,
    Paused,
    Pending,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "ACTIVE",
            RunStatus::Evaluation => "EVALUATION",
            RunStatus::Complete => "COMPLETE",
            RunStatus::Error => "ERROR",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::Timeout => "TIMEOUT",
            RunStatus::MaxIterationsReached => "MAX_ITERATIONS_REACHED",
            RunStatus::OutOfTokens => "OUT_OF_TOKENS",
            RunStatus::Failed => "FAILED",
            RunStatus::Paused => "PAUSED",
            RunStatus::Pending => "PENDING",
        }
    }

    /// Terminal runs never change again and become eligible for cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Complete
                | RunStatus::Error
                | RunStatus::Cancelled
                | RunStatus::Timeout
                | RunStatus::MaxIterationsReached
                | RunStatus::OutOfTokens
        )
    }

    /// Runs still executing remotely; the cache keeps re-polling these
    /// regardless of TTL.
    pub fn needs_polling(&self) -> bool {
        matches!(self, RunStatus::Active | RunStatus::Evaluation)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_uppercase().replace(&['-', ' '][..], "_");
        match normalized.as_str() {
            "ACTIVE" => Ok(RunStatus::Active),
            "EVALUATION" => Ok(RunStatus::Evaluation),
            "COMPLETE" | "COMPLETED" => Ok(RunStatus::Complete),
            "ERROR" => Ok(RunStatus::Error),
            "CANCELLED" | "CANCELED" => Ok(RunStatus::Cancelled),
            "TIMEOUT" => Ok(RunStatus::Timeout),
            "MAX_ITERATIONS_REACHED" => Ok(RunStatus::MaxIterationsReached),
            "OUT_OF_TOKENS" => Ok(RunStatus::OutOfTokens),
            "FAILED" => Ok(RunStatus::Failed),
            "PAUSED" => Ok(RunStatus::Paused),
            "PENDING" => Ok(RunStatus::Pending),
            other => Err(format!("Unknown run status: {other}")),
        }
    }
}

/// Snapshot of a remote agent run. `status` and `result` are replaced
/// wholesale on every refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRun {
    pub id: RunId,
    pub organization_id: OrganizationId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub web_url: String,
    #[serde(default)]
    pub result: Option<String>,
}

/// Envelope around every cached value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub schema_version: u32,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, now: DateTime<Utc>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            timestamp: now,
            expires_at: ttl.map(|ttl| now + ttl),
            schema_version: CACHE_SCHEMA_VERSION,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }

    pub fn is_current_schema(&self) -> bool {
        self.schema_version == CACHE_SCHEMA_VERSION
    }
}

/// A run explicitly placed under monitoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedRun {
    pub id: RunId,
    pub organization_id: OrganizationId,
    /// `None` only until the first observation.
    pub last_known_status: Option<RunStatus>,
    pub created_at: DateTime<Utc>,
    pub web_url: String,
    pub added_at: DateTime<Utc>,
}

impl TrackedRun {
    pub fn from_run(run: &AgentRun, added_at: DateTime<Utc>) -> Self {
        Self {
            id: run.id,
            organization_id: run.organization_id,
            last_known_status: None,
            created_at: run.created_at,
            web_url: run.web_url.clone(),
            added_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.last_known_status
            .map(|status| status.is_terminal())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SyncState {
    pub status: SyncStatus,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SyncState {
    /// Keeps `last_sync` from the previous state so a refresh indicator
    /// can still show when data was last good.
    pub fn syncing(previous: &SyncState) -> Self {
        Self {
            status: SyncStatus::Syncing,
            last_sync: previous.last_sync,
            error: None,
        }
    }

    pub fn success(now: DateTime<Utc>) -> Self {
        Self {
            status: SyncStatus::Success,
            last_sync: Some(now),
            error: None,
        }
    }

    pub fn error(previous: &SyncState, message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Error,
            last_sync: previous.last_sync,
            error: Some(message.into()),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.status == SyncStatus::Syncing
    }
}

/// Emitted when a tracked run's status differs from its last observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub agent_run_id: RunId,
    pub organization_id: OrganizationId,
    pub old_status: Option<RunStatus>,
    pub new_status: RunStatus,
    pub timestamp: DateTime<Utc>,
    pub web_url: String,
}

impl StatusChange {
    pub fn decision(&self) -> NotificationDecision {
        decide(self.agent_run_id, self.old_status, self.new_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn status_round_trips_through_wire_names() {
        let parsed: RunStatus =
            serde_json::from_str("\"MAX_ITERATIONS_REACHED\"").expect("parse status");
        assert_eq!(parsed, RunStatus::MaxIterationsReached);
        assert_eq!(
            serde_json::to_string(&RunStatus::OutOfTokens).expect("serialize"),
            "\"OUT_OF_TOKENS\""
        );
        assert_eq!("canceled".parse::<RunStatus>(), Ok(RunStatus::Cancelled));
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn terminal_and_polling_sets_are_disjoint() {
        for status in [
            RunStatus::Active,
            RunStatus::Evaluation,
            RunStatus::Complete,
            RunStatus::Error,
            RunStatus::Cancelled,
            RunStatus::Timeout,
            RunStatus::MaxIterationsReached,
            RunStatus::OutOfTokens,
            RunStatus::Failed,
            RunStatus::Paused,
            RunStatus::Pending,
        ] {
            assert!(!(status.is_terminal() && status.needs_polling()), "{status}");
        }
        assert!(RunStatus::Evaluation.needs_polling());
        assert!(!RunStatus::Failed.is_terminal());
    }

    #[test]
    fn entry_without_expiry_is_always_live() {
        let entry = CacheEntry::new("value", ts(), None);
        assert!(entry.is_live(ts() + Duration::days(365)));
        assert!(entry.is_current_schema());
    }

    #[test]
    fn entry_expires_at_ttl_boundary() {
        let entry = CacheEntry::new(1u8, ts(), Some(Duration::minutes(5)));
        assert!(entry.is_live(ts() + Duration::seconds(299)));
        assert!(!entry.is_live(ts() + Duration::minutes(5)));
    }

    #[test]
    fn sync_state_error_keeps_last_good_sync() {
        let ok = SyncState::success(ts());
        let syncing = SyncState::syncing(&ok);
        assert!(syncing.is_syncing());
        let failed = SyncState::error(&syncing, "store unavailable");
        assert_eq!(failed.status, SyncStatus::Error);
        assert_eq!(failed.last_sync, Some(ts()));
        assert_eq!(failed.error.as_deref(), Some("store unavailable"));
    }

    #[test]
    fn agent_run_accepts_missing_result() {
        let run: AgentRun = serde_json::from_str(
            r#"{"id":42,"organization_id":7,"status":"ACTIVE","created_at":"2026-03-01T09:00:00Z","web_url":"https://codegen.com/agent/trace/42"}"#,
        )
        .expect("parse run");
        assert_eq!(run.id, 42);
        assert_eq!(run.result, None);
    }
}
