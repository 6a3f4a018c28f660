use crate::notifier::{Notifier, NotifyError};
use crate::source::{RunSource, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use runwatch_core::{AgentRun, OrganizationId, RunId, RunStatus, Severity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn ts(offset_secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::seconds(offset_secs)
}

pub fn run(organization_id: OrganizationId, id: RunId, status: RunStatus, created_secs: i64) -> AgentRun {
    AgentRun {
        id,
        organization_id,
        status,
        created_at: ts(created_secs),
        web_url: format!("https://codegen.com/agent/trace/{id}"),
        result: None,
    }
}

/// Answers fetches from a table; ids missing from the table are not found.
#[derive(Default)]
pub struct ScriptedSource {
    runs: Mutex<HashMap<(OrganizationId, RunId), Result<AgentRun, String>>>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_run(&self, run: AgentRun) {
        self.runs
            .lock()
            .expect("source lock")
            .insert((run.organization_id, run.id), Ok(run));
    }

    pub fn fail(&self, organization_id: OrganizationId, run_id: RunId) {
        self.runs
            .lock()
            .expect("source lock")
            .insert((organization_id, run_id), Err("connection reset".to_string()));
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunSource for ScriptedSource {
    async fn fetch_run(
        &self,
        organization_id: OrganizationId,
        run_id: RunId,
    ) -> Result<AgentRun, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .runs
            .lock()
            .expect("source lock")
            .get(&(organization_id, run_id))
            .cloned();
        match scripted {
            Some(Ok(run)) => Ok(run),
            Some(Err(message)) => Err(SourceError::Transport(message)),
            None => Err(SourceError::NotFound {
                organization_id,
                run_id,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub delivered: Mutex<Vec<Delivered>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            delivered: Mutex::default(),
            fail: true,
        }
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().expect("notifier lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
    ) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Delivery("display unavailable".to_string()));
        }
        self.delivered.lock().expect("notifier lock").push(Delivered {
            title: title.to_string(),
            message: message.to_string(),
            severity,
        });
        Ok(())
    }
}
