//! Decides whether a status transition is worth telling the user about.
//!
//! Everything here is pure: the same `(old, new)` pair always produces the
//! same decision, and nothing is delivered from this module.

use crate::{RunId, RunStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Failure,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Success => "success",
            Severity::Failure => "failure",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDecision {
    pub should_notify: bool,
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

impl NotificationDecision {
    fn silent() -> Self {
        Self {
            should_notify: false,
            title: String::new(),
            message: String::new(),
            severity: Severity::Info,
        }
    }

    fn notify(title: &str, message: String, severity: Severity) -> Self {
        Self {
            should_notify: true,
            title: title.to_string(),
            message,
            severity,
        }
    }
}

/// `old_status == None` is the first observation of a run and never notifies.
pub fn decide(
    run_id: RunId,
    old_status: Option<RunStatus>,
    new_status: RunStatus,
) -> NotificationDecision {
    let Some(old_status) = old_status else {
        return NotificationDecision::silent();
    };
    if old_status == new_status {
        return NotificationDecision::silent();
    }

    match new_status {
        // Intermediate grading step; flips back and forth too often.
        RunStatus::Evaluation => NotificationDecision::silent(),
        RunStatus::Active => NotificationDecision::notify(
            "Agent Run Resumed",
            format!("Agent run #{run_id} is running again (was {old_status})"),
            Severity::Success,
        ),
        RunStatus::Complete => NotificationDecision::notify(
            "Agent Run Complete",
            format!("Agent run #{run_id} finished successfully"),
            Severity::Success,
        ),
        RunStatus::Error => NotificationDecision::notify(
            "Agent Run Failed",
            format!("Agent run #{run_id} stopped with an error"),
            Severity::Failure,
        ),
        RunStatus::Cancelled => NotificationDecision::notify(
            "Agent Run Cancelled",
            format!("Agent run #{run_id} was cancelled"),
            Severity::Failure,
        ),
        RunStatus::Timeout => NotificationDecision::notify(
            "Agent Run Timed Out",
            format!("Agent run #{run_id} exceeded its time limit"),
            Severity::Failure,
        ),
        RunStatus::MaxIterationsReached => NotificationDecision::notify(
            "Agent Run Hit Iteration Limit",
            format!("Agent run #{run_id} reached the maximum number of iterations"),
            Severity::Failure,
        ),
        RunStatus::OutOfTokens => NotificationDecision::notify(
            "Agent Run Out of Tokens",
            format!("Agent run #{run_id} ran out of tokens"),
            Severity::Failure,
        ),
        RunStatus::Failed | RunStatus::Paused | RunStatus::Pending => {
            NotificationDecision::notify(
                "Agent Run Status Changed",
                format!("Agent run #{run_id} changed from {old_status} to {new_status}"),
                Severity::Info,
            )
        }
    }
}
