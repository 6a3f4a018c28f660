use async_trait::async_trait;
use runwatch_core::{Severity, StatusChange};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str, severity: Severity)
        -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Used when nothing else is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
    ) -> Result<(), NotifyError> {
        info!(
            event = "notification",
            severity = severity.as_str(),
            title = title,
            message = message
        );
        Ok(())
    }
}

/// Runs a shell command per notification with the content passed in the
/// `RUNWATCH_TITLE`, `RUNWATCH_MESSAGE` and `RUNWATCH_SEVERITY` variables.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: String,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
    ) -> Result<(), NotifyError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("RUNWATCH_TITLE", title)
            .env("RUNWATCH_MESSAGE", message)
            .env("RUNWATCH_SEVERITY", severity.as_str())
            .output()
            .await
            .map_err(|err| NotifyError::Delivery(err.to_string()))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(NotifyError::Delivery(format!(
            "command exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

/// Applies the notification policy to `change` and delivers the result.
/// Returns whether a notification went out; delivery errors are logged.
pub async fn dispatch(notifier: &dyn Notifier, change: &StatusChange) -> bool {
    let decision = change.decision();
    if !decision.should_notify {
        debug!(
            event = "notification_suppressed",
            run_id = change.agent_run_id,
            new = change.new_status.as_str()
        );
        return false;
    }

    match notifier
        .notify(&decision.title, &decision.message, decision.severity)
        .await
    {
        Ok(()) => true,
        Err(err) => {
            warn!(
                event = "notification_failed",
                org_id = change.organization_id,
                run_id = change.agent_run_id,
                error = %err
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ts, RecordingNotifier};
    use runwatch_core::RunStatus;

    fn change(old: Option<RunStatus>, new: RunStatus) -> StatusChange {
        StatusChange {
            agent_run_id: 42,
            organization_id: 1,
            old_status: old,
            new_status: new,
            timestamp: ts(0),
            web_url: "https://codegen.com/agent/trace/42".to_string(),
        }
    }

    #[tokio::test]
    async fn dispatch_delivers_notifiable_changes() {
        let notifier = RecordingNotifier::default();
        let sent = dispatch(&notifier, &change(Some(RunStatus::Active), RunStatus::Complete)).await;

        assert!(sent);
        let delivered = notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].title, "Agent Run Complete");
        assert_eq!(delivered[0].severity, Severity::Success);
    }

    #[tokio::test]
    async fn dispatch_skips_suppressed_changes() {
        let notifier = RecordingNotifier::default();
        assert!(!dispatch(&notifier, &change(None, RunStatus::Complete)).await);
        assert!(!dispatch(&notifier, &change(Some(RunStatus::Active), RunStatus::Evaluation)).await);
        assert!(notifier.delivered().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_is_absorbed() {
        let notifier = RecordingNotifier::failing();
        assert!(!dispatch(&notifier, &change(Some(RunStatus::Active), RunStatus::Error)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_notifier_exposes_content_as_env() {
        let dir = tempfile::tempdir().expect("temp dir");
        let out = dir.path().join("notified.txt");
        let notifier = CommandNotifier::new(format!(
            "printf '%s|%s|%s' \"$RUNWATCH_TITLE\" \"$RUNWATCH_MESSAGE\" \"$RUNWATCH_SEVERITY\" > '{}'",
            out.display()
        ));

        notifier
            .notify("Agent Run Failed", "run #9 stopped", Severity::Failure)
            .await
            .expect("notify");

        let written = std::fs::read_to_string(&out).expect("read output");
        assert_eq!(written, "Agent Run Failed|run #9 stopped|failure");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_notifier_reports_non_zero_exit() {
        let notifier = CommandNotifier::new("echo nope >&2; exit 3");
        let err = notifier
            .notify("t", "m", Severity::Info)
            .await
            .expect_err("command fails");
        assert!(err.to_string().contains("nope"));
    }
}
