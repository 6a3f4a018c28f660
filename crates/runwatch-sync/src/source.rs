use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use runwatch_core::{AgentRun, OrganizationId, RunId, RunStatus};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("agent run {run_id} not found in organization {organization_id}")]
    NotFound {
        organization_id: OrganizationId,
        run_id: RunId,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("client unavailable: {0}")]
    Client(String),
}

/// Where fresh run snapshots come from. There is no list endpoint; callers
/// already know which ids they care about.
#[async_trait]
pub trait RunSource: Send + Sync {
    async fn fetch_run(
        &self,
        organization_id: OrganizationId,
        run_id: RunId,
    ) -> Result<AgentRun, SourceError>;
}

#[derive(Debug, Deserialize)]
struct WireRun {
    id: RunId,
    #[serde(default)]
    organization_id: Option<OrganizationId>,
    status: String,
    created_at: String,
    #[serde(default)]
    web_url: Option<String>,
    #[serde(default)]
    result: Option<String>,
}

/// REST client for the agent-run API.
#[derive(Clone)]
pub struct HttpRunSource {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRunSource {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, SourceError> {
        Self::with_timeout(
            base_url,
            token,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(SourceError::Client("missing API token".to_string()));
        }
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(SourceError::Client("missing API base URL".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("runwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| SourceError::Client(err.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    pub fn run_url(&self, organization_id: OrganizationId, run_id: RunId) -> String {
        format!(
            "{}/v1/organizations/{organization_id}/agent/run/{run_id}",
            self.base_url
        )
    }
}

#[async_trait]
impl RunSource for HttpRunSource {
    async fn fetch_run(
        &self,
        organization_id: OrganizationId,
        run_id: RunId,
    ) -> Result<AgentRun, SourceError> {
        let response = self
            .client
            .get(self.run_url(organization_id, run_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| SourceError::Transport(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound {
                organization_id,
                run_id,
            });
        }
        if !status.is_success() {
            return Err(SourceError::Transport(format!(
                "unexpected HTTP status {status} for run {run_id}"
            )));
        }

        let wire: WireRun = response
            .json()
            .await
            .map_err(|err| SourceError::Transport(format!("invalid run payload: {err}")))?;
        wire_to_run(wire, organization_id)
    }
}

fn wire_to_run(wire: WireRun, organization_id: OrganizationId) -> Result<AgentRun, SourceError> {
    let status = wire
        .status
        .parse::<RunStatus>()
        .map_err(SourceError::Transport)?;
    let created_at = parse_created_at(&wire.created_at).ok_or_else(|| {
        SourceError::Transport(format!("invalid created_at: {}", wire.created_at))
    })?;

    Ok(AgentRun {
        id: wire.id,
        organization_id: wire.organization_id.unwrap_or(organization_id),
        status,
        created_at,
        web_url: wire.web_url.unwrap_or_default(),
        result: wire.result,
    })
}

/// The API sometimes omits the offset; those timestamps are UTC.
fn parse_created_at(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
