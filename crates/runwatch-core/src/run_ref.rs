use crate::RunId;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunRefError {
    #[error("empty run reference")]
    Empty,
    #[error("invalid run url {input:?}: {reason}")]
    InvalidUrl { input: String, reason: String },
    #[error("unsupported url scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("no run id found in {0:?}")]
    NoRunId(String),
}

/// A run named by the user, either as a bare id (`42`, `#42`) or as the
/// run's web URL (`https://codegen.com/agent/trace/42`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRef {
    pub run_id: RunId,
}

impl RunRef {
    pub fn parse(input: &str) -> Result<Self, RunRefError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(RunRefError::Empty);
        }

        let bare = trimmed.trim_start_matches('#');
        if let Ok(run_id) = bare.parse::<RunId>() {
            return Ok(Self { run_id });
        }

        let url = Url::parse(trimmed).map_err(|err| RunRefError::InvalidUrl {
            input: trimmed.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RunRefError::UnsupportedScheme(url.scheme().to_string()));
        }
        if url.host_str().is_none() {
            return Err(RunRefError::NoRunId(trimmed.to_string()));
        }

        url.path_segments()
            .and_then(|segments| {
                segments
                    .filter(|segment| !segment.is_empty())
                    .filter_map(|segment| segment.parse::<RunId>().ok())
                    .last()
            })
            .map(|run_id| Self { run_id })
            .ok_or_else(|| RunRefError::NoRunId(trimmed.to_string()))
    }
}

impl FromStr for RunRef {
    type Err = RunRefError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}
