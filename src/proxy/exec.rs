//! Code-execution proxy.
//!
//! Submissions go to a third-party judge service; the proxy then polls the
//! submission until it reaches a terminal state, within a fixed attempt
//! budget. The caller gets either the full outcome or a descriptive typed
//! failure, never partial output.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Judge status ids below this are still queued/processing.
const TERMINAL_STATUS_ID: i64 = 3;

/// Errors surfaced by the execution proxy.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("execution service is not configured")]
    NotConfigured,

    #[error("execution request failed: {0}")]
    Request(String),

    #[error("execution did not finish after {attempts} polls")]
    Timeout { attempts: usize },

    #[error("unexpected execution response shape: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for ExecError {
    fn from(err: reqwest::Error) -> Self {
        ExecError::Request(err.to_string())
    }
}

/// Configuration for the judge service.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_host: String,
    /// Fixed poll budget.
    pub poll_attempts: usize,
    /// Fixed inter-poll delay.
    pub poll_delay: Duration,
}

impl ExecConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://judge0-ce.p.rapidapi.com".to_string(),
            api_key: api_key.into(),
            api_host: "judge0-ce.p.rapidapi.com".to_string(),
            poll_attempts: 20,
            poll_delay: Duration::from_millis(500),
        }
    }

    /// Read configuration from `JUDGE_API_KEY`, `JUDGE_API_URL`,
    /// `JUDGE_API_HOST`.
    pub fn from_env() -> Result<Self, ExecError> {
        let api_key = std::env::var("JUDGE_API_KEY").map_err(|_| ExecError::NotConfigured)?;
        let mut config = Self::new(api_key);
        if let Ok(url) = std::env::var("JUDGE_API_URL") {
            config.base_url = url;
        }
        if let Ok(host) = std::env::var("JUDGE_API_HOST") {
            config.api_host = host;
        }
        Ok(config)
    }
}

/// Terminal state of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub message: Option<String>,
    pub status: ExecStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecStatus {
    pub id: i64,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmissionToken {
    token: String,
}

/// Proxy for the judge execution service.
pub struct ExecProxy {
    http: reqwest::Client,
    config: Option<ExecConfig>,
}

impl ExecProxy {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: Some(config),
        }
    }

    /// A proxy that fails fast with `NotConfigured` on every call.
    pub fn unconfigured() -> Self {
        Self {
            http: reqwest::Client::new(),
            config: None,
        }
    }

    /// Build from environment, falling back to unconfigured.
    pub fn from_env() -> Self {
        match ExecConfig::from_env() {
            Ok(config) => Self::new(config),
            Err(_) => Self::unconfigured(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    /// Submit code and poll until the judge reaches a terminal state.
    pub async fn run(
        &self,
        code: &str,
        language_id: i64,
        stdin: &str,
    ) -> Result<ExecOutcome, ExecError> {
        let config = self.config.as_ref().ok_or(ExecError::NotConfigured)?;

        let submission: SubmissionToken = self
            .http
            .post(format!("{}/submissions", config.base_url))
            .header("X-RapidAPI-Key", &config.api_key)
            .header("X-RapidAPI-Host", &config.api_host)
            .json(&json!({
                "source_code": code,
                "language_id": language_id,
                "stdin": stdin,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ExecError::Request(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExecError::BadResponse(e.to_string()))?;

        debug!("submitted execution, token {}", submission.token);

        for attempt in 0..config.poll_attempts {
            let outcome: ExecOutcome = self
                .http
                .get(format!("{}/submissions/{}", config.base_url, submission.token))
                .query(&[("base64_encoded", "false"), ("fields", "*")])
                .header("X-RapidAPI-Key", &config.api_key)
                .header("X-RapidAPI-Host", &config.api_host)
                .send()
                .await?
                .error_for_status()
                .map_err(|e| ExecError::Request(e.to_string()))?
                .json()
                .await
                .map_err(|e| ExecError::BadResponse(e.to_string()))?;

            if outcome.status.id >= TERMINAL_STATUS_ID {
                debug!(
                    "execution finished after {} polls: status {}",
                    attempt + 1,
                    outcome.status.id
                );
                return Ok(outcome);
            }

            tokio::time::sleep(config.poll_delay).await;
        }

        Err(ExecError::Timeout {
            attempts: config.poll_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ExecConfig::new("key");
        assert_eq!(config.poll_attempts, 20);
        assert_eq!(config.poll_delay, Duration::from_millis(500));
        assert!(config.base_url.contains("judge0"));
    }

    #[tokio::test]
    async fn test_unconfigured_proxy_fails_fast() {
        let proxy = ExecProxy::unconfigured();
        assert!(!proxy.is_configured());
        assert!(matches!(
            proxy.run("print(1)", 71, "").await,
            Err(ExecError::NotConfigured)
        ));
    }

    #[test]
    fn test_timeout_error_names_budget() {
        let err = ExecError::Timeout { attempts: 20 };
        assert_eq!(err.to_string(), "execution did not finish after 20 polls");
    }
}
