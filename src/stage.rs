//! Stage executor contract and HTTP client.
//!
//! Movement stages (ingest check, raw-to-clean, clean-to-curated,
//! curated-to-warehouse staging) run on an external executor service. The
//! orchestrator talks to it through [`StageExecutor`], so tests can swap
//! in scripted executors without a network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::error::ErrorKind;

/// A request to execute one stage job against one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    /// Fully qualified job name, e.g. "lakegate-raw-to-clean-prod".
    pub job_name: String,
    /// Partition key the job operates on.
    pub partition_key: String,
    /// Where the job reads from.
    pub source_location: String,
    /// Where the job writes to.
    pub target_location: String,
}

impl StageRequest {
    /// Creates a new stage request.
    pub fn new(
        job_name: impl Into<String>,
        partition_key: impl Into<String>,
        source_location: impl Into<String>,
        target_location: impl Into<String>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            partition_key: partition_key.into(),
            source_location: source_location.into(),
            target_location: target_location.into(),
        }
    }
}

/// Terminal status reported by the executor for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
}

/// Result of one stage job attempt.
///
/// A well-formed failure report is an `Ok` value: the executor answered,
/// the job just didn't succeed. `Err` is reserved for attempts where no
/// usable answer came back at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResponse {
    /// Whether the job succeeded or failed.
    pub status: ExecutionStatus,
    /// Records read by the job.
    #[serde(default)]
    pub records_in: u64,
    /// Records written by the job.
    #[serde(default)]
    pub records_out: u64,
    /// Failure description when status is failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StageResponse {
    /// Creates a successful response.
    pub fn succeeded(records_in: u64, records_out: u64) -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            records_in,
            records_out,
            error_message: None,
        }
    }

    /// Creates a failed response with an error message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            records_in: 0,
            records_out: 0,
            error_message: Some(message.into()),
        }
    }

    /// Whether the attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

/// Errors from talking to the stage executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The attempt exceeded the stage timeout.
    #[error("Stage job '{job_name}' timed out after {seconds}s")]
    Timeout { job_name: String, seconds: u64 },

    /// Request could not be sent or the connection dropped.
    #[error("Request failed: {0}")]
    Transport(String),

    /// The executor answered with a non-success HTTP status.
    #[error("Executor returned status {code}: {message}")]
    Http { code: u16, message: String },

    /// The executor answered with a body this client cannot parse.
    #[error("Failed to parse executor response: {0}")]
    InvalidResponse(String),
}

impl ExecutorError {
    /// Creates a timeout error for a job.
    pub fn timeout(job_name: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            job_name: job_name.into(),
            seconds: timeout.as_secs(),
        }
    }

    /// Maps this error onto the pipeline failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::Timeout { .. }
            | ExecutorError::Transport(_)
            | ExecutorError::Http { .. } => ErrorKind::Transient,
            ExecutorError::InvalidResponse(_) => ErrorKind::Schema,
        }
    }
}

/// Trait for services that can run stage jobs.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Runs one attempt of a stage job to completion.
    async fn execute(&self, request: &StageRequest) -> Result<StageResponse, ExecutorError>;
}

/// Internal request body sent to the executor service.
#[derive(Debug, Serialize)]
struct ApiJobRequest<'a> {
    partition_key: &'a str,
    source_location: &'a str,
    target_location: &'a str,
}

/// Internal response body from the executor service.
#[derive(Debug, Deserialize)]
struct ApiJobResponse {
    status: String,
    #[serde(default)]
    records_in: u64,
    #[serde(default)]
    records_out: u64,
    error_message: Option<String>,
}

/// HTTP client for the stage executor service.
pub struct HttpStageExecutor {
    /// Base URL for the executor API.
    base_url: String,
    /// Request timeout, matching the stage timeout.
    timeout: Duration,
    /// HTTP client for making API requests.
    http_client: Client,
}

impl HttpStageExecutor {
    /// Creates a new executor client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL for the executor API (e.g., "http://localhost:8080")
    /// * `timeout` - Per-attempt timeout; an attempt that exceeds it fails
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
            http_client: Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Creates an executor client from pipeline configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.executor_base_url.clone(), config.stage_timeout)
    }

    /// Get the executor base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl StageExecutor for HttpStageExecutor {
    async fn execute(&self, request: &StageRequest) -> Result<StageResponse, ExecutorError> {
        let url = format!("{}/jobs/{}", self.base_url, request.job_name);

        let api_request = ApiJobRequest {
            partition_key: &request.partition_key,
            source_location: &request.source_location,
            target_location: &request.target_location,
        };

        let http_response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutorError::timeout(&request.job_name, self.timeout)
                } else {
                    ExecutorError::Transport(e.to_string())
                }
            })?;

        let status = http_response.status();

        if !status.is_success() {
            let message = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            return Err(ExecutorError::Http {
                code: status.as_u16(),
                message,
            });
        }

        let api_response: ApiJobResponse = http_response
            .json()
            .await
            .map_err(|e| ExecutorError::InvalidResponse(e.to_string()))?;

        let status = match api_response.status.as_str() {
            "succeeded" => ExecutionStatus::Succeeded,
            "failed" => ExecutionStatus::Failed,
            other => {
                return Err(ExecutorError::InvalidResponse(format!(
                    "unknown job status '{}'",
                    other
                )))
            }
        };

        Ok(StageResponse {
            status,
            records_in: api_response.records_in,
            records_out: api_response.records_out,
            error_message: api_response.error_message,
        })
    }
}
