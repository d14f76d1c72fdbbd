//! Alert delivery for pipeline outcomes.
//!
//! The orchestrator and the quarantine sink both speak to an [`AlertSink`].
//! Production deployments wire a webhook sink at an ops channel; the log
//! sink is the default and always available. Every terminal failure of a
//! run produces exactly one alert, and every quarantined partition one
//! more, so sinks must tolerate bursts but never deduplicate.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How urgently an alert should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// A single alert about a run or a partition within it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub entity_group: String,
    /// Set when the alert concerns one entity rather than the whole run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub process_date: NaiveDate,
    pub run_id: Uuid,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failing_checks: Vec<String>,
}

impl Alert {
    pub fn new(
        severity: Severity,
        entity_group: impl Into<String>,
        process_date: NaiveDate,
        run_id: Uuid,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            entity_group: entity_group.into(),
            entity: None,
            process_date,
            run_id,
            message: message.into(),
            failing_checks: Vec::new(),
        }
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn with_failing_checks(mut self, checks: Vec<String>) -> Self {
        self.failing_checks = checks;
        self
    }
}

/// Errors that can occur while delivering an alert.
#[derive(Debug, Error)]
pub enum AlertError {
    /// HTTP request failed.
    #[error("Alert transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The alert endpoint rejected the payload.
    #[error("Alert endpoint returned {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// Destination for alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Sink that writes alerts to the tracing log. Never fails.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let entity = alert.entity.as_deref().unwrap_or("-");
        match alert.severity {
            Severity::Info => info!(
                entity_group = %alert.entity_group,
                entity = %entity,
                process_date = %alert.process_date,
                run_id = %alert.run_id,
                "{}",
                alert.message
            ),
            Severity::Warning => warn!(
                entity_group = %alert.entity_group,
                entity = %entity,
                process_date = %alert.process_date,
                run_id = %alert.run_id,
                failing_checks = ?alert.failing_checks,
                "{}",
                alert.message
            ),
            Severity::Critical => error!(
                entity_group = %alert.entity_group,
                entity = %entity,
                process_date = %alert.process_date,
                run_id = %alert.run_id,
                failing_checks = ?alert.failing_checks,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Sink that POSTs alerts as JSON to a webhook endpoint.
pub struct WebhookAlertSink {
    client: Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self.client.post(&self.url).json(alert).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AlertError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}
