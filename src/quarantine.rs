//! Quarantine sink for failed partitions.
//!
//! When the quality gate fails, the offending curated partitions are
//! copied aside (never moved, so the source stays available for
//! debugging), recorded in the quarantine ledger, and announced with one
//! warning alert per failing partition. A failure while writing the
//! quarantine copy itself is escalated with a critical alert.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::alert::{Alert, AlertSink, Severity};
use crate::error::ErrorKind;
use crate::lake::{LakeError, LakeStore};
use crate::partition::{LakeLayer, Partition};
use crate::quality::{EntityReport, QualityReport};
use crate::storage::{QuarantineRecord, RunStore, StoreError};

/// Errors that can occur while quarantining partitions.
#[derive(Debug, Error)]
pub enum QuarantineError {
    /// Copying the partition or its report failed.
    #[error("Quarantine write failed: {0}")]
    Lake(#[from] LakeError),

    /// Recording the quarantine in the ledger failed.
    #[error("Quarantine ledger write failed: {0}")]
    Store(#[from] StoreError),

    /// Serializing the entity report failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QuarantineError {
    /// Maps this error onto the pipeline failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuarantineError::Lake(_) => ErrorKind::Transient,
            QuarantineError::Store(e) => e.kind(),
            QuarantineError::Serialization(_) => ErrorKind::Schema,
        }
    }
}

/// Copies failing partitions into the quarantine area and records them.
pub struct QuarantineSink {
    lake: Arc<LakeStore>,
    store: Arc<dyn RunStore>,
    alerts: Arc<dyn AlertSink>,
}

impl QuarantineSink {
    /// Creates a new quarantine sink.
    pub fn new(lake: Arc<LakeStore>, store: Arc<dyn RunStore>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            lake,
            store,
            alerts,
        }
    }

    /// Quarantines every failing partition named in the report.
    ///
    /// Each failing entity gets its curated partition copied under a
    /// location keyed by entity, process date, and run id, a `report.json`
    /// with the check results next to the data, a ledger entry, and one
    /// warning alert. Returns the ledger entries written.
    ///
    /// The first write failure stops the sink: the error is escalated with
    /// a critical alert and propagated so the run records it.
    pub async fn quarantine_failures(
        &self,
        report: &QualityReport,
    ) -> Result<Vec<QuarantineRecord>, QuarantineError> {
        let mut records = Vec::new();

        for entity_report in report.failing_entities() {
            let record = match self.quarantine_entity(report, entity_report).await {
                Ok(record) => record,
                Err(e) => {
                    self.escalate(report, &entity_report.entity, &e).await;
                    return Err(e);
                }
            };

            let alert = Alert::new(
                Severity::Warning,
                &report.entity_group,
                report.process_date,
                report.run_id,
                format!(
                    "Partition '{}' for {} failed the quality gate and was quarantined",
                    entity_report.entity, report.process_date
                ),
            )
            .with_entity(&entity_report.entity)
            .with_failing_checks(entity_report.failing_checks());

            if let Err(e) = self.alerts.send(&alert).await {
                warn!(
                    entity = %entity_report.entity,
                    error = %e,
                    "Failed to deliver quarantine alert"
                );
            }

            info!(
                entity = %entity_report.entity,
                location = %record.location,
                failing_checks = ?record.failing_checks,
                "Partition quarantined"
            );
            records.push(record);
        }

        Ok(records)
    }

    /// Copies one entity's partition aside and writes the ledger entry.
    async fn quarantine_entity(
        &self,
        report: &QualityReport,
        entity_report: &EntityReport,
    ) -> Result<QuarantineRecord, QuarantineError> {
        let source = Partition::new(
            LakeLayer::Curated,
            &entity_report.entity,
            report.process_date,
        );
        let dest = self
            .lake
            .quarantine_dir(&entity_report.entity, report.process_date, report.run_id);

        let copied = self.lake.copy_partition(&source, &dest).await?;

        let report_json = serde_json::to_value(entity_report)?;
        self.lake
            .write_json(&dest.join("report.json"), &report_json)
            .await?;

        info!(
            entity = %entity_report.entity,
            files = copied,
            "Copied failing partition into quarantine"
        );

        let record = QuarantineRecord::new(
            report.run_id,
            &entity_report.entity,
            report.process_date,
            dest.display().to_string(),
        )
        .with_failing_checks(entity_report.failing_checks());

        self.store.insert_quarantine(&record).await?;
        Ok(record)
    }

    /// Escalates a quarantine-write failure with a critical alert.
    async fn escalate(&self, report: &QualityReport, entity: &str, cause: &QuarantineError) {
        error!(entity = entity, error = %cause, "Quarantine write failed");

        let alert = Alert::new(
            Severity::Critical,
            &report.entity_group,
            report.process_date,
            report.run_id,
            format!("Quarantine write failed for '{}': {}", entity, cause),
        )
        .with_entity(entity);

        if let Err(e) = self.alerts.send(&alert).await {
            error!(error = %e, "Failed to deliver escalation alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertError;
    use crate::lake::Record;
    use crate::quality::{CheckKind, CheckResult};
    use crate::storage::MemoryRunStore;
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use uuid::Uuid;

    /// Alert sink that records what it is asked to send.
    struct RecordingAlertSink {
        sent: Mutex<Vec<Alert>>,
    }

    impl RecordingAlertSink {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<Alert> {
            self.sent.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingAlertSink {
        async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
            self.sent.lock().expect("lock poisoned").push(alert.clone());
            Ok(())
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(key: &str) -> Record {
        let mut map = Record::new();
        map.insert(
            "customer_id".to_string(),
            serde_json::Value::String(key.to_string()),
        );
        map
    }

    fn failing_report(entity: &str, process_date: NaiveDate) -> QualityReport {
        let mut entity_report = EntityReport::new(entity, 3);
        entity_report.push(
            CheckResult::fail(CheckKind::NullRate, "null rate 0.4 exceeds threshold 0.05")
                .with_observed(0.4, 0.05),
        );
        let mut report = QualityReport::new("customer360", process_date, Uuid::new_v4(), Utc::now());
        report.push(entity_report);
        report
    }

    fn sink_over(
        tmp: &TempDir,
    ) -> (
        Arc<LakeStore>,
        Arc<MemoryRunStore>,
        Arc<RecordingAlertSink>,
        QuarantineSink,
    ) {
        let root = tmp.path();
        let lake = Arc::new(LakeStore::new(
            root.join("raw"),
            root.join("clean"),
            root.join("curated"),
            root.join("quarantine"),
        ));
        let store = Arc::new(MemoryRunStore::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let sink = QuarantineSink::new(lake.clone(), store.clone(), alerts.clone());
        (lake, store, alerts, sink)
    }

    #[tokio::test]
    async fn test_quarantine_copies_without_moving_source() {
        let tmp = TempDir::new().unwrap();
        let (lake, store, alerts, sink) = sink_over(&tmp);
        let process_date = date(2024, 1, 15);

        let partition = Partition::new(LakeLayer::Curated, "transactions", process_date);
        lake.write_partition(&partition, &[record("T1"), record("T2"), record("T3")])
            .await
            .unwrap();

        let report = failing_report("transactions", process_date);
        let records = sink.quarantine_failures(&report).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity, "transactions");
        assert_eq!(records[0].failing_checks, vec!["null_rate".to_string()]);

        // The curated source is still readable.
        let source_rows = lake.read_partition(&partition).await.unwrap();
        assert_eq!(source_rows.len(), 3);

        // The copy and its report landed under the run-keyed directory.
        let dest = lake.quarantine_dir("transactions", process_date, report.run_id);
        assert!(dest.join("part-00000.jsonl").exists());
        assert!(dest.join("report.json").exists());

        // Ledger entry and exactly one warning alert.
        let ledger = store.list_quarantine(process_date).await.unwrap();
        assert_eq!(ledger.len(), 1);
        let sent = alerts.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Warning);
        assert_eq!(sent[0].entity.as_deref(), Some("transactions"));
        assert_eq!(sent[0].failing_checks, vec!["null_rate".to_string()]);
    }

    #[tokio::test]
    async fn test_nothing_quarantined_when_all_entities_pass() {
        let tmp = TempDir::new().unwrap();
        let (_lake, store, alerts, sink) = sink_over(&tmp);
        let process_date = date(2024, 1, 15);

        let mut entity_report = EntityReport::new("customers", 10);
        entity_report.push(CheckResult::pass(CheckKind::Schema, "all rows conform"));
        let mut report = QualityReport::new("customer360", process_date, Uuid::new_v4(), Utc::now());
        report.push(entity_report);

        let records = sink.quarantine_failures(&report).await.unwrap();
        assert!(records.is_empty());
        assert!(store.list_quarantine(process_date).await.unwrap().is_empty());
        assert!(alerts.sent().is_empty());
    }

    #[tokio::test]
    async fn test_one_alert_per_failing_partition() {
        let tmp = TempDir::new().unwrap();
        let (lake, _store, alerts, sink) = sink_over(&tmp);
        let process_date = date(2024, 1, 15);

        for entity in ["transactions", "clickstream"] {
            let partition = Partition::new(LakeLayer::Curated, entity, process_date);
            lake.write_partition(&partition, &[record("X1")]).await.unwrap();
        }

        let mut report = QualityReport::new("customer360", process_date, Uuid::new_v4(), Utc::now());
        for entity in ["transactions", "clickstream"] {
            let mut entity_report = EntityReport::new(entity, 1);
            entity_report.push(CheckResult::fail(CheckKind::Freshness, "stale partition"));
            report.push(entity_report);
        }

        let records = sink.quarantine_failures(&report).await.unwrap();
        assert_eq!(records.len(), 2);

        let sent = alerts.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|a| a.severity == Severity::Warning));
    }

    #[tokio::test]
    async fn test_write_failure_escalates_with_critical_alert() {
        let tmp = TempDir::new().unwrap();
        let (_lake, store, alerts, sink) = sink_over(&tmp);
        let process_date = date(2024, 1, 15);

        // No curated partition was ever written, so the copy must fail.
        let report = failing_report("transactions", process_date);
        let err = sink.quarantine_failures(&report).await.unwrap_err();
        assert!(matches!(err, QuarantineError::Lake(_)));

        let sent = alerts.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Critical);
        assert!(sent[0].message.contains("Quarantine write failed"));
        assert!(store.list_quarantine(process_date).await.unwrap().is_empty());
    }
}
