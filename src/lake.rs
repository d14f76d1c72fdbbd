//! Lake access for partitioned JSONL data.
//!
//! Each layer of the lake (raw, clean, curated, quarantine) is a directory
//! tree of daily partitions holding newline-delimited JSON files named
//! `part-*.jsonl`. Stage jobs produce and consume these files; this module
//! gives the orchestrator, the quality gate, and the quarantine sink a
//! single place to read, write, and copy them.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::partition::{LakeLayer, Partition};

/// A single data record: one parsed JSONL line.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Errors that can occur while reading or writing lake partitions.
#[derive(Debug, Error)]
pub enum LakeError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The partition directory does not exist.
    #[error("Partition not found: {0}")]
    PartitionMissing(String),

    /// A line in a part file could not be parsed as a JSON object.
    #[error("Malformed record in {path} at line {line}: {message}")]
    MalformedRecord {
        path: String,
        line: usize,
        message: String,
    },

    /// JSON serialization failed.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Partition directory creation failed.
    #[error("Failed to create partition directory: {0}")]
    DirectoryCreationFailed(String),
}

/// Filesystem-backed view over the four lake layers.
pub struct LakeStore {
    raw_root: PathBuf,
    clean_root: PathBuf,
    curated_root: PathBuf,
    quarantine_root: PathBuf,
}

impl LakeStore {
    /// Creates a lake store over explicit layer roots.
    pub fn new(
        raw_root: impl Into<PathBuf>,
        clean_root: impl Into<PathBuf>,
        curated_root: impl Into<PathBuf>,
        quarantine_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            raw_root: raw_root.into(),
            clean_root: clean_root.into(),
            curated_root: curated_root.into(),
            quarantine_root: quarantine_root.into(),
        }
    }

    /// Creates a lake store from the configured layer roots.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            &config.raw_root,
            &config.clean_root,
            &config.curated_root,
            &config.quarantine_root,
        )
    }

    /// Returns the root directory for a lake layer.
    pub fn layer_root(&self, layer: LakeLayer) -> &Path {
        match layer {
            LakeLayer::Raw => &self.raw_root,
            LakeLayer::Clean => &self.clean_root,
            LakeLayer::Curated => &self.curated_root,
            LakeLayer::Quarantine => &self.quarantine_root,
        }
    }

    /// Absolute directory for a partition.
    pub fn partition_dir(&self, partition: &Partition) -> PathBuf {
        self.layer_root(partition.layer)
            .join(partition.relative_path())
    }

    /// Directory a quarantined partition is copied into. Keyed by entity,
    /// process date, and run id so repeated quarantines never collide.
    pub fn quarantine_dir(&self, entity: &str, date: NaiveDate, run_id: Uuid) -> PathBuf {
        let partition = Partition::new(LakeLayer::Quarantine, entity, date);
        self.quarantine_root
            .join(partition.relative_path())
            .join(run_id.to_string())
    }

    /// Lists the part files of a partition in name order.
    ///
    /// Returns `PartitionMissing` when the directory does not exist.
    pub async fn partition_files(&self, partition: &Partition) -> Result<Vec<PathBuf>, LakeError> {
        let dir = self.partition_dir(partition);
        if !dir.exists() {
            return Err(LakeError::PartitionMissing(partition.key()));
        }

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && is_part_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        Ok(files)
    }

    /// Whether a partition exists and holds at least one non-empty part
    /// file. This is the ingest check: a missing or empty partition means
    /// upstream delivery has not landed data for the process date.
    pub async fn has_data(&self, partition: &Partition) -> Result<bool, LakeError> {
        let dir = self.partition_dir(partition);
        if !dir.exists() {
            return Ok(false);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && is_part_file(&path) {
                let meta = fs::metadata(&path).await?;
                if meta.len() > 0 {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Reads every record of a partition, part files in name order.
    pub async fn read_partition(&self, partition: &Partition) -> Result<Vec<Record>, LakeError> {
        let files = self.partition_files(partition).await?;

        let mut records = Vec::new();
        for file in files {
            let contents = fs::read_to_string(&file).await?;
            for (idx, line) in contents.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let value: serde_json::Value =
                    serde_json::from_str(line).map_err(|e| LakeError::MalformedRecord {
                        path: file.display().to_string(),
                        line: idx + 1,
                        message: e.to_string(),
                    })?;

                match value {
                    serde_json::Value::Object(map) => records.push(map),
                    other => {
                        return Err(LakeError::MalformedRecord {
                            path: file.display().to_string(),
                            line: idx + 1,
                            message: format!("expected a JSON object, got {}", value_kind(&other)),
                        })
                    }
                }
            }
        }

        Ok(records)
    }

    /// Writes records as a single part file, replacing any previous write
    /// of the same name. Returns the path of the written file.
    pub async fn write_partition(
        &self,
        partition: &Partition,
        records: &[Record],
    ) -> Result<PathBuf, LakeError> {
        let dir = self.partition_dir(partition);
        fs::create_dir_all(&dir).await.map_err(|e| {
            LakeError::DirectoryCreationFailed(format!(
                "Failed to create partition directory {:?}: {}",
                dir, e
            ))
        })?;

        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        let path = dir.join("part-00000.jsonl");
        fs::write(&path, buf).await?;

        Ok(path)
    }

    /// Copies every part file of a partition into `dest_dir`, leaving the
    /// source untouched. Returns the number of files copied.
    pub async fn copy_partition(
        &self,
        source: &Partition,
        dest_dir: &Path,
    ) -> Result<usize, LakeError> {
        let files = self.partition_files(source).await?;

        fs::create_dir_all(dest_dir).await.map_err(|e| {
            LakeError::DirectoryCreationFailed(format!(
                "Failed to create directory {:?}: {}",
                dest_dir, e
            ))
        })?;

        let mut copied = 0;
        for file in &files {
            if let Some(name) = file.file_name() {
                fs::copy(file, dest_dir.join(name)).await?;
                copied += 1;
            }
        }

        Ok(copied)
    }

    /// Writes a JSON document, creating parent directories as needed.
    pub async fn write_json(&self, path: &Path, value: &serde_json::Value) -> Result<(), LakeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                LakeError::DirectoryCreationFailed(format!(
                    "Failed to create directory {:?}: {}",
                    parent, e
                ))
            })?;
        }

        fs::write(path, serde_json::to_string_pretty(value)?).await?;
        Ok(())
    }
}

fn is_part_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("part-") && n.ends_with(".jsonl"))
        .unwrap_or(false)
}

fn value_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> LakeStore {
        let root = dir.path();
        LakeStore::new(
            root.join("raw"),
            root.join("clean"),
            root.join("curated"),
            root.join("quarantine"),
        )
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn record(id: &str) -> Record {
        let mut map = Record::new();
        map.insert("customer_id".to_string(), json!(id));
        map.insert("email".to_string(), json!(format!("{}@example.com", id)));
        map
    }

    #[tokio::test]
    async fn test_write_then_read_partition() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let partition = Partition::new(LakeLayer::Curated, "customers", date());

        let records = vec![record("C1"), record("C2")];
        let path = store.write_partition(&partition, &records).await.unwrap();
        assert!(path.ends_with("part-00000.jsonl"));

        let read = store.read_partition(&partition).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0]["customer_id"], json!("C1"));
        assert_eq!(read[1]["customer_id"], json!("C2"));
    }

    #[tokio::test]
    async fn test_has_data_reflects_partition_contents() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let partition = Partition::new(LakeLayer::Raw, "transactions", date());

        assert!(!store.has_data(&partition).await.unwrap());

        // An empty part file is not data.
        store.write_partition(&partition, &[]).await.unwrap();
        assert!(!store.has_data(&partition).await.unwrap());

        store
            .write_partition(&partition, &[record("C1")])
            .await
            .unwrap();
        assert!(store.has_data(&partition).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_missing_partition_fails() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let partition = Partition::new(LakeLayer::Clean, "customers", date());

        let err = store.read_partition(&partition).await.unwrap_err();
        assert!(err.to_string().contains("clean/customers/2024-01-15"));
    }

    #[tokio::test]
    async fn test_malformed_line_reports_location() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let partition = Partition::new(LakeLayer::Raw, "customers", date());

        let path = store.partition_dir(&partition);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(
            path.join("part-00000.jsonl"),
            "{\"customer_id\": \"C1\"}\nnot json\n",
        )
        .unwrap();

        let err = store.read_partition(&partition).await.unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_non_object_line_is_malformed() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let partition = Partition::new(LakeLayer::Raw, "customers", date());

        let path = store.partition_dir(&partition);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("part-00000.jsonl"), "[1, 2, 3]\n").unwrap();

        let err = store.read_partition(&partition).await.unwrap_err();
        assert!(err.to_string().contains("expected a JSON object"));
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let partition = Partition::new(LakeLayer::Raw, "customers", date());

        let path = store.partition_dir(&partition);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(
            path.join("part-00000.jsonl"),
            "{\"customer_id\": \"C1\"}\n\n{\"customer_id\": \"C2\"}\n",
        )
        .unwrap();

        let read = store.read_partition(&partition).await.unwrap();
        assert_eq!(read.len(), 2);
    }

    #[tokio::test]
    async fn test_copy_partition_leaves_source_intact() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let partition = Partition::new(LakeLayer::Curated, "customers", date());
        store
            .write_partition(&partition, &[record("C1")])
            .await
            .unwrap();

        let run_id = Uuid::new_v4();
        let dest = store.quarantine_dir("customers", date(), run_id);
        let copied = store.copy_partition(&partition, &dest).await.unwrap();
        assert_eq!(copied, 1);

        // Both copies readable afterwards.
        assert!(dest.join("part-00000.jsonl").exists());
        assert_eq!(store.read_partition(&partition).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quarantine_dir_layout() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let run_id = Uuid::new_v4();

        let path = store.quarantine_dir("transactions", date(), run_id);
        let rendered = path.display().to_string();
        assert!(rendered.contains("quarantine"));
        assert!(rendered.contains("transactions"));
        assert!(rendered.contains("year=2024"));
        assert!(rendered.contains("month=01"));
        assert!(rendered.contains("day=15"));
        assert!(rendered.ends_with(&run_id.to_string()));
    }

    #[tokio::test]
    async fn test_write_json_creates_parents() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let path = dir.path().join("quarantine/reports/report.json");
        store
            .write_json(&path, &json!({"verdict": "fail"}))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("verdict"));
    }
}
