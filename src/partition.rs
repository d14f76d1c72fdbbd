//! Partition addressing across lake layers.
//!
//! A partition is one entity's data for one process date in one layer.
//! Raw partitions are immutable and append-only; clean and curated
//! partitions are wholly replaced by each run; quarantine holds copies of
//! partitions that failed the gate.

use std::path::PathBuf;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Layers of the lake, in promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LakeLayer {
    Raw,
    Clean,
    Curated,
    Quarantine,
}

impl std::fmt::Display for LakeLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LakeLayer::Raw => "raw",
            LakeLayer::Clean => "clean",
            LakeLayer::Curated => "curated",
            LakeLayer::Quarantine => "quarantine",
        };
        write!(f, "{}", s)
    }
}

/// One entity's slice of data for one date in one layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub layer: LakeLayer,
    pub entity: String,
    pub date: NaiveDate,
}

impl Partition {
    /// Creates a partition reference.
    pub fn new(layer: LakeLayer, entity: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            layer,
            entity: entity.into(),
            date,
        }
    }

    /// The same entity and date in a different layer.
    pub fn in_layer(&self, layer: LakeLayer) -> Self {
        Self {
            layer,
            entity: self.entity.clone(),
            date: self.date,
        }
    }

    /// Stable partition key, e.g. `curated/customers/2024-01-15`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.layer, self.entity, self.date)
    }

    /// Path relative to the layer root, in Hive-style date directories,
    /// e.g. `customers/year=2024/month=01/day=15`.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.entity)
            .join(format!("year={:04}", self.date.year()))
            .join(format!("month={:02}", self.date.month()))
            .join(format!("day={:02}", self.date.day()))
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Half-open calendar-month bounds containing `date`: the first day of its
/// month and the first day of the next month.
pub fn month_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start =
        NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first day of month is valid");
    let end = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
    .expect("first day of next month is valid");
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_partition_key_and_display() {
        let p = Partition::new(LakeLayer::Curated, "customers", date(2024, 1, 15));
        assert_eq!(p.key(), "curated/customers/2024-01-15");
        assert_eq!(p.to_string(), "curated/customers/2024-01-15");
    }

    #[test]
    fn test_relative_path_is_hive_style() {
        let p = Partition::new(LakeLayer::Raw, "clickstream", date(2024, 3, 5));
        assert_eq!(
            p.relative_path(),
            PathBuf::from("clickstream/year=2024/month=03/day=05")
        );
    }

    #[test]
    fn test_in_layer_keeps_entity_and_date() {
        let raw = Partition::new(LakeLayer::Raw, "products", date(2024, 6, 30));
        let curated = raw.in_layer(LakeLayer::Curated);
        assert_eq!(curated.layer, LakeLayer::Curated);
        assert_eq!(curated.entity, "products");
        assert_eq!(curated.date, raw.date);
    }

    #[test]
    fn test_month_bounds_mid_year() {
        let (start, end) = month_bounds(date(2024, 1, 15));
        assert_eq!(start, date(2024, 1, 1));
        assert_eq!(end, date(2024, 2, 1));
    }

    #[test]
    fn test_month_bounds_december_rolls_over() {
        let (start, end) = month_bounds(date(2023, 12, 31));
        assert_eq!(start, date(2023, 12, 1));
        assert_eq!(end, date(2024, 1, 1));
    }

    #[test]
    fn test_layer_display() {
        assert_eq!(LakeLayer::Raw.to_string(), "raw");
        assert_eq!(LakeLayer::Quarantine.to_string(), "quarantine");
    }
}
