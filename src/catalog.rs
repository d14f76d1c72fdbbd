//! Entity catalog: declares what the pipeline promotes and how.
//!
//! The catalog is a YAML document naming the entity group, each entity's
//! kind (dimension or fact), its field schemas, keys, references, and
//! optional per-entity quality-threshold overrides. The orchestrator, the
//! quality gate, and the merge engine all read from it; nothing else in the
//! crate hard-codes entity names.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to parse catalog file '{path}': {message}")]
    ParseError { path: String, message: String },

    #[error("Catalog validation failed: {0}")]
    Validation(String),

    #[error("Entity '{0}' not found in catalog")]
    EntityNotFound(String),

    #[error("Invalid pattern '{pattern}' for field '{field}': {message}")]
    InvalidPattern {
        field: String,
        pattern: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Declared type of a field in an entity schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
}

impl FieldType {
    /// Whether a JSON value is coercible to this type.
    ///
    /// Nulls are never judged here; null handling belongs to the null-rate
    /// check, not schema conformance.
    pub fn coercible(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => match value {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => s.parse::<i64>().is_ok(),
                _ => false,
            },
            FieldType::Float => match value {
                Value::Number(_) => true,
                Value::String(s) => s.parse::<f64>().is_ok(),
                _ => false,
            },
            FieldType::Boolean => match value {
                Value::Bool(_) => true,
                Value::String(s) => matches!(s.as_str(), "true" | "false"),
                _ => false,
            },
            FieldType::Date => match value {
                Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
                _ => false,
            },
            FieldType::Timestamp => parse_timestamp_value(value).is_some(),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Timestamp => "timestamp",
        };
        write!(f, "{}", s)
    }
}

/// Parses a JSON value into a UTC timestamp.
///
/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD HH:MM:SS`, and bare
/// dates (interpreted as midnight UTC).
pub fn parse_timestamp_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    None
}

/// Parses a JSON value into a calendar date, truncating timestamps.
pub fn parse_date_value(value: &serde_json::Value) -> Option<NaiveDate> {
    let s = value.as_str()?;
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date);
    }
    parse_timestamp_value(value).map(|ts| ts.date_naive())
}

/// Renders a JSON value as a comparable key string.
///
/// Strings are used as-is so `"C100"` and `C100` in different part files
/// compare equal; numbers and booleans use their canonical JSON form.
/// Nulls have no key.
pub fn value_to_key(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Schema for a single field of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Field name as it appears in partition rows.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether the field must be present in every row.
    #[serde(default)]
    pub required: bool,
    /// Optional regex the string form of the value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Optional lower bound for numeric fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Optional upper bound for numeric fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl FieldSchema {
    /// Creates a new optional field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            pattern: None,
            min: None,
            max: None,
        }
    }

    /// Creates a new required field.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            pattern: None,
            min: None,
            max: None,
        }
    }

    /// Sets a regex pattern constraint.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Sets a numeric lower bound.
    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Sets a numeric upper bound.
    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Validates the field schema.
    pub fn validate(&self, entity: &str) -> Result<(), CatalogError> {
        if self.name.is_empty() {
            return Err(CatalogError::Validation(format!(
                "Entity '{}': field name cannot be empty",
                entity
            )));
        }

        if let Some(pattern) = &self.pattern {
            regex::Regex::new(pattern).map_err(|e| CatalogError::InvalidPattern {
                field: format!("{}.{}", entity, self.name),
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        }

        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(CatalogError::Validation(format!(
                    "Entity '{}': field '{}' has min {} greater than max {}",
                    entity, self.name, min, max
                )));
            }
        }

        Ok(())
    }
}

/// Kind of an entity, selecting its warehouse merge strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Loaded with UPSERT_BY_KEY on the natural key.
    Dimension,
    /// Loaded with REPLACE_PARTITION on the date key.
    Fact,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Dimension => write!(f, "dimension"),
            EntityKind::Fact => write!(f, "fact"),
        }
    }
}

/// A foreign-key reference from a fact field to a dimension entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    /// Field in this entity carrying the key.
    pub field: String,
    /// Dimension entity the key must resolve against.
    pub entity: String,
}

/// Configuration for a single entity in the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Entity name; also the partition directory name in the lake.
    pub name: String,
    /// Dimension or fact.
    pub kind: EntityKind,
    /// Declared primary key field.
    pub primary_key: String,
    /// Target warehouse table.
    pub warehouse_table: String,
    /// Date key field; required for facts, unused for dimensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_key: Option<String>,
    /// Field schemas.
    pub fields: Vec<FieldSchema>,
    /// Foreign-key references to dimension entities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
    /// Field carrying event time for the freshness check; skipped if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness_column: Option<String>,
    /// Per-entity override of the null-rate threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_null_rate: Option<f64>,
    /// Per-entity override of the duplicate-rate threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duplicate_rate: Option<f64>,
    /// Per-entity override of the row-count floor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_row_count: Option<u64>,
}

impl EntityConfig {
    /// Creates a new entity configuration with no fields.
    pub fn new(
        name: impl Into<String>,
        kind: EntityKind,
        primary_key: impl Into<String>,
        warehouse_table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            primary_key: primary_key.into(),
            warehouse_table: warehouse_table.into(),
            date_key: None,
            fields: Vec::new(),
            references: Vec::new(),
            freshness_column: None,
            max_null_rate: None,
            max_duplicate_rate: None,
            min_row_count: None,
        }
    }

    /// Adds a field schema.
    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds a foreign-key reference.
    pub fn with_reference(mut self, field: impl Into<String>, entity: impl Into<String>) -> Self {
        self.references.push(Reference {
            field: field.into(),
            entity: entity.into(),
        });
        self
    }

    /// Sets the date key field.
    pub fn with_date_key(mut self, field: impl Into<String>) -> Self {
        self.date_key = Some(field.into());
        self
    }

    /// Sets the freshness column.
    pub fn with_freshness_column(mut self, field: impl Into<String>) -> Self {
        self.freshness_column = Some(field.into());
        self
    }

    /// Sets the per-entity row-count floor.
    pub fn with_min_row_count(mut self, count: u64) -> Self {
        self.min_row_count = Some(count);
        self
    }

    /// Sets a per-entity null-rate threshold.
    pub fn with_max_null_rate(mut self, rate: f64) -> Self {
        self.max_null_rate = Some(rate);
        self
    }

    /// Sets a per-entity duplicate-rate threshold.
    pub fn with_max_duplicate_rate(mut self, rate: f64) -> Self {
        self.max_duplicate_rate = Some(rate);
        self
    }

    /// Looks up a field schema by name.
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether this entity is a dimension.
    pub fn is_dimension(&self) -> bool {
        self.kind == EntityKind::Dimension
    }

    /// Validates the entity configuration.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.name.is_empty() {
            return Err(CatalogError::Validation(
                "entity name cannot be empty".to_string(),
            ));
        }

        if self.warehouse_table.is_empty() {
            return Err(CatalogError::Validation(format!(
                "Entity '{}': warehouse_table cannot be empty",
                self.name
            )));
        }

        if self.fields.is_empty() {
            return Err(CatalogError::Validation(format!(
                "Entity '{}': must declare at least one field",
                self.name
            )));
        }

        for field in &self.fields {
            field.validate(&self.name)?;
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(CatalogError::Validation(format!(
                    "Entity '{}': duplicate field '{}'",
                    self.name, field.name
                )));
            }
        }

        if self.field(&self.primary_key).is_none() {
            return Err(CatalogError::Validation(format!(
                "Entity '{}': primary key '{}' is not a declared field",
                self.name, self.primary_key
            )));
        }

        match self.kind {
            EntityKind::Fact => {
                let date_key = self.date_key.as_deref().ok_or_else(|| {
                    CatalogError::Validation(format!(
                        "Entity '{}': fact entities must declare a date_key",
                        self.name
                    ))
                })?;
                match self.field(date_key) {
                    Some(f)
                        if matches!(f.field_type, FieldType::Date | FieldType::Timestamp) => {}
                    Some(_) => {
                        return Err(CatalogError::Validation(format!(
                            "Entity '{}': date_key '{}' must be a date or timestamp field",
                            self.name, date_key
                        )))
                    }
                    None => {
                        return Err(CatalogError::Validation(format!(
                            "Entity '{}': date_key '{}' is not a declared field",
                            self.name, date_key
                        )))
                    }
                }
            }
            EntityKind::Dimension => {
                if !self.references.is_empty() {
                    return Err(CatalogError::Validation(format!(
                        "Entity '{}': dimension entities cannot declare references",
                        self.name
                    )));
                }
            }
        }

        for reference in &self.references {
            if self.field(&reference.field).is_none() {
                return Err(CatalogError::Validation(format!(
                    "Entity '{}': reference field '{}' is not a declared field",
                    self.name, reference.field
                )));
            }
        }

        if let Some(col) = &self.freshness_column {
            match self.field(col) {
                Some(f) if matches!(f.field_type, FieldType::Date | FieldType::Timestamp) => {}
                Some(_) => {
                    return Err(CatalogError::Validation(format!(
                        "Entity '{}': freshness_column '{}' must be a date or timestamp field",
                        self.name, col
                    )))
                }
                None => {
                    return Err(CatalogError::Validation(format!(
                        "Entity '{}': freshness_column '{}' is not a declared field",
                        self.name, col
                    )))
                }
            }
        }

        for (label, rate) in [
            ("max_null_rate", self.max_null_rate),
            ("max_duplicate_rate", self.max_duplicate_rate),
        ] {
            if let Some(rate) = rate {
                if !(0.0..=1.0).contains(&rate) {
                    return Err(CatalogError::Validation(format!(
                        "Entity '{}': {} must be between 0.0 and 1.0",
                        self.name, label
                    )));
                }
            }
        }

        Ok(())
    }
}

/// The entity group a pipeline instance promotes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCatalog {
    /// Entity group name; part of the lease key.
    pub group: String,
    /// Entities in declaration order; dimensions merge in this order.
    pub entities: Vec<EntityConfig>,
}

impl EntityCatalog {
    /// Creates an empty catalog for a group.
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            entities: Vec::new(),
        }
    }

    /// Adds an entity.
    pub fn with_entity(mut self, entity: EntityConfig) -> Self {
        self.entities.push(entity);
        self
    }

    /// Loads and validates a catalog from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(CatalogError::Io)?;
        let catalog: Self =
            serde_yaml::from_str(&content).map_err(|e| CatalogError::ParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parses and validates a catalog from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self, CatalogError> {
        let catalog: Self = serde_yaml::from_str(content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// The customer-360 retail catalog shipped as the default example.
    pub fn example() -> Self {
        Self::new("customer360")
            .with_entity(
                EntityConfig::new("customers", EntityKind::Dimension, "customer_id", "dim_customer")
                    .with_field(FieldSchema::required("customer_id", FieldType::String))
                    .with_field(
                        FieldSchema::required("email", FieldType::String)
                            .with_pattern(r"^[^@\s]+@[^@\s]+$"),
                    )
                    .with_field(FieldSchema::required("signup_date", FieldType::Date))
                    .with_field(FieldSchema::new("segment", FieldType::String)),
            )
            .with_entity(
                EntityConfig::new("products", EntityKind::Dimension, "product_id", "dim_product")
                    .with_field(FieldSchema::required("product_id", FieldType::String))
                    .with_field(FieldSchema::required("category", FieldType::String))
                    .with_field(FieldSchema::required("price", FieldType::Float).with_min(0.0)),
            )
            .with_entity(
                EntityConfig::new("transactions", EntityKind::Fact, "transaction_id", "fact_sales")
                    .with_date_key("transaction_date")
                    .with_freshness_column("transaction_date")
                    .with_field(FieldSchema::required("transaction_id", FieldType::String))
                    .with_field(FieldSchema::required("customer_id", FieldType::String))
                    .with_field(FieldSchema::required("product_id", FieldType::String))
                    .with_field(FieldSchema::required("amount", FieldType::Float).with_min(0.0))
                    .with_field(FieldSchema::required("transaction_date", FieldType::Timestamp))
                    .with_reference("customer_id", "customers")
                    .with_reference("product_id", "products"),
            )
            .with_entity(
                EntityConfig::new("clickstream", EntityKind::Fact, "event_id", "fact_clickstream")
                    .with_date_key("event_timestamp")
                    .with_freshness_column("event_timestamp")
                    .with_field(FieldSchema::required("event_id", FieldType::String))
                    .with_field(FieldSchema::required("customer_id", FieldType::String))
                    .with_field(FieldSchema::required("event_type", FieldType::String))
                    .with_field(FieldSchema::required("event_timestamp", FieldType::Timestamp))
                    .with_reference("customer_id", "customers"),
            )
    }

    /// Looks up an entity by name.
    pub fn entity(&self, name: &str) -> Result<&EntityConfig, CatalogError> {
        self.entities
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| CatalogError::EntityNotFound(name.to_string()))
    }

    /// Dimension entities in declaration order.
    pub fn dimensions(&self) -> Vec<&EntityConfig> {
        self.entities.iter().filter(|e| e.is_dimension()).collect()
    }

    /// Fact entities in declaration order.
    pub fn facts(&self) -> Vec<&EntityConfig> {
        self.entities.iter().filter(|e| !e.is_dimension()).collect()
    }

    /// Merge order: all dimensions, then all facts.
    pub fn merge_order(&self) -> Vec<&EntityConfig> {
        let mut ordered = self.dimensions();
        ordered.extend(self.facts());
        ordered
    }

    /// Validates group, entities, and cross-entity references.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.group.is_empty() {
            return Err(CatalogError::Validation(
                "group cannot be empty".to_string(),
            ));
        }

        if self.entities.is_empty() {
            return Err(CatalogError::Validation(
                "catalog must declare at least one entity".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut tables = HashSet::new();
        for entity in &self.entities {
            entity.validate()?;
            if !names.insert(entity.name.as_str()) {
                return Err(CatalogError::Validation(format!(
                    "Duplicate entity '{}'",
                    entity.name
                )));
            }
            if !tables.insert(entity.warehouse_table.as_str()) {
                return Err(CatalogError::Validation(format!(
                    "Duplicate warehouse table '{}'",
                    entity.warehouse_table
                )));
            }
        }

        for entity in &self.entities {
            for reference in &entity.references {
                match self.entities.iter().find(|e| e.name == reference.entity) {
                    Some(target) if target.is_dimension() => {}
                    Some(_) => {
                        return Err(CatalogError::Validation(format!(
                            "Entity '{}': reference '{}' targets fact entity '{}'",
                            entity.name, reference.field, reference.entity
                        )))
                    }
                    None => {
                        return Err(CatalogError::Validation(format!(
                            "Entity '{}': reference '{}' targets unknown entity '{}'",
                            entity.name, reference.field, reference.entity
                        )))
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_example_catalog_is_valid() {
        let catalog = EntityCatalog::example();
        assert!(catalog.validate().is_ok());
        assert_eq!(catalog.group, "customer360");
        assert_eq!(catalog.entities.len(), 4);
        assert_eq!(catalog.dimensions().len(), 2);
        assert_eq!(catalog.facts().len(), 2);
    }

    #[test]
    fn test_merge_order_dimensions_first() {
        let catalog = EntityCatalog::example();
        let order: Vec<&str> = catalog.merge_order().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            order,
            vec!["customers", "products", "transactions", "clickstream"]
        );
    }

    #[test]
    fn test_entity_lookup() {
        let catalog = EntityCatalog::example();
        let entity = catalog.entity("transactions").unwrap();
        assert_eq!(entity.warehouse_table, "fact_sales");
        assert_eq!(entity.date_key.as_deref(), Some("transaction_date"));

        let err = catalog.entity("orders").unwrap_err();
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = serde_yaml::to_string(&EntityCatalog::example()).unwrap();
        let parsed = EntityCatalog::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed, EntityCatalog::example());
    }

    #[test]
    fn test_from_yaml_str_minimal() {
        let yaml = r#"
group: retail
entities:
  - name: stores
    kind: dimension
    primary_key: store_id
    warehouse_table: dim_store
    fields:
      - name: store_id
        type: string
        required: true
      - name: region
        type: string
"#;
        let catalog = EntityCatalog::from_yaml_str(yaml).unwrap();
        assert_eq!(catalog.group, "retail");
        assert_eq!(catalog.entities[0].primary_key, "store_id");
        assert!(catalog.entities[0].is_dimension());
    }

    #[test]
    fn test_fact_requires_date_key() {
        let catalog = EntityCatalog::new("g").with_entity(
            EntityConfig::new("events", EntityKind::Fact, "event_id", "fact_events")
                .with_field(FieldSchema::required("event_id", FieldType::String)),
        );
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("date_key"));
    }

    #[test]
    fn test_primary_key_must_be_declared() {
        let catalog = EntityCatalog::new("g").with_entity(
            EntityConfig::new("stores", EntityKind::Dimension, "store_id", "dim_store")
                .with_field(FieldSchema::required("name", FieldType::String)),
        );
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("primary key"));
    }

    #[test]
    fn test_reference_must_target_dimension() {
        let catalog = EntityCatalog::new("g")
            .with_entity(
                EntityConfig::new("a", EntityKind::Fact, "id", "fact_a")
                    .with_date_key("ts")
                    .with_field(FieldSchema::required("id", FieldType::String))
                    .with_field(FieldSchema::required("ts", FieldType::Timestamp))
                    .with_field(FieldSchema::required("b_id", FieldType::String))
                    .with_reference("b_id", "b"),
            )
            .with_entity(
                EntityConfig::new("b", EntityKind::Fact, "id", "fact_b")
                    .with_date_key("ts")
                    .with_field(FieldSchema::required("id", FieldType::String))
                    .with_field(FieldSchema::required("ts", FieldType::Timestamp)),
            );
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("targets fact entity"));
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let entity = EntityConfig::new("stores", EntityKind::Dimension, "id", "dim_store")
            .with_field(FieldSchema::required("id", FieldType::String));
        let mut dup = entity.clone();
        dup.warehouse_table = "dim_store_2".to_string();
        let catalog = EntityCatalog::new("g").with_entity(entity).with_entity(dup);
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate entity"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let catalog = EntityCatalog::new("g").with_entity(
            EntityConfig::new("stores", EntityKind::Dimension, "id", "dim_store")
                .with_field(FieldSchema::required("id", FieldType::String).with_pattern("[unclosed")),
        );
        let err = catalog.validate().unwrap_err();
        assert!(matches!(err, CatalogError::InvalidPattern { .. }));
    }

    #[test]
    fn test_field_type_coercion() {
        assert!(FieldType::String.coercible(&json!("abc")));
        assert!(!FieldType::String.coercible(&json!(42)));

        assert!(FieldType::Integer.coercible(&json!(42)));
        assert!(FieldType::Integer.coercible(&json!("42")));
        assert!(!FieldType::Integer.coercible(&json!(4.5)));

        assert!(FieldType::Float.coercible(&json!(4.5)));
        assert!(FieldType::Float.coercible(&json!(42)));
        assert!(FieldType::Float.coercible(&json!("4.5")));
        assert!(!FieldType::Float.coercible(&json!("abc")));

        assert!(FieldType::Boolean.coercible(&json!(true)));
        assert!(FieldType::Boolean.coercible(&json!("false")));

        assert!(FieldType::Date.coercible(&json!("2024-01-15")));
        assert!(!FieldType::Date.coercible(&json!("15/01/2024")));

        assert!(FieldType::Timestamp.coercible(&json!("2024-01-15T10:30:00Z")));
        assert!(FieldType::Timestamp.coercible(&json!("2024-01-15 10:30:00")));
        assert!(FieldType::Timestamp.coercible(&json!("2024-01-15")));
    }

    #[test]
    fn test_parse_date_value_truncates_timestamps() {
        assert_eq!(
            parse_date_value(&json!("2024-01-15T23:59:59Z")),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(
            parse_date_value(&json!("2024-01-15")),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(parse_date_value(&json!(42)), None);
    }

    #[test]
    fn test_dimension_cannot_declare_references() {
        let catalog = EntityCatalog::new("g").with_entity(
            EntityConfig::new("stores", EntityKind::Dimension, "id", "dim_store")
                .with_field(FieldSchema::required("id", FieldType::String))
                .with_reference("id", "other"),
        );
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("cannot declare references"));
    }
}
