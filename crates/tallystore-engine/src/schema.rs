//! Persisted schema description
//!
//! Every store records the settings that shape its on-disk layout. Opening a
//! store with different settings, or merging stores whose layouts differ,
//! fails with [`Error::SchemaMismatch`] before anything is written.

use serde::{Deserialize, Serialize};
use tallystore_common::config::{KeySchema, MetricSchema};
use tallystore_common::{Error, Result, RetentionBasis, StoreSettings};

/// Bumped whenever the row layout changes incompatibly
pub const SCHEMA_VERSION: u32 = 1;

/// Kind of data a store directory holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Metric,
    State,
}

#[derive(Serialize)]
struct KeySchemaRecord<'a> {
    kind: StoreKind,
    #[serde(flatten)]
    schema: &'a KeySchema,
}

#[derive(Serialize)]
struct MetricValueRecord<'a> {
    #[serde(flatten)]
    schema: &'a MetricSchema,
    retention: RetentionBasis,
}

/// Version plus canonical JSON of the key and value schemas
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub version: u32,
    pub key_schema: String,
    pub value_schema: String,
}

impl SchemaInfo {
    pub fn for_store(kind: StoreKind, settings: &StoreSettings) -> Result<Self> {
        let key_schema = serde_json::to_string(&KeySchemaRecord {
            kind,
            schema: &settings.key_schema,
        })?;
        let value_schema = match kind {
            StoreKind::Metric => serde_json::to_string(&MetricValueRecord {
                schema: &settings.metric_schema,
                retention: settings.retention,
            })?,
            // State rows have a fixed layout
            StoreKind::State => serde_json::to_string(&serde_json::json!({ "layout": "state" }))?,
        };
        Ok(Self {
            version: SCHEMA_VERSION,
            key_schema,
            value_schema,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Fail unless `actual` describes the same layout as `self`
    pub fn ensure_matches(&self, actual: &Self) -> Result<()> {
        if self == actual {
            Ok(())
        } else {
            Err(Error::SchemaMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl std::fmt::Display for SchemaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{} keys={} values={}", self.version, self.key_schema, self.value_schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tallystore_common::{MetricField, Resolution};

    #[test]
    fn test_schema_roundtrip_through_bincode() {
        let info = SchemaInfo::for_store(StoreKind::Metric, &StoreSettings::default()).unwrap();
        let decoded = SchemaInfo::decode(&info.encode().unwrap()).unwrap();
        assert_eq!(decoded, info);
        assert!(info.key_schema.contains("\"kind\":\"metric\""));
    }

    #[test]
    fn test_layout_changes_mismatch() {
        let base = StoreSettings::default();
        let info = SchemaInfo::for_store(StoreKind::Metric, &base).unwrap();

        let mut hourly = base.clone();
        hourly.key_schema.resolution = Resolution::Hour;
        let other = SchemaInfo::for_store(StoreKind::Metric, &hourly).unwrap();
        assert!(matches!(
            info.ensure_matches(&other),
            Err(Error::SchemaMismatch { .. })
        ));

        let mut narrow = base.clone();
        narrow.metric_schema = MetricSchema::uniform(&[MetricField::Count], 4);
        let other = SchemaInfo::for_store(StoreKind::Metric, &narrow).unwrap();
        assert!(info.ensure_matches(&other).is_err());

        let state = SchemaInfo::for_store(StoreKind::State, &base).unwrap();
        assert!(info.ensure_matches(&state).is_err());
    }

    #[test]
    fn test_writer_settings_do_not_affect_schema() {
        let base = StoreSettings::default();
        let mut tuned = base.clone();
        tuned.writer.commit_threshold = 3;
        tuned.cache_size = Some(1 << 20);
        let a = SchemaInfo::for_store(StoreKind::Metric, &base).unwrap();
        let b = SchemaInfo::for_store(StoreKind::Metric, &tuned).unwrap();
        assert!(a.ensure_matches(&b).is_ok());
    }
}
