//! Configuration types for tallystore
//!
//! This module defines the settings used to open stores and size the buffer
//! pool. Everything here is `serde`-friendly so it can be loaded from TOML.

use crate::error::{Error, Result};
use crate::types::{HashAlgorithm, KeyStorage, MetricField, Resolution, RetentionBasis};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Buffers per class when a gap class has no explicit entry
pub const DEFAULT_MAX_BUFFERS_PER_CLASS: usize = 50;

/// Mutations per writer transaction before an automatic commit
pub const DEFAULT_COMMIT_THRESHOLD: usize = 10_000;

/// Settings for opening or creating a store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// How row keys are built
    pub key_schema: KeySchema,
    /// Which aggregate fields are stored and how wide they are
    pub metric_schema: MetricSchema,
    /// Which time retention compares against the cutoff
    pub retention: RetentionBasis,
    /// Writer batching
    pub writer: WriterConfig,
    /// redb page cache size in bytes (redb default when unset)
    pub cache_size: Option<usize>,
}

impl StoreSettings {
    /// Reject settings that cannot produce a usable layout
    pub fn validate(&self) -> Result<()> {
        self.key_schema.validate()?;
        self.metric_schema.validate()?;
        if self.writer.commit_threshold == 0 {
            return Err(Error::configuration("commit_threshold must be at least 1"));
        }
        Ok(())
    }

    /// Whether rows carry a trailing insert time
    #[must_use]
    pub fn tracks_insert_time(&self) -> bool {
        self.retention == RetentionBasis::InsertTime
    }
}

/// Row key layout
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySchema {
    /// Bucket granularity
    pub resolution: Resolution,
    /// Hash used for de-duplicated dimension keys and values
    pub hash_algorithm: HashAlgorithm,
    /// Zone offset (seconds east of UTC) used for truncation
    pub zone_offset_secs: i32,
    /// Inline vs lookup dimension keys
    pub key_storage: KeyStorage,
}

impl Default for KeySchema {
    fn default() -> Self {
        Self {
            resolution: Resolution::Minute,
            hash_algorithm: HashAlgorithm::default(),
            zone_offset_secs: 0,
            key_storage: KeyStorage::default(),
        }
    }
}

impl KeySchema {
    pub fn zone_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.zone_offset_secs).ok_or_else(|| {
            Error::configuration(format!("zone offset {}s out of range", self.zone_offset_secs))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.zone_offset()?;
        Ok(())
    }
}

/// One stored aggregate field and its byte width
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: MetricField,
    /// Unsigned width in bytes, 1 to 8
    pub width: u8,
}

impl FieldSpec {
    #[must_use]
    pub const fn new(field: MetricField, width: u8) -> Self {
        Self { field, width }
    }
}

/// Enabled aggregate fields
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSchema {
    pub fields: Vec<FieldSpec>,
}

impl Default for MetricSchema {
    fn default() -> Self {
        Self {
            fields: MetricField::ALL.iter().map(|&f| FieldSpec::new(f, 8)).collect(),
        }
    }
}

impl MetricSchema {
    /// Schema with the given fields, all at the same width
    #[must_use]
    pub fn uniform(fields: &[MetricField], width: u8) -> Self {
        Self {
            fields: fields.iter().map(|&f| FieldSpec::new(f, width)).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::configuration("metric schema enables no fields"));
        }
        let mut seen = Vec::with_capacity(self.fields.len());
        for spec in &self.fields {
            if !(1..=8).contains(&spec.width) {
                return Err(Error::configuration(format!(
                    "field {} width {} not in 1..=8",
                    spec.field.name(),
                    spec.width
                )));
            }
            if seen.contains(&spec.field) {
                return Err(Error::configuration(format!(
                    "field {} enabled twice",
                    spec.field.name()
                )));
            }
            seen.push(spec.field);
        }
        Ok(())
    }

    /// Width of `field`, or `None` when disabled
    #[must_use]
    pub fn width_of(&self, field: MetricField) -> Option<u8> {
        self.fields.iter().find(|s| s.field == field).map(|s| s.width)
    }

    /// Enabled fields in encoding order, regardless of declaration order
    #[must_use]
    pub fn ordered(&self) -> Vec<FieldSpec> {
        MetricField::ALL
            .iter()
            .filter_map(|&f| self.width_of(f).map(|w| FieldSpec::new(f, w)))
            .collect()
    }
}

/// Writer batching configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Commit automatically once this many mutations are pending
    pub commit_threshold: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            commit_threshold: DEFAULT_COMMIT_THRESHOLD,
        }
    }
}

/// Pool entry for one power-of-ten class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferClassConfig {
    /// Class capacity in bytes (power of ten)
    pub capacity: usize,
    /// Maximum buffers created for the class. 0 disables pooling.
    pub count: usize,
}

/// Buffer pool sizing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub classes: Vec<BufferClassConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let classes = [
            (1, 50),
            (10, 50),
            (100, 50),
            (1_000, 50),
            (10_000, 50),
            (100_000, 10),
            (1_000_000, 3),
        ]
        .into_iter()
        .map(|(capacity, count)| BufferClassConfig { capacity, count })
        .collect();
        Self { classes }
    }
}

impl PoolConfig {
    /// Pool config from a capacity to count map
    #[must_use]
    pub fn from_counts(counts: &BTreeMap<usize, usize>) -> Self {
        Self {
            classes: counts
                .iter()
                .map(|(&capacity, &count)| BufferClassConfig { capacity, count })
                .collect(),
        }
    }

    /// Capacity to count map. Later entries win on duplicate capacities.
    #[must_use]
    pub fn buffer_counts(&self) -> BTreeMap<usize, usize> {
        self.classes.iter().map(|c| (c.capacity, c.count)).collect()
    }
}
