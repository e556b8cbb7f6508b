//! Core type definitions for tallystore
//!
//! This module defines the value types shared by the engine and its tooling:
//! temporal resolutions, aggregate fields, de-duplication keys and stored
//! values.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point in time used for bucketing and retention
pub type Timestamp = DateTime<Utc>;

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_HOUR: i64 = 60 * 60;
const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Granularity at which observations are bucketed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl Resolution {
    /// All resolutions, finest first
    pub const ALL: [Self; 6] = [
        Self::Second,
        Self::Minute,
        Self::Hour,
        Self::Day,
        Self::Month,
        Self::Year,
    ];

    /// Width of the encoded bucket in a row key.
    ///
    /// Seconds since the epoch need 8 bytes; every coarser unit fits an i32.
    #[must_use]
    pub const fn key_width(self) -> usize {
        match self {
            Self::Second => 8,
            _ => 4,
        }
    }

    /// Number of whole resolution units between the epoch and `time`,
    /// measured in the given zone offset.
    #[must_use]
    pub fn to_units(self, time: Timestamp, offset: FixedOffset) -> i64 {
        let local_secs = time.timestamp() + i64::from(offset.local_minus_utc());
        match self {
            Self::Second => time.timestamp(),
            Self::Minute => local_secs.div_euclid(SECS_PER_MINUTE),
            Self::Hour => local_secs.div_euclid(SECS_PER_HOUR),
            Self::Day => local_secs.div_euclid(SECS_PER_DAY),
            Self::Month => {
                let local = time.with_timezone(&offset);
                (i64::from(local.year()) - 1970) * 12 + i64::from(local.month0())
            }
            Self::Year => i64::from(time.with_timezone(&offset).year()) - 1970,
        }
    }

    /// Start of the bucket identified by `units`
    pub fn from_units(self, units: i64, offset: FixedOffset) -> Result<Timestamp> {
        let offset_secs = i64::from(offset.local_minus_utc());
        let secs = match self {
            Self::Second => Some(units),
            Self::Minute => units.checked_mul(SECS_PER_MINUTE),
            Self::Hour => units.checked_mul(SECS_PER_HOUR),
            Self::Day => units.checked_mul(SECS_PER_DAY),
            Self::Month => {
                let year = 1970 + units.div_euclid(12);
                let month = units.rem_euclid(12) + 1;
                return local_midnight(year, month, offset);
            }
            Self::Year => return local_midnight(1970 + units, 1, offset),
        };
        let secs = match self {
            Self::Second => secs,
            _ => secs.and_then(|s| s.checked_sub(offset_secs)),
        };
        secs.and_then(|s| DateTime::from_timestamp(s, 0))
            .ok_or_else(|| Error::invalid_argument(format!("{self} bucket {units} out of range")))
    }

    /// Truncate `time` to the start of its bucket
    pub fn truncate(self, time: Timestamp, offset: FixedOffset) -> Result<Timestamp> {
        self.from_units(self.to_units(time, offset), offset)
    }

    /// Offset of `time` inside its bucket, counted in units of the next
    /// finer resolution (second-of-minute, minute-of-hour, ...).
    #[must_use]
    pub fn sub_bucket_offset(self, time: Timestamp, offset: FixedOffset) -> u32 {
        let local_secs = time.timestamp() + i64::from(offset.local_minus_utc());
        let local = time.with_timezone(&offset);
        // rem_euclid results are bounded by the divisor, so the casts are lossless
        match self {
            Self::Second => 0,
            Self::Minute => local_secs.rem_euclid(SECS_PER_MINUTE) as u32,
            Self::Hour => (local_secs.rem_euclid(SECS_PER_HOUR) / SECS_PER_MINUTE) as u32,
            Self::Day => (local_secs.rem_euclid(SECS_PER_DAY) / SECS_PER_HOUR) as u32,
            Self::Month => local.day0(),
            Self::Year => local.month0(),
        }
    }
}

fn local_midnight(year: i64, month: i64, offset: FixedOffset) -> Result<Timestamp> {
    let out_of_range = || Error::invalid_argument(format!("year {year} out of range"));
    let year = i32::try_from(year).map_err(|_| out_of_range())?;
    let month = u32::try_from(month).map_err(|_| out_of_range())?;
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|dt| dt.and_local_timezone(offset).single())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(out_of_range)
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
        };
        f.write_str(name)
    }
}

/// Aggregate fields, in their fixed on-disk order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Latest,
    Min,
    Max,
    Count,
    Sum,
}

impl MetricField {
    /// Declared encoding order
    pub const ALL: [Self; 5] = [Self::Latest, Self::Min, Self::Max, Self::Count, Self::Sum];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::Sum => "sum",
        }
    }
}

/// Hash function used to content-address de-duplicated values
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// xxHash64
    #[default]
    Xx64,
    /// xxHash64 folded to 32 bits
    Xx32,
    /// 31-multiplier polynomial over the bytes. Cheap, and collisions are
    /// trivial to construct ("Aa" and "BB" share a hash).
    Poly31,
}

/// How dimension keys are laid out inside row keys
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum KeyStorage {
    /// Key bytes are written into the row key
    Inline,
    /// Key bytes are de-duplicated into the key store and referenced by a
    /// fixed-width [`ValueStoreKey`]
    Lookup,
    /// Inline up to `threshold` bytes, lookup above it
    Auto { threshold: usize },
}

impl Default for KeyStorage {
    fn default() -> Self {
        Self::Auto { threshold: 32 }
    }
}

/// Which time decides whether a row has aged out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionBasis {
    /// The bucket start (metrics) or effective time (state)
    #[default]
    StateTime,
    /// When the row was last written
    InsertTime,
}

/// Key of a de-duplicated value: content hash plus a disambiguator that
/// separates distinct values sharing the hash
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[display("{hash:016x}:{id}")]
pub struct ValueStoreKey {
    pub hash: u64,
    pub id: u16,
}

impl ValueStoreKey {
    /// Encoded width: 8 byte hash + 2 byte id
    pub const ENCODED_LEN: usize = 10;

    #[must_use]
    pub const fn new(hash: u64, id: u16) -> Self {
        Self { hash, id }
    }

    /// Big-endian encoding, ordered by hash then id
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.hash.to_be_bytes());
        out[8..].copy_from_slice(&self.id.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(Error::corrupt(format!(
                "value store key needs {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&bytes[..8]);
        let id = u16::from_be_bytes([bytes[8], bytes[9]]);
        Ok(Self::new(u64::from_be_bytes(hash), id))
    }
}

/// Type tag carried by every stored value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    Bytes = 0,
    String = 1,
    Integer = 2,
    Float = 3,
    Boolean = 4,
}

impl ValueType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Bytes),
            1 => Ok(Self::String),
            2 => Ok(Self::Integer),
            3 => Ok(Self::Float),
            4 => Ok(Self::Boolean),
            other => Err(Error::corrupt(format!("unknown value type tag {other}"))),
        }
    }
}

/// A de-duplicated payload: type tag plus bytes
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredValue {
    pub value_type: ValueType,
    pub bytes: Vec<u8>,
}

impl StoredValue {
    #[must_use]
    pub fn new(value_type: ValueType, bytes: Vec<u8>) -> Self {
        Self { value_type, bytes }
    }

    #[must_use]
    pub fn string(s: &str) -> Self {
        Self::new(ValueType::String, s.as_bytes().to_vec())
    }

    #[must_use]
    pub fn integer(v: i64) -> Self {
        Self::new(ValueType::Integer, v.to_be_bytes().to_vec())
    }

    #[must_use]
    pub fn float(v: f64) -> Self {
        Self::new(ValueType::Float, v.to_be_bytes().to_vec())
    }

    #[must_use]
    pub fn boolean(v: bool) -> Self {
        Self::new(ValueType::Boolean, vec![u8::from(v)])
    }

    #[must_use]
    pub fn bytes(bytes: &[u8]) -> Self {
        Self::new(ValueType::Bytes, bytes.to_vec())
    }

    /// Encoded form: tag byte followed by the payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.bytes.len());
        out.push(self.value_type as u8);
        out.extend_from_slice(&self.bytes);
        out
    }

    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let (&tag, rest) = encoded
            .split_first()
            .ok_or_else(|| Error::corrupt("empty stored value"))?;
        Ok(Self::new(ValueType::from_tag(tag)?, rest.to_vec()))
    }

    /// Human readable rendering for tooling
    #[must_use]
    pub fn render(&self) -> String {
        match self.value_type {
            ValueType::String => String::from_utf8_lossy(&self.bytes).into_owned(),
            ValueType::Integer => <[u8; 8]>::try_from(self.bytes.as_slice())
                .map(|b| i64::from_be_bytes(b).to_string())
                .unwrap_or_else(|_| "<bad integer>".to_string()),
            ValueType::Float => <[u8; 8]>::try_from(self.bytes.as_slice())
                .map(|b| f64::from_be_bytes(b).to_string())
                .unwrap_or_else(|_| "<bad float>".to_string()),
            ValueType::Boolean => (self.bytes.first() == Some(&1)).to_string(),
            ValueType::Bytes => self.bytes.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }
}

/// Aggregate record for one (dimension key, bucket).
///
/// Disabled fields are `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub latest: Option<u64>,
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub count: Option<u64>,
    pub sum: Option<u64>,
}

impl Metric {
    #[must_use]
    pub const fn get(&self, field: MetricField) -> Option<u64> {
        match field {
            MetricField::Latest => self.latest,
            MetricField::Min => self.min,
            MetricField::Max => self.max,
            MetricField::Count => self.count,
            MetricField::Sum => self.sum,
        }
    }

    pub fn set(&mut self, field: MetricField, value: Option<u64>) {
        match field {
            MetricField::Latest => self.latest = value,
            MetricField::Min => self.min = value,
            MetricField::Max => self.max = value,
            MetricField::Count => self.count = value,
            MetricField::Sum => self.sum = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_truncate_minute_and_second() {
        let a = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 5).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 55).unwrap();
        assert_eq!(
            Resolution::Minute.truncate(a, utc()).unwrap(),
            Resolution::Minute.truncate(b, utc()).unwrap()
        );
        assert_ne!(
            Resolution::Second.truncate(a, utc()).unwrap(),
            Resolution::Second.truncate(b, utc()).unwrap()
        );
    }

    #[test]
    fn test_truncate_calendar_units() {
        let t = Utc.with_ymd_and_hms(2023, 7, 19, 13, 45, 12).unwrap();
        assert_eq!(
            Resolution::Month.truncate(t, utc()).unwrap(),
            Utc.with_ymd_and_hms(2023, 7, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            Resolution::Year.truncate(t, utc()).unwrap(),
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            Resolution::Day.truncate(t, utc()).unwrap(),
            Utc.with_ymd_and_hms(2023, 7, 19, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_truncate_respects_zone_offset() {
        // 23:30 UTC is already the next day at +02:00
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 23, 30, 0).unwrap();
        let bucket = Resolution::Day.truncate(t, plus_two).unwrap();
        assert_eq!(bucket, Utc.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).unwrap());
    }

    #[test]
    fn test_units_before_epoch() {
        let t = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(Resolution::Day.to_units(t, utc()), -1);
        assert_eq!(Resolution::Month.to_units(t, utc()), -1);
        assert_eq!(
            Resolution::Month.from_units(-1, utc()).unwrap(),
            Utc.with_ymd_and_hms(1969, 12, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_sub_bucket_offset() {
        let t = Utc.with_ymd_and_hms(2024, 5, 17, 14, 25, 42).unwrap();
        assert_eq!(Resolution::Second.sub_bucket_offset(t, utc()), 0);
        assert_eq!(Resolution::Minute.sub_bucket_offset(t, utc()), 42);
        assert_eq!(Resolution::Hour.sub_bucket_offset(t, utc()), 25);
        assert_eq!(Resolution::Day.sub_bucket_offset(t, utc()), 14);
        assert_eq!(Resolution::Month.sub_bucket_offset(t, utc()), 16);
        assert_eq!(Resolution::Year.sub_bucket_offset(t, utc()), 4);
    }

    #[test]
    fn test_value_store_key_bytes() {
        let key = ValueStoreKey::new(0x0102_0304_0506_0708, 513);
        let bytes = key.to_bytes();
        assert_eq!(ValueStoreKey::from_bytes(&bytes).unwrap(), key);
        assert!(ValueStoreKey::from_bytes(&bytes[..9]).is_err());
        assert_eq!(key.to_string(), "0102030405060708:513");
    }

    #[test]
    fn test_stored_value_tag() {
        let value = StoredValue::integer(-42);
        let encoded = value.encode();
        assert_eq!(encoded[0], ValueType::Integer as u8);
        assert_eq!(StoredValue::decode(&encoded).unwrap().render(), "-42");
        assert!(StoredValue::decode(&[9, 1, 2]).is_err());
        assert!(StoredValue::decode(&[]).is_err());
    }
}
