//! Binary layouts for row keys and aggregate records
//!
//! Row keys sort by time first: bucket units are written sign-flipped and
//! big-endian so byte order matches chronological order, including buckets
//! before the epoch.

use bytes::{Buf, BufMut};
use chrono::FixedOffset;
use tallystore_common::config::{KeySchema, MetricSchema};
use tallystore_common::{
    Error, KeyStorage, Metric, MetricField, Resolution, Result, Timestamp, ValueStoreKey,
};

const INLINE_TAG: u8 = 0x00;
const LOOKUP_TAG: u8 = 0x01;

/// Encodes points in time as order-preserving bucket units
#[derive(Clone, Copy, Debug)]
pub struct BucketCodec {
    resolution: Resolution,
    offset: FixedOffset,
    width: usize,
}

impl BucketCodec {
    /// Codec using the resolution's natural key width
    pub fn new(schema: &KeySchema) -> Result<Self> {
        Ok(Self {
            resolution: schema.resolution,
            offset: schema.zone_offset()?,
            width: schema.resolution.key_width(),
        })
    }

    /// Codec that always writes 8 byte units
    pub fn wide(schema: &KeySchema) -> Result<Self> {
        Ok(Self {
            width: 8,
            ..Self::new(schema)?
        })
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Start of the bucket containing `time`
    pub fn truncate(&self, time: Timestamp) -> Result<Timestamp> {
        self.resolution.truncate(time, self.offset)
    }

    #[must_use]
    pub fn sub_bucket_offset(&self, time: Timestamp) -> u32 {
        self.resolution.sub_bucket_offset(time, self.offset)
    }

    pub fn encode(&self, time: Timestamp, out: &mut impl BufMut) -> Result<()> {
        let units = self.resolution.to_units(time, self.offset);
        if self.width == 8 {
            out.put_u64((units as u64) ^ (1 << 63));
        } else {
            let units = i32::try_from(units).map_err(|_| {
                Error::invalid_argument(format!("{time} outside the {} range", self.resolution))
            })?;
            out.put_u32((units as u32) ^ (1 << 31));
        }
        Ok(())
    }

    /// Decode the bucket at the front of `bytes`, returning its start
    pub fn decode(&self, mut bytes: &[u8]) -> Result<Timestamp> {
        if bytes.len() < self.width {
            return Err(Error::corrupt(format!(
                "bucket needs {} bytes, got {}",
                self.width,
                bytes.len()
            )));
        }
        let units = if self.width == 8 {
            (bytes.get_u64() ^ (1 << 63)) as i64
        } else {
            i64::from((bytes.get_u32() ^ (1 << 31)) as i32)
        };
        self.resolution.from_units(units, self.offset)
    }
}

/// A dimension key as it appears in a row key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DimensionRef<'a> {
    Inline(&'a [u8]),
    Lookup(ValueStoreKey),
}

/// Whether a key of `len` bytes goes through the key store
#[must_use]
pub const fn uses_lookup(storage: KeyStorage, len: usize) -> bool {
    match storage {
        KeyStorage::Inline => false,
        KeyStorage::Lookup => true,
        KeyStorage::Auto { threshold } => len > threshold,
    }
}

/// Encoded length of `dim`
#[must_use]
pub const fn dimension_len(dim: &DimensionRef<'_>, prefixed: bool) -> usize {
    match dim {
        DimensionRef::Inline(bytes) if prefixed => 3 + bytes.len(),
        DimensionRef::Inline(bytes) => 1 + bytes.len(),
        DimensionRef::Lookup(_) => 1 + ValueStoreKey::ENCODED_LEN,
    }
}

/// Write `dim`. Prefixed inline keys carry a u16 length so that more
/// fields can follow them.
pub fn encode_dimension(
    dim: &DimensionRef<'_>,
    prefixed: bool,
    out: &mut impl BufMut,
) -> Result<()> {
    match dim {
        DimensionRef::Inline(bytes) => {
            out.put_u8(INLINE_TAG);
            if prefixed {
                let len = u16::try_from(bytes.len()).map_err(|_| Error::KeyTooLong {
                    len: bytes.len(),
                    max: usize::from(u16::MAX),
                })?;
                out.put_u16(len);
            }
            out.put_slice(bytes);
        }
        DimensionRef::Lookup(key) => {
            out.put_u8(LOOKUP_TAG);
            out.put_slice(&key.to_bytes());
        }
    }
    Ok(())
}

/// Decode a dimension key at the front of `bytes`. Unprefixed keys must
/// fill the whole slice. Returns the key and the bytes consumed.
pub fn decode_dimension(bytes: &[u8], prefixed: bool) -> Result<(DimensionRef<'_>, usize)> {
    let (&tag, rest) = bytes
        .split_first()
        .ok_or_else(|| Error::corrupt("empty dimension key"))?;
    match tag {
        INLINE_TAG if prefixed => {
            if rest.len() < 2 {
                return Err(Error::corrupt("truncated dimension key length"));
            }
            let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
            let body = rest
                .get(2..2 + len)
                .ok_or_else(|| Error::corrupt("truncated dimension key"))?;
            Ok((DimensionRef::Inline(body), 3 + len))
        }
        INLINE_TAG => Ok((DimensionRef::Inline(rest), bytes.len())),
        LOOKUP_TAG => {
            if !prefixed && rest.len() != ValueStoreKey::ENCODED_LEN {
                return Err(Error::corrupt(format!(
                    "lookup dimension key is {} bytes, expected {}",
                    rest.len(),
                    ValueStoreKey::ENCODED_LEN
                )));
            }
            let key = ValueStoreKey::from_bytes(rest)?;
            Ok((DimensionRef::Lookup(key), 1 + ValueStoreKey::ENCODED_LEN))
        }
        other => Err(Error::corrupt(format!("unknown dimension key tag {other:#04x}"))),
    }
}

/// Position of one enabled field in an encoded record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSlot {
    pub field: MetricField,
    pub offset: usize,
    pub width: usize,
}

impl FieldSlot {
    /// Largest value the slot can hold
    #[must_use]
    pub const fn max_value(&self) -> u64 {
        if self.width >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.width * 8)) - 1
        }
    }

    /// Read this field from a record already checked against the layout
    #[must_use]
    pub fn read(&self, record: &[u8]) -> u64 {
        record[self.offset..self.offset + self.width]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }

    fn write(&self, value: u64, out: &mut impl BufMut) {
        let clamped = value.min(self.max_value());
        out.put_slice(&clamped.to_be_bytes()[8 - self.width..]);
    }
}

/// Byte layout of an aggregate record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLayout {
    slots: Vec<FieldSlot>,
    fields_len: usize,
    insert_time: bool,
}

impl MetricLayout {
    #[must_use]
    pub fn new(schema: &MetricSchema, insert_time: bool) -> Self {
        let mut offset = 0;
        let slots = schema
            .ordered()
            .into_iter()
            .map(|spec| {
                let slot = FieldSlot {
                    field: spec.field,
                    offset,
                    width: usize::from(spec.width),
                };
                offset += slot.width;
                slot
            })
            .collect();
        Self {
            slots,
            fields_len: offset,
            insert_time,
        }
    }

    /// Total record length, including the trailing insert time if tracked
    #[must_use]
    pub const fn len(&self) -> usize {
        if self.insert_time {
            self.fields_len + 8
        } else {
            self.fields_len
        }
    }

    #[must_use]
    pub const fn tracks_insert_time(&self) -> bool {
        self.insert_time
    }

    #[must_use]
    pub fn slot(&self, field: MetricField) -> Option<FieldSlot> {
        self.slots.iter().copied().find(|s| s.field == field)
    }

    #[must_use]
    pub fn slots(&self) -> &[FieldSlot] {
        &self.slots
    }

    pub fn check(&self, record: &[u8]) -> Result<()> {
        if record.len() == self.len() {
            Ok(())
        } else {
            Err(Error::corrupt(format!(
                "record is {} bytes, layout needs {}",
                record.len(),
                self.len()
            )))
        }
    }

    /// Write `metric`. Disabled fields are skipped and values above a
    /// field's width are clamped.
    pub fn encode(&self, metric: &Metric, insert_time_ms: Option<i64>, out: &mut impl BufMut) {
        for slot in &self.slots {
            slot.write(metric.get(slot.field).unwrap_or(0), out);
        }
        if self.insert_time {
            out.put_i64(insert_time_ms.unwrap_or(0));
        }
    }

    pub fn decode(&self, record: &[u8]) -> Result<Metric> {
        self.check(record)?;
        let mut metric = Metric::default();
        for slot in &self.slots {
            metric.set(slot.field, Some(slot.read(record)));
        }
        Ok(metric)
    }

    /// Read one field without decoding the rest
    pub fn extract(&self, record: &[u8], field: MetricField) -> Result<Option<u64>> {
        self.check(record)?;
        Ok(self.slot(field).map(|slot| slot.read(record)))
    }

    /// Trailing insert time in epoch millis, if tracked
    pub fn insert_time(&self, record: &[u8]) -> Result<Option<i64>> {
        self.check(record)?;
        if !self.insert_time {
            return Ok(None);
        }
        let mut tail = &record[self.fields_len..];
        Ok(Some(tail.get_i64()))
    }

    /// Record for the first observation of a key
    #[must_use]
    pub fn seed(&self, value: u64) -> Metric {
        let mut metric = Metric::default();
        for slot in &self.slots {
            let initial = if slot.field == MetricField::Count { 1 } else { value };
            metric.set(slot.field, Some(initial.min(slot.max_value())));
        }
        metric
    }

    /// Fold one more observation into `metric`
    #[must_use]
    pub fn fold(&self, metric: Metric, value: u64) -> Metric {
        let mut next = metric;
        for slot in &self.slots {
            let current = metric.get(slot.field).unwrap_or(0);
            let folded = match slot.field {
                MetricField::Latest => value,
                MetricField::Min => current.min(value),
                MetricField::Max => current.max(value),
                MetricField::Count => current.saturating_add(1),
                MetricField::Sum => current.saturating_add(value),
            };
            next.set(slot.field, Some(folded.min(slot.max_value())));
        }
        next
    }

    /// Combine two records for the same key and bucket. `incoming_latest`
    /// picks which side's `latest` survives.
    #[must_use]
    pub fn combine(&self, existing: Metric, incoming: Metric, incoming_latest: bool) -> Metric {
        let mut next = existing;
        for slot in &self.slots {
            let a = existing.get(slot.field).unwrap_or(0);
            let b = incoming.get(slot.field).unwrap_or(0);
            let combined = match slot.field {
                MetricField::Latest if incoming_latest => b,
                MetricField::Latest => a,
                MetricField::Min => a.min(b),
                MetricField::Max => a.max(b),
                MetricField::Count | MetricField::Sum => a.saturating_add(b),
            };
            next.set(slot.field, Some(combined.min(slot.max_value())));
        }
        next
    }
}
