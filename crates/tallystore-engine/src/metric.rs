//! Temporal aggregation store
//!
//! Rows are keyed by `(bucket, dimension key)` and hold one aggregate record
//! per key and bucket. Each insert folds an observation into that record:
//! `latest` is overwritten, `min`/`max` compared, `count`/`sum` accumulated.

use crate::codec::{
    BucketCodec, DimensionRef, FieldSlot, MetricLayout, decode_dimension, encode_dimension,
    uses_lookup,
};
use crate::pool::BufferPool;
use crate::retention::{self, RetentionPlan};
use crate::schema::StoreKind;
use crate::search::{Criteria, FieldValue, SearchSummary};
use crate::store::{SourceStore, StoreEnv, StoreInfo};
use crate::tables;
use crate::value_store::ValueStore;
use crate::writer::{ShutdownSignal, Writer};
use chrono::{DateTime, Utc};
use redb::{ReadOnlyTable, ReadableTable, Table, WriteTransaction};
use std::ops::ControlFlow;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tallystore_common::{
    ContentHasher, Error, Metric, MetricField, Result, RetentionBasis, StoreSettings, Timestamp,
    ValueStoreKey,
};
use tracing::{debug, info, warn};

/// Fields a metric search can filter on or project
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricQueryField {
    Key,
    Bucket,
    Latest,
    Min,
    Max,
    Count,
    Sum,
    /// `sum / count`, integer division
    Average,
}

impl FromStr for MetricQueryField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "key" => Ok(Self::Key),
            "bucket" | "time" => Ok(Self::Bucket),
            "latest" => Ok(Self::Latest),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "avg" | "average" => Ok(Self::Average),
            other => Err(Error::invalid_argument(format!("unknown metric field '{other}'"))),
        }
    }
}

/// Field extractor resolved against the store layout once per query
#[derive(Clone, Copy, Debug)]
enum Extractor {
    Key,
    Bucket,
    Field(FieldSlot),
    Average { sum: FieldSlot, count: FieldSlot },
}

/// One search match. `values` line up with the requested fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricRow {
    pub values: Vec<FieldValue>,
}

/// Aggregating store for time-bucketed metrics
pub struct MetricStore {
    env: StoreEnv,
    buckets: BucketCodec,
    layout: MetricLayout,
    keys: ValueStore,
}

impl MetricStore {
    pub fn create(
        path: impl AsRef<Path>,
        settings: &StoreSettings,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        Self::from_env(StoreEnv::create(path, settings, StoreKind::Metric, pool)?)
    }

    pub fn open(
        path: impl AsRef<Path>,
        settings: &StoreSettings,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        Self::from_env(StoreEnv::open(path, settings, StoreKind::Metric, pool)?)
    }

    fn from_env(env: StoreEnv) -> Result<Self> {
        let settings = env.settings();
        Ok(Self {
            buckets: BucketCodec::new(&settings.key_schema)?,
            layout: MetricLayout::new(&settings.metric_schema, settings.tracks_insert_time()),
            keys: ValueStore::new(
                tables::KEYS,
                ContentHasher::new(settings.key_schema.hash_algorithm),
            ),
            env,
        })
    }

    #[must_use]
    pub const fn env(&self) -> &StoreEnv {
        &self.env
    }

    #[must_use]
    pub const fn layout(&self) -> &MetricLayout {
        &self.layout
    }

    #[must_use]
    pub const fn shutdown_signal(&self) -> &ShutdownSignal {
        self.env.shutdown_signal()
    }

    /// Exclusive writer for this store
    pub fn writer(&self) -> Writer<'_> {
        self.env.writer()
    }

    fn pool(&self) -> &BufferPool {
        self.env.pool()
    }

    /// Fold `value` into the record for `key` at `time`
    pub fn insert(
        &self,
        writer: &mut Writer<'_>,
        key: &[u8],
        time: Timestamp,
        value: u64,
    ) -> Result<()> {
        self.insert_at(writer, key, time, value, Utc::now())
    }

    /// Like [`insert`](Self::insert) with an explicit insert time
    pub fn insert_at(
        &self,
        writer: &mut Writer<'_>,
        key: &[u8],
        time: Timestamp,
        value: u64,
        inserted: Timestamp,
    ) -> Result<()> {
        self.env.check_writer(writer)?;
        writer.mutate(|txn| {
            // One buffer holds the row key followed by the record
            let mut buf = self.pool().acquire(self.row_capacity(key.len()))?;
            self.write_row_key(txn, key, time, &mut buf)?;
            let split = buf.len();

            let mut rows = txn.open_table(tables::ROWS)?;
            let existing = rows
                .get(&buf[..split])?
                .map(|v| self.layout.decode(v.value()))
                .transpose()?;
            let metric = match existing {
                Some(metric) => self.layout.fold(metric, value),
                None => self.layout.seed(value),
            };

            self.layout
                .encode(&metric, Some(inserted.timestamp_millis()), &mut *buf);
            rows.insert(&buf[..split], &buf[split..])?;
            Ok(())
        })
    }

    fn row_key_capacity(&self, key_len: usize) -> usize {
        self.buckets.width() + (1 + key_len).max(1 + ValueStoreKey::ENCODED_LEN)
    }

    /// Room for a row key and its record in a single pooled buffer. An
    /// operation never holds two buffers at once, so a class with one
    /// buffer cannot block on itself.
    fn row_capacity(&self, key_len: usize) -> usize {
        self.row_key_capacity(key_len) + self.layout.len()
    }

    /// Row key for writing: lookup keys are created on demand
    fn write_row_key(
        &self,
        txn: &WriteTransaction,
        key: &[u8],
        time: Timestamp,
        out: &mut bytes::BytesMut,
    ) -> Result<()> {
        self.buckets.encode(time, out)?;
        let storage = self.env.settings().key_schema.key_storage;
        if uses_lookup(storage, key.len()) {
            let lookup = self.keys.get_or_create_key(txn, key)?;
            encode_dimension(&DimensionRef::Lookup(lookup), false, out)
        } else {
            encode_dimension(&DimensionRef::Inline(key), false, out)
        }
    }

    /// Row key for reading, or `None` when a lookup key was never stored
    fn read_row_key(
        &self,
        keys: &ReadOnlyTable<(u64, u16), &'static [u8]>,
        key: &[u8],
        time: Timestamp,
        out: &mut bytes::BytesMut,
    ) -> Result<Option<()>> {
        self.buckets.encode(time, out)?;
        let storage = self.env.settings().key_schema.key_storage;
        let dim = if uses_lookup(storage, key.len()) {
            match self.keys.find_key_in(keys, key)? {
                Some(lookup) => DimensionRef::Lookup(lookup),
                None => return Ok(None),
            }
        } else {
            DimensionRef::Inline(key)
        };
        encode_dimension(&dim, false, out)?;
        Ok(Some(()))
    }

    /// Aggregate for `key` in the bucket containing `time`
    pub fn get(&self, key: &[u8], time: Timestamp) -> Result<Option<Metric>> {
        let txn = self.env.begin_read()?;
        let keys = txn.open_table(tables::KEYS)?;
        let mut row_key = self.pool().acquire(self.row_key_capacity(key.len()))?;
        if self.read_row_key(&keys, key, time, &mut row_key)?.is_none() {
            return Ok(None);
        }
        let rows = txn.open_table(tables::ROWS)?;
        let record = rows.get(&row_key[..])?;
        record.map(|v| self.layout.decode(v.value())).transpose()
    }

    /// Insert time of the record for `key` at `time`, if tracked
    pub fn inserted_at(&self, key: &[u8], time: Timestamp) -> Result<Option<Timestamp>> {
        let txn = self.env.begin_read()?;
        let keys = txn.open_table(tables::KEYS)?;
        let mut row_key = self.pool().acquire(self.row_key_capacity(key.len()))?;
        if self.read_row_key(&keys, key, time, &mut row_key)?.is_none() {
            return Ok(None);
        }
        let rows = txn.open_table(tables::ROWS)?;
        let Some(record) = rows.get(&row_key[..])? else {
            return Ok(None);
        };
        self.layout
            .insert_time(record.value())?
            .map(millis_to_time)
            .transpose()
    }

    fn extractor(&self, field: MetricQueryField) -> Result<Extractor> {
        let slot = |f: MetricField| {
            self.layout.slot(f).ok_or_else(|| {
                Error::invalid_argument(format!("field {} is not stored", f.name()))
            })
        };
        Ok(match field {
            MetricQueryField::Key => Extractor::Key,
            MetricQueryField::Bucket => Extractor::Bucket,
            MetricQueryField::Latest => Extractor::Field(slot(MetricField::Latest)?),
            MetricQueryField::Min => Extractor::Field(slot(MetricField::Min)?),
            MetricQueryField::Max => Extractor::Field(slot(MetricField::Max)?),
            MetricQueryField::Count => Extractor::Field(slot(MetricField::Count)?),
            MetricQueryField::Sum => Extractor::Field(slot(MetricField::Sum)?),
            MetricQueryField::Average => Extractor::Average {
                sum: slot(MetricField::Sum)?,
                count: slot(MetricField::Count)?,
            },
        })
    }

    /// Scan every row, pushing those matching `criteria` to `consumer` with
    /// the requested `fields`. Corrupt rows are skipped and counted.
    pub fn search(
        &self,
        criteria: &Criteria<MetricQueryField>,
        fields: &[MetricQueryField],
        mut consumer: impl FnMut(MetricRow) -> ControlFlow<()>,
    ) -> Result<SearchSummary> {
        let predicate = criteria.resolve(&|f| self.extractor(f))?;
        let projection: Vec<Extractor> = fields
            .iter()
            .map(|&f| self.extractor(f))
            .collect::<Result<_>>()?;

        let txn = self.env.begin_read()?;
        let rows = txn.open_table(tables::ROWS)?;
        let keys = txn.open_table(tables::KEYS)?;
        let mut summary = SearchSummary::default();

        for entry in rows.iter()? {
            let (row_key, record) = entry?;
            summary.scanned += 1;
            let mut row = RowView::new(self, &keys, row_key.value(), record.value());

            let outcome = row.check().and_then(|()| {
                if !predicate.evaluate(&mut |ex: &Extractor| row.extract(ex))? {
                    return Ok(None);
                }
                projection
                    .iter()
                    .map(|ex| row.extract(ex))
                    .collect::<Result<Vec<_>>>()
                    .map(Some)
            });
            match outcome {
                Ok(Some(values)) => {
                    summary.matched += 1;
                    if consumer(MetricRow { values }).is_break() {
                        summary.stopped_early = true;
                        break;
                    }
                }
                Ok(None) => {}
                Err(Error::CorruptRecord(reason)) => {
                    warn!("Skipping corrupt row in {}: {}", self.env.path().display(), reason);
                    summary.skipped_corrupt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    /// Fold every row of the store at `source` into this one.
    ///
    /// The source must share this store's schema; a mismatch fails before
    /// anything is written. Mutations already pending on `writer` are
    /// committed first, then the merge runs in one transaction, so it either
    /// lands completely or not at all. Returns the number of source rows.
    pub fn merge(&self, writer: &mut Writer<'_>, source: impl AsRef<Path>) -> Result<u64> {
        self.env.check_writer(writer)?;
        let source = SourceStore::open(source)?;
        self.env.schema().ensure_matches(source.schema())?;

        writer.commit()?;
        let merged = writer.mutate(|txn| self.merge_rows(txn, &source))?;
        writer.commit()?;
        info!(
            "Merged {} rows from {} into {}",
            merged,
            source.path().display(),
            self.env.path().display()
        );
        Ok(merged)
    }

    /// [`merge`](Self::merge), then delete the source directory
    pub fn merge_and_remove(
        &self,
        writer: &mut Writer<'_>,
        source: impl AsRef<Path>,
    ) -> Result<u64> {
        let source = source.as_ref();
        let merged = self.merge(writer, source)?;
        std::fs::remove_dir_all(source)?;
        debug!("Removed merged store {}", source.display());
        Ok(merged)
    }

    fn merge_rows(&self, txn: &WriteTransaction, source: &SourceStore) -> Result<u64> {
        let signal = self.shutdown_signal();
        let src_txn = source.begin_read()?;
        let src_rows = src_txn.open_table(tables::ROWS)?;
        let src_keys = src_txn.open_table(tables::KEYS)?;
        let mut dst_rows = txn.open_table(tables::ROWS)?;
        let mut dst_keys = txn.open_table(tables::KEYS)?;
        let width = self.buckets.width();
        let mut merged = 0;

        for entry in src_rows.iter()? {
            signal.check()?;
            let (src_key, src_record) = entry?;
            let src_key = src_key.value();
            let src_record = src_record.value();
            if src_key.len() < width {
                return Err(Error::corrupt("row key shorter than its bucket"));
            }
            let incoming = self.layout.decode(src_record)?;
            let incoming_time = self.layout.insert_time(src_record)?;

            let dim_bytes = self.resolve_dimension(&src_keys, &src_key[width..])?;
            let mut buf = self.pool().acquire(self.row_capacity(dim_bytes.len()))?;
            buf.extend_from_slice(&src_key[..width]);
            self.encode_dimension_into(&mut dst_keys, &dim_bytes, &mut buf)?;
            let split = buf.len();

            let existing = match dst_rows.get(&buf[..split])? {
                Some(v) => Some((
                    self.layout.decode(v.value())?,
                    self.layout.insert_time(v.value())?,
                )),
                None => None,
            };
            let (metric, inserted) = match existing {
                None => (incoming, incoming_time),
                Some((current, current_time)) => {
                    let incoming_latest = match (current_time, incoming_time) {
                        (Some(current), Some(incoming)) => incoming >= current,
                        _ => true,
                    };
                    (
                        self.layout.combine(current, incoming, incoming_latest),
                        current_time.max(incoming_time),
                    )
                }
            };

            self.layout.encode(&metric, inserted, &mut *buf);
            dst_rows.insert(&buf[..split], &buf[split..])?;
            merged += 1;
        }
        Ok(merged)
    }

    /// Raw dimension key bytes for an encoded dimension
    fn resolve_dimension<T>(&self, keys: &T, encoded: &[u8]) -> Result<Vec<u8>>
    where
        T: ReadableTable<(u64, u16), &'static [u8]>,
    {
        match decode_dimension(encoded, false)?.0 {
            DimensionRef::Inline(bytes) => Ok(bytes.to_vec()),
            DimensionRef::Lookup(lookup) => self
                .keys
                .get_in(keys, lookup)?
                .ok_or_else(|| Error::corrupt(format!("dangling key reference {lookup}"))),
        }
    }

    fn encode_dimension_into(
        &self,
        keys: &mut Table<'_, (u64, u16), &'static [u8]>,
        key: &[u8],
        out: &mut bytes::BytesMut,
    ) -> Result<()> {
        let storage = self.env.settings().key_schema.key_storage;
        if uses_lookup(storage, key.len()) {
            let lookup = self.keys.get_or_create_in(keys, key)?;
            encode_dimension(&DimensionRef::Lookup(lookup), false, out)
        } else {
            encode_dimension(&DimensionRef::Inline(key), false, out)
        }
    }

    /// Delete records older than `cutoff` and sweep dimension keys no kept
    /// record references. Returns the number of records deleted.
    ///
    /// Pending mutations on `writer` are committed before the scan so the
    /// sweep sees every reference. Holding the writer for the whole run keeps
    /// other inserts out between the scan and the sweep. Re-running with the
    /// same cutoff deletes nothing more.
    pub fn delete_old_data(&self, writer: &mut Writer<'_>, cutoff: Timestamp) -> Result<u64> {
        self.env.check_writer(writer)?;
        writer.commit()?;
        let plan = self.plan_retention(cutoff)?;
        let deleted = retention::delete_rows(writer, &plan.expired)?;
        let swept = retention::sweep_unreferenced(writer, &self.keys, &plan.used_keys)?;
        writer.commit()?;
        info!(
            "Retention before {} removed {} rows and {} keys from {}",
            cutoff,
            deleted,
            swept,
            self.env.path().display()
        );
        Ok(deleted)
    }

    fn plan_retention(&self, cutoff: Timestamp) -> Result<RetentionPlan> {
        let basis = self.env.settings().retention;
        let signal = self.shutdown_signal();
        let width = self.buckets.width();
        let txn = self.env.begin_read()?;
        let rows = txn.open_table(tables::ROWS)?;
        let mut plan = RetentionPlan::default();

        for entry in rows.iter()? {
            signal.check()?;
            let (row_key, record) = entry?;
            let row_key = row_key.value();
            let record = record.value();
            self.layout.check(record)?;
            let effective = match basis {
                RetentionBasis::StateTime => self.buckets.decode(row_key)?,
                RetentionBasis::InsertTime => self
                    .layout
                    .insert_time(record)?
                    .map(millis_to_time)
                    .transpose()?
                    .ok_or_else(|| Error::corrupt("record carries no insert time"))?,
            };
            if effective < cutoff {
                plan.expired.push(row_key.to_vec());
            } else if let DimensionRef::Lookup(lookup) =
                decode_dimension(row_key.get(width..).unwrap_or_default(), false)?.0
            {
                plan.used_keys.insert(lookup);
            }
        }
        Ok(plan)
    }

    pub fn count(&self) -> Result<u64> {
        self.env.count()
    }

    pub fn info(&self) -> Result<StoreInfo> {
        self.env.info()
    }

    pub fn compact(&mut self) -> Result<bool> {
        self.env.compact()
    }

    /// Close the store. Pending writers must already be dropped.
    pub fn close(self) {
        debug!("Closing metric store {}", self.env.path().display());
    }
}

fn millis_to_time(millis: i64) -> Result<Timestamp> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::corrupt(format!("insert time {millis} out of range")))
}

/// Lazily decoded view of one row
struct RowView<'a> {
    store: &'a MetricStore,
    keys: &'a ReadOnlyTable<(u64, u16), &'static [u8]>,
    row_key: &'a [u8],
    record: &'a [u8],
    key: Option<Vec<u8>>,
}

impl<'a> RowView<'a> {
    const fn new(
        store: &'a MetricStore,
        keys: &'a ReadOnlyTable<(u64, u16), &'static [u8]>,
        row_key: &'a [u8],
        record: &'a [u8],
    ) -> Self {
        Self {
            store,
            keys,
            row_key,
            record,
            key: None,
        }
    }

    fn check(&self) -> Result<()> {
        self.store.layout.check(self.record)?;
        if self.row_key.len() <= self.store.buckets.width() {
            return Err(Error::corrupt("row key shorter than its bucket"));
        }
        Ok(())
    }

    fn extract(&mut self, extractor: &Extractor) -> Result<FieldValue> {
        Ok(match extractor {
            Extractor::Key => {
                if self.key.is_none() {
                    let width = self.store.buckets.width();
                    self.key = Some(
                        self.store
                            .resolve_dimension(self.keys, &self.row_key[width..])?,
                    );
                }
                FieldValue::Bytes(self.key.clone().unwrap_or_default())
            }
            Extractor::Bucket => FieldValue::Time(self.store.buckets.decode(self.row_key)?),
            Extractor::Field(slot) => FieldValue::Int(slot.read(self.record)),
            Extractor::Average { sum, count } => {
                let count = count.read(self.record);
                let sum = sum.read(self.record);
                FieldValue::Int(sum.checked_div(count).unwrap_or(0))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::Comparison;
    use chrono::{Duration, TimeZone};
    use tallystore_common::PoolConfig;
    use tallystore_common::config::MetricSchema;
    use tallystore_common::{KeyStorage, Resolution};
    use tempfile::tempdir;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::default())
    }

    fn settings(resolution: Resolution) -> StoreSettings {
        let mut settings = StoreSettings::default();
        settings.key_schema.resolution = resolution;
        settings
    }

    fn minute_store(path: &Path) -> MetricStore {
        MetricStore::create(path, &settings(Resolution::Minute), pool()).unwrap()
    }

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 5).unwrap()
    }

    fn collect(
        store: &MetricStore,
        criteria: &Criteria<MetricQueryField>,
        fields: &[MetricQueryField],
    ) -> Vec<Vec<FieldValue>> {
        let mut out = Vec::new();
        store
            .search(criteria, fields, |row| {
                out.push(row.values);
                ControlFlow::Continue(())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_fold_observations() {
        let dir = tempdir().unwrap();
        let store = minute_store(dir.path());
        let mut writer = store.writer();
        for v in [5, 1, 9, 3] {
            store.insert(&mut writer, b"k", t0(), v).unwrap();
        }
        writer.close().unwrap();

        let metric = store.get(b"k", t0()).unwrap().unwrap();
        assert_eq!(metric.latest, Some(3));
        assert_eq!(metric.min, Some(1));
        assert_eq!(metric.max, Some(9));
        assert_eq!(metric.count, Some(4));
        assert_eq!(metric.sum, Some(18));
        assert_eq!(store.get(b"other", t0()).unwrap(), None);
    }

    #[test]
    fn test_resolution_groups_buckets() {
        let a = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 5).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 55).unwrap();

        let dir = tempdir().unwrap();
        let minute = minute_store(&dir.path().join("m"));
        let second =
            MetricStore::create(dir.path().join("s"), &settings(Resolution::Second), pool())
                .unwrap();
        for store in [&minute, &second] {
            let mut writer = store.writer();
            store.insert(&mut writer, b"k", a, 1).unwrap();
            store.insert(&mut writer, b"k", b, 2).unwrap();
            writer.close().unwrap();
        }
        assert_eq!(minute.count().unwrap(), 1);
        assert_eq!(minute.get(b"k", a).unwrap().unwrap().count, Some(2));
        assert_eq!(second.count().unwrap(), 2);
        assert_eq!(second.get(b"k", b).unwrap().unwrap().count, Some(1));
    }

    #[test]
    fn test_lookup_keys_are_deduplicated() {
        let dir = tempdir().unwrap();
        let mut s = settings(Resolution::Hour);
        s.key_schema.key_storage = KeyStorage::Auto { threshold: 4 };
        let store = MetricStore::create(dir.path(), &s, pool()).unwrap();
        let long_key = b"a-rather-long-dimension-key";

        let mut writer = store.writer();
        store.insert(&mut writer, long_key, t0(), 1).unwrap();
        store.insert(&mut writer, long_key, t0() + Duration::hours(1), 1).unwrap();
        store.insert(&mut writer, b"abc", t0(), 1).unwrap();
        writer.close().unwrap();

        let info = store.info().unwrap();
        assert_eq!(info.rows, 3);
        assert_eq!(info.keys, 1);
        assert!(store.get(long_key, t0()).unwrap().is_some());

        let keys = collect(&store, &Criteria::All, &[MetricQueryField::Key]);
        assert!(keys.contains(&vec![FieldValue::Bytes(long_key.to_vec())]));
        assert!(keys.contains(&vec![FieldValue::Bytes(b"abc".to_vec())]));
    }

    #[test]
    fn test_search_with_predicate_and_projection() {
        let dir = tempdir().unwrap();
        let store = minute_store(dir.path());
        let mut writer = store.writer();
        let observations = [
            (&b"host-a"[..], vec![1, 2, 3]),
            (&b"host-b"[..], vec![10]),
            (&b"db-1"[..], vec![4, 4]),
        ];
        for (key, values) in observations {
            for v in values {
                store.insert(&mut writer, key, t0(), v).unwrap();
            }
        }
        writer.close().unwrap();

        let criteria = Criteria::condition(
            MetricQueryField::Key,
            Comparison::StartsWith,
            FieldValue::Bytes(b"host".to_vec()),
        )
        .and(Criteria::condition(MetricQueryField::Count, Comparison::Ge, FieldValue::Int(2)));
        let fields = [MetricQueryField::Sum, MetricQueryField::Average];
        let rows = collect(&store, &criteria, &fields);
        assert_eq!(rows, vec![vec![FieldValue::Int(6), FieldValue::Int(2)]]);

        let bucket = collect(&store, &Criteria::All, &[MetricQueryField::Bucket]);
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert!(bucket.iter().all(|r| r == &vec![FieldValue::Time(start)]));
    }

    #[test]
    fn test_search_stops_when_consumer_breaks() {
        let dir = tempdir().unwrap();
        let store = minute_store(dir.path());
        let mut writer = store.writer();
        for key in [b"a", b"b", b"c"] {
            store.insert(&mut writer, key, t0(), 1).unwrap();
        }
        writer.close().unwrap();

        let mut seen = 0;
        let summary = store
            .search(&Criteria::All, &[MetricQueryField::Count], |_| {
                seen += 1;
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(seen, 1);
        assert!(summary.stopped_early);
    }

    #[test]
    fn test_search_rejects_disabled_field() {
        let dir = tempdir().unwrap();
        let mut s = settings(Resolution::Minute);
        s.metric_schema = MetricSchema::uniform(&[MetricField::Count], 4);
        let store = MetricStore::create(dir.path(), &s, pool()).unwrap();
        let result = store.search(&Criteria::All, &[MetricQueryField::Sum], |_| {
            ControlFlow::Continue(())
        });
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_search_skips_corrupt_rows() {
        let dir = tempdir().unwrap();
        let store = minute_store(dir.path());
        let mut writer = store.writer();
        store.insert(&mut writer, b"good", t0(), 7).unwrap();
        writer
            .mutate(|txn| {
                let mut key = Vec::new();
                store.buckets.encode(t0(), &mut key)?;
                key.extend_from_slice(b"\x00bad");
                let mut rows = txn.open_table(tables::ROWS)?;
                rows.insert(key.as_slice(), &b"short"[..])?;
                Ok(())
            })
            .unwrap();
        writer.close().unwrap();

        let mut rows = Vec::new();
        let summary = store
            .search(&Criteria::All, &[MetricQueryField::Key], |row| {
                rows.push(row);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.skipped_corrupt, 1);
        assert_eq!(rows.len(), 1);

        // retention refuses to work around corruption
        let cutoff = t0() + Duration::days(1);
        assert!(matches!(
            store.delete_old_data(&mut store.writer(), cutoff),
            Err(Error::CorruptRecord(_))
        ));
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_retention_by_bucket_time() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let dir = tempdir().unwrap();
        let mut s = settings(Resolution::Minute);
        s.key_schema.key_storage = KeyStorage::Lookup;
        let store = MetricStore::create(dir.path(), &s, pool()).unwrap();

        let mut writer = store.writer();
        store.insert(&mut writer, b"old", now - Duration::days(2), 1).unwrap();
        store.insert(&mut writer, b"new", now - Duration::hours(1), 1).unwrap();
        writer.close().unwrap();
        assert_eq!(store.info().unwrap().keys, 2);

        let cutoff = now - Duration::days(1);
        assert_eq!(store.delete_old_data(&mut store.writer(), cutoff).unwrap(), 1);
        assert!(store.get(b"old", now - Duration::days(2)).unwrap().is_none());
        assert!(store.get(b"new", now - Duration::hours(1)).unwrap().is_some());
        assert_eq!(store.info().unwrap().keys, 1);

        assert_eq!(store.delete_old_data(&mut store.writer(), cutoff).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_retention_keeps_key_shared_with_kept_row() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let dir = tempdir().unwrap();
        let mut s = settings(Resolution::Minute);
        s.key_schema.key_storage = KeyStorage::Lookup;
        let store = MetricStore::create(dir.path(), &s, pool()).unwrap();

        let mut writer = store.writer();
        store.insert(&mut writer, b"shared", now - Duration::days(2), 1).unwrap();
        store.insert(&mut writer, b"shared", now - Duration::hours(1), 2).unwrap();
        store.insert(&mut writer, b"solo", now - Duration::days(2), 3).unwrap();
        writer.close().unwrap();
        assert_eq!(store.info().unwrap().keys, 2);

        let mut writer = store.writer();
        assert_eq!(store.delete_old_data(&mut writer, now - Duration::days(1)).unwrap(), 2);
        writer.close().unwrap();

        let info = store.info().unwrap();
        assert_eq!((info.rows, info.keys), (1, 1));
        let kept = store.get(b"shared", now - Duration::hours(1)).unwrap().unwrap();
        assert_eq!(kept.sum, Some(2));
        let keys = collect(&store, &Criteria::All, &[MetricQueryField::Key]);
        assert_eq!(keys, vec![vec![FieldValue::Bytes(b"shared".to_vec())]]);
    }

    #[test]
    fn test_retention_with_pending_writes_on_same_writer() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let dir = tempdir().unwrap();
        let mut s = settings(Resolution::Minute);
        s.key_schema.key_storage = KeyStorage::Lookup;
        let store = MetricStore::create(dir.path(), &s, pool()).unwrap();

        let mut writer = store.writer();
        store.insert(&mut writer, b"k", now - Duration::days(2), 1).unwrap();
        writer.commit().unwrap();
        // uncommitted row still references key "k"
        store.insert(&mut writer, b"k", now, 1).unwrap();
        assert_eq!(store.delete_old_data(&mut writer, now - Duration::days(1)).unwrap(), 1);
        writer.close().unwrap();

        assert_eq!(store.info().unwrap().keys, 1);
        assert!(store.get(b"k", now).unwrap().is_some());
    }

    #[test]
    fn test_single_buffer_class_does_not_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let counts = std::collections::BTreeMap::from([(100, 1)]);
        let pool = Arc::new(BufferPool::new(&PoolConfig::from_counts(&counts)));
        let thread_pool = Arc::clone(&pool);

        // 50-byte inline key plus a 40-byte record fits the 100 byte class
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = (|| -> Result<Option<Metric>> {
                let mut s = settings(Resolution::Minute);
                s.key_schema.key_storage = KeyStorage::Inline;
                let key = [b'k'; 50];

                let src = MetricStore::create(path.join("b"), &s, Arc::clone(&thread_pool))?;
                let mut writer = src.writer();
                src.insert(&mut writer, &key, t0(), 4)?;
                writer.close()?;
                src.close();

                let store = MetricStore::create(path.join("a"), &s, thread_pool)?;
                let mut writer = store.writer();
                store.insert(&mut writer, &key, t0(), 1)?;
                store.insert(&mut writer, &key, t0(), 2)?;
                store.merge(&mut writer, path.join("b"))?;
                writer.close()?;
                store.get(&key, t0())
            })();
            let _ = tx.send(outcome);
        });

        let outcome = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("insert blocked on the buffer pool");
        assert_eq!(outcome.unwrap().unwrap().count, Some(3));
        let class = pool.stats().into_iter().find(|c| c.capacity == 100).unwrap();
        assert_eq!((class.created, class.on_loan), (1, 0));
    }

    #[test]
    fn test_retention_and_merge_use_callers_writer() {
        let dir = tempdir().unwrap();
        let s = settings(Resolution::Minute);
        let dest = MetricStore::create(dir.path().join("a"), &s, pool()).unwrap();
        drop(MetricStore::create(dir.path().join("b"), &s, pool()).unwrap());

        let mut writer = dest.writer();
        dest.insert(&mut writer, b"k", t0(), 1).unwrap();
        assert_eq!(dest.merge(&mut writer, dir.path().join("b")).unwrap(), 0);
        assert_eq!(dest.delete_old_data(&mut writer, t0() - Duration::days(1)).unwrap(), 0);
        dest.insert(&mut writer, b"k", t0(), 1).unwrap();
        writer.close().unwrap();
        assert_eq!(dest.get(b"k", t0()).unwrap().unwrap().count, Some(2));

        let other = MetricStore::create(dir.path().join("c"), &s, pool()).unwrap();
        let mut foreign = other.writer();
        let err = dest.delete_old_data(&mut foreign, t0()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_retention_by_insert_time() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let dir = tempdir().unwrap();
        let mut s = settings(Resolution::Day);
        s.retention = RetentionBasis::InsertTime;
        let store = MetricStore::create(dir.path(), &s, pool()).unwrap();

        let mut writer = store.writer();
        // old bucket, recently written: kept
        store.insert_at(&mut writer, b"a", now - Duration::days(30), 1, now).unwrap();
        // recent bucket, written long ago: deleted
        store
            .insert_at(&mut writer, b"b", now, 1, now - Duration::days(3))
            .unwrap();
        writer.close().unwrap();

        assert_eq!(store.inserted_at(b"a", now - Duration::days(30)).unwrap(), Some(now));
        let cutoff = now - Duration::days(1);
        assert_eq!(store.delete_old_data(&mut store.writer(), cutoff).unwrap(), 1);
        assert!(store.get(b"a", now - Duration::days(30)).unwrap().is_some());
        assert!(store.get(b"b", now).unwrap().is_none());
    }

    #[test]
    fn test_retention_cancelled() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let dir = tempdir().unwrap();
        let store = minute_store(dir.path());
        let mut writer = store.writer();
        store.insert(&mut writer, b"old", now - Duration::days(2), 1).unwrap();
        writer.close().unwrap();

        store.shutdown_signal().trigger();
        let err = store.delete_old_data(&mut store.writer(), now).unwrap_err();
        assert!(err.is_cancelled());
        store.shutdown_signal().reset();
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.delete_old_data(&mut store.writer(), now).unwrap(), 1);
    }

    #[test]
    fn test_merge_folds_rows() {
        let dir = tempdir().unwrap();
        let s = settings(Resolution::Minute);
        let dest = MetricStore::create(dir.path().join("a"), &s, pool()).unwrap();
        let src = MetricStore::create(dir.path().join("b"), &s, pool()).unwrap();

        let mut writer = dest.writer();
        for v in [4, 6] {
            dest.insert(&mut writer, b"k", t0(), v).unwrap();
        }
        writer.close().unwrap();
        let mut writer = src.writer();
        for v in [2, 3, 4] {
            src.insert(&mut writer, b"k", t0(), v).unwrap();
        }
        src.insert(&mut writer, b"only-src", t0(), 8).unwrap();
        writer.close().unwrap();
        src.close();

        assert_eq!(dest.merge(&mut dest.writer(), dir.path().join("b")).unwrap(), 2);
        let merged = dest.get(b"k", t0()).unwrap().unwrap();
        assert_eq!(merged.count, Some(5));
        assert_eq!(merged.sum, Some(19));
        assert_eq!(merged.min, Some(2));
        assert_eq!(merged.max, Some(6));
        assert_eq!(dest.get(b"only-src", t0()).unwrap().unwrap().sum, Some(8));

        let merged = dest.merge_and_remove(&mut dest.writer(), dir.path().join("b"));
        assert_eq!(merged.unwrap(), 2);
        assert!(!dir.path().join("b").exists());
        assert_eq!(dest.get(b"k", t0()).unwrap().unwrap().count, Some(8));
    }

    #[test]
    fn test_merge_schema_mismatch_mutates_nothing() {
        let dir = tempdir().unwrap();
        let dest = minute_store(&dir.path().join("a"));
        let src =
            MetricStore::create(dir.path().join("b"), &settings(Resolution::Hour), pool()).unwrap();
        let mut writer = src.writer();
        src.insert(&mut writer, b"k", t0(), 1).unwrap();
        writer.close().unwrap();
        src.close();

        let err = dest.merge(&mut dest.writer(), dir.path().join("b")).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
        assert_eq!(dest.count().unwrap(), 0);

        let src =
            MetricStore::open(dir.path().join("b"), &settings(Resolution::Hour), pool()).unwrap();
        assert_eq!(src.count().unwrap(), 1);
    }

    #[test]
    fn test_writer_from_other_store_rejected() {
        let dir = tempdir().unwrap();
        let s = settings(Resolution::Minute);
        let a = MetricStore::create(dir.path().join("a"), &s, pool()).unwrap();
        let b = MetricStore::create(dir.path().join("b"), &s, pool()).unwrap();
        let mut writer = b.writer();
        let err = a.insert(&mut writer, b"k", t0(), 1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
