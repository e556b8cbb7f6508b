//! Temporal state store
//!
//! Holds per-entity state keyed by `(dimension key, effective time)`. Payloads
//! go through the de-duplicating value store, so many entities sharing one
//! state cost a single stored value. A lookup at time `t` returns the latest
//! state that took effect at or before `t`.

use crate::codec::{BucketCodec, DimensionRef, decode_dimension, encode_dimension, uses_lookup};
use crate::pool::BufferPool;
use crate::retention::{self, RetentionPlan};
use crate::schema::StoreKind;
use crate::search::{Criteria, FieldValue, SearchSummary};
use crate::store::{SourceStore, StoreEnv, StoreInfo};
use crate::tables;
use crate::value_store::ValueStore;
use crate::writer::{ShutdownSignal, Writer};
use bytes::{Buf, BufMut};
use chrono::{DateTime, Utc};
use redb::{ReadOnlyTable, ReadableTable, Table, WriteTransaction};
use std::ops::ControlFlow;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tallystore_common::{
    ContentHasher, Error, Result, RetentionBasis, StoreSettings, StoredValue, Timestamp,
    ValueStoreKey,
};
use tracing::{debug, info, warn};

/// Value key plus insert time
const ROW_VALUE_LEN: usize = ValueStoreKey::ENCODED_LEN + 8;
const TIME_LEN: usize = 8;

type DedupTable<'t> = Table<'t, (u64, u16), &'static [u8]>;
type DedupReadTable = ReadOnlyTable<(u64, u16), &'static [u8]>;

/// Fields a state search can filter on or project
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateQueryField {
    Key,
    /// Effective time
    Time,
    InsertTime,
    /// Payload bytes, without the type tag
    Value,
}

impl FromStr for StateQueryField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "key" => Ok(Self::Key),
            "time" => Ok(Self::Time),
            "insert_time" | "inserted" => Ok(Self::InsertTime),
            "value" => Ok(Self::Value),
            other => Err(Error::invalid_argument(format!("unknown state field '{other}'"))),
        }
    }
}

/// A state entry as returned by [`StateStore::get`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateEntry {
    pub key: Vec<u8>,
    /// Effective time, truncated to the store resolution
    pub time: Timestamp,
    pub value: StoredValue,
    pub inserted: Timestamp,
}

/// One search match. `values` line up with the requested fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateRow {
    pub values: Vec<FieldValue>,
}

/// Decoded row value
#[derive(Clone, Copy, Debug)]
struct RowValue {
    value: ValueStoreKey,
    inserted_ms: i64,
}

impl RowValue {
    fn encode(&self, out: &mut impl BufMut) {
        out.put_slice(&self.value.to_bytes());
        out.put_i64(self.inserted_ms);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ROW_VALUE_LEN {
            return Err(Error::corrupt(format!(
                "state row value is {} bytes, expected {}",
                bytes.len(),
                ROW_VALUE_LEN
            )));
        }
        let value = ValueStoreKey::from_bytes(bytes)?;
        let mut tail = &bytes[ValueStoreKey::ENCODED_LEN..];
        Ok(Self {
            value,
            inserted_ms: tail.get_i64(),
        })
    }

    fn inserted(&self) -> Result<Timestamp> {
        DateTime::from_timestamp_millis(self.inserted_ms)
            .ok_or_else(|| Error::corrupt(format!("insert time {} out of range", self.inserted_ms)))
    }
}

/// Split a row key into its dimension and effective time parts
fn split_row_key(row_key: &[u8]) -> Result<(DimensionRef<'_>, &[u8])> {
    let (dim, used) = decode_dimension(row_key, true)?;
    let time = &row_key[used..];
    if time.len() == TIME_LEN {
        Ok((dim, time))
    } else {
        Err(Error::corrupt("state row key has a malformed time suffix"))
    }
}

fn resolve<T>(table: &T, store: &ValueStore, lookup: ValueStoreKey) -> Result<Vec<u8>>
where
    T: ReadableTable<(u64, u16), &'static [u8]>,
{
    store
        .get_in(table, lookup)?
        .ok_or_else(|| Error::corrupt(format!("dangling reference {lookup}")))
}

/// De-duplicated per-entity state over time
pub struct StateStore {
    env: StoreEnv,
    times: BucketCodec,
    keys: ValueStore,
    values: ValueStore,
}

impl StateStore {
    pub fn create(
        path: impl AsRef<Path>,
        settings: &StoreSettings,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        Self::from_env(StoreEnv::create(path, settings, StoreKind::State, pool)?)
    }

    pub fn open(
        path: impl AsRef<Path>,
        settings: &StoreSettings,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        Self::from_env(StoreEnv::open(path, settings, StoreKind::State, pool)?)
    }

    fn from_env(env: StoreEnv) -> Result<Self> {
        let schema = &env.settings().key_schema;
        let hasher = ContentHasher::new(schema.hash_algorithm);
        Ok(Self {
            times: BucketCodec::wide(schema)?,
            keys: ValueStore::new(tables::KEYS, hasher),
            values: ValueStore::new(tables::VALUES, hasher),
            env,
        })
    }

    #[must_use]
    pub const fn env(&self) -> &StoreEnv {
        &self.env
    }

    #[must_use]
    pub const fn shutdown_signal(&self) -> &ShutdownSignal {
        self.env.shutdown_signal()
    }

    pub fn writer(&self) -> Writer<'_> {
        self.env.writer()
    }

    fn pool(&self) -> &BufferPool {
        self.env.pool()
    }

    fn row_key_capacity(key_len: usize) -> usize {
        (3 + key_len).max(1 + ValueStoreKey::ENCODED_LEN) + TIME_LEN
    }

    /// Room for a row key and its value in a single pooled buffer. An
    /// operation never holds two buffers at once.
    fn row_capacity(key_len: usize) -> usize {
        Self::row_key_capacity(key_len) + ROW_VALUE_LEN
    }

    /// Record `value` as the state of `key` from `time` on. Returns the key
    /// the payload is stored under.
    pub fn put(
        &self,
        writer: &mut Writer<'_>,
        key: &[u8],
        time: Timestamp,
        value: &StoredValue,
    ) -> Result<ValueStoreKey> {
        self.put_at(writer, key, time, value, Utc::now())
    }

    /// Like [`put`](Self::put) with an explicit insert time
    pub fn put_at(
        &self,
        writer: &mut Writer<'_>,
        key: &[u8],
        time: Timestamp,
        value: &StoredValue,
        inserted: Timestamp,
    ) -> Result<ValueStoreKey> {
        self.env.check_writer(writer)?;
        let encoded = value.encode();
        writer.mutate(|txn| {
            let mut keys = txn.open_table(tables::KEYS)?;
            let mut values = txn.open_table(tables::VALUES)?;
            let mut rows = txn.open_table(tables::ROWS)?;

            let mut buf = self.pool().acquire(Self::row_capacity(key.len()))?;
            self.write_dimension(&mut keys, key, &mut buf)?;
            self.times.encode(time, &mut *buf)?;
            let split = buf.len();

            let value_key = self.values.get_or_create_in(&mut values, &encoded)?;
            RowValue {
                value: value_key,
                inserted_ms: inserted.timestamp_millis(),
            }
            .encode(&mut *buf);
            rows.insert(&buf[..split], &buf[split..])?;
            Ok(value_key)
        })
    }

    fn write_dimension(
        &self,
        keys: &mut DedupTable<'_>,
        key: &[u8],
        out: &mut bytes::BytesMut,
    ) -> Result<()> {
        let storage = self.env.settings().key_schema.key_storage;
        if uses_lookup(storage, key.len()) {
            let lookup = self.keys.get_or_create_in(keys, key)?;
            encode_dimension(&DimensionRef::Lookup(lookup), true, out)
        } else {
            encode_dimension(&DimensionRef::Inline(key), true, out)
        }
    }

    /// Encoded dimension for reading, or `None` if a lookup key was never
    /// stored
    fn read_dimension(
        &self,
        keys: &DedupReadTable,
        key: &[u8],
        out: &mut bytes::BytesMut,
    ) -> Result<Option<()>> {
        let storage = self.env.settings().key_schema.key_storage;
        let dim = if uses_lookup(storage, key.len()) {
            match self.keys.find_key_in(keys, key)? {
                Some(lookup) => DimensionRef::Lookup(lookup),
                None => return Ok(None),
            }
        } else {
            DimensionRef::Inline(key)
        };
        encode_dimension(&dim, true, out)?;
        Ok(Some(()))
    }

    fn dimension_bytes<T>(&self, keys: &T, dim: DimensionRef<'_>) -> Result<Vec<u8>>
    where
        T: ReadableTable<(u64, u16), &'static [u8]>,
    {
        match dim {
            DimensionRef::Inline(bytes) => Ok(bytes.to_vec()),
            DimensionRef::Lookup(lookup) => resolve(keys, &self.keys, lookup),
        }
    }

    /// State of `key` in effect at `at`
    pub fn get(&self, key: &[u8], at: Timestamp) -> Result<Option<StateEntry>> {
        let txn = self.env.begin_read()?;
        let keys = txn.open_table(tables::KEYS)?;
        let values = txn.open_table(tables::VALUES)?;
        let rows = txn.open_table(tables::ROWS)?;

        // dimension prefix is the lower bound, prefix plus `at` the upper
        let mut buf = self.pool().acquire(Self::row_key_capacity(key.len()))?;
        if self.read_dimension(&keys, key, &mut buf)?.is_none() {
            return Ok(None);
        }
        let prefix = buf.len();
        self.times.encode(at, &mut *buf)?;

        let Some(entry) = rows.range(&buf[..prefix]..=&buf[..])?.next_back() else {
            return Ok(None);
        };
        let (row_key, row_value) = entry?;
        let (_, time) = split_row_key(row_key.value())?;
        let row = RowValue::decode(row_value.value())?;
        let payload = resolve(&values, &self.values, row.value)?;
        Ok(Some(StateEntry {
            key: key.to_vec(),
            time: self.times.decode(time)?,
            value: StoredValue::decode(&payload)?,
            inserted: row.inserted()?,
        }))
    }

    /// Scan every row, pushing those matching `criteria` to `consumer`.
    /// Corrupt rows are skipped and counted.
    pub fn search(
        &self,
        criteria: &Criteria<StateQueryField>,
        fields: &[StateQueryField],
        mut consumer: impl FnMut(StateRow) -> ControlFlow<()>,
    ) -> Result<SearchSummary> {
        let txn = self.env.begin_read()?;
        let keys = txn.open_table(tables::KEYS)?;
        let values = txn.open_table(tables::VALUES)?;
        let rows = txn.open_table(tables::ROWS)?;
        let mut summary = SearchSummary::default();

        for entry in rows.iter()? {
            let (row_key, row_value) = entry?;
            summary.scanned += 1;
            let mut view = StateView {
                store: self,
                keys: &keys,
                values: &values,
                row_key: row_key.value(),
                row_value: row_value.value(),
                key: None,
                payload: None,
            };
            let outcome = view.check().and_then(|()| {
                if !criteria.evaluate(&mut |f: &StateQueryField| view.extract(*f))? {
                    return Ok(None);
                }
                fields
                    .iter()
                    .map(|f| view.extract(*f))
                    .collect::<Result<Vec<_>>>()
                    .map(Some)
            });
            match outcome {
                Ok(Some(values)) => {
                    summary.matched += 1;
                    if consumer(StateRow { values }).is_break() {
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

    /// Copy every row of the store at `source` into this one. Where both
    /// stores hold the same key and time, the more recently inserted entry
    /// wins. Runs in one transaction on `writer`, which must belong to this
    /// store; its pending mutations are committed first. Returns the number
    /// of source rows.
    pub fn merge(&self, writer: &mut Writer<'_>, source: impl AsRef<Path>) -> Result<u64> {
        self.env.check_writer(writer)?;
        let source = SourceStore::open(source)?;
        self.env.schema().ensure_matches(source.schema())?;

        writer.commit()?;
        let merged = writer.mutate(|txn| self.merge_rows(txn, &source))?;
        writer.commit()?;
        info!(
            "Merged {} state rows from {} into {}",
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
        let src_values = src_txn.open_table(tables::VALUES)?;
        let mut keys = txn.open_table(tables::KEYS)?;
        let mut values = txn.open_table(tables::VALUES)?;
        let mut rows = txn.open_table(tables::ROWS)?;
        let mut merged = 0;

        for entry in src_rows.iter()? {
            signal.check()?;
            let (src_key, src_value) = entry?;
            let (dim, time) = split_row_key(src_key.value())?;
            let incoming = RowValue::decode(src_value.value())?;
            let key = self.dimension_bytes(&src_keys, dim)?;
            let payload = resolve(&src_values, &self.values, incoming.value)?;

            let mut buf = self.pool().acquire(Self::row_capacity(key.len()))?;
            self.write_dimension(&mut keys, &key, &mut buf)?;
            buf.extend_from_slice(time);
            let split = buf.len();

            let current = rows
                .get(&buf[..split])?
                .map(|v| RowValue::decode(v.value()))
                .transpose()?;
            if current.is_none_or(|c| incoming.inserted_ms >= c.inserted_ms) {
                let value = self.values.get_or_create_in(&mut values, &payload)?;
                RowValue {
                    value,
                    inserted_ms: incoming.inserted_ms,
                }
                .encode(&mut *buf);
                rows.insert(&buf[..split], &buf[split..])?;
            }
            merged += 1;
        }
        Ok(merged)
    }

    /// Delete entries older than `cutoff`, then sweep keys and payloads no
    /// remaining entry references. Runs on `writer`, which must belong to
    /// this store. Returns the number of entries deleted.
    pub fn delete_old_data(&self, writer: &mut Writer<'_>, cutoff: Timestamp) -> Result<u64> {
        self.env.check_writer(writer)?;
        writer.commit()?;
        let plan = self.plan_retention(cutoff)?;
        let deleted = retention::delete_rows(writer, &plan.expired)?;
        let keys = retention::sweep_unreferenced(writer, &self.keys, &plan.used_keys)?;
        let values = retention::sweep_unreferenced(writer, &self.values, &plan.used_values)?;
        writer.commit()?;
        info!(
            "Retention before {} removed {} entries, {} keys and {} values from {}",
            cutoff,
            deleted,
            keys,
            values,
            self.env.path().display()
        );
        Ok(deleted)
    }

    fn plan_retention(&self, cutoff: Timestamp) -> Result<RetentionPlan> {
        let basis = self.env.settings().retention;
        let signal = self.shutdown_signal();
        let txn = self.env.begin_read()?;
        let rows = txn.open_table(tables::ROWS)?;
        let mut plan = RetentionPlan::default();

        for entry in rows.iter()? {
            signal.check()?;
            let (row_key, row_value) = entry?;
            let (dim, time) = split_row_key(row_key.value())?;
            let row = RowValue::decode(row_value.value())?;
            let effective = match basis {
                RetentionBasis::StateTime => self.times.decode(time)?,
                RetentionBasis::InsertTime => row.inserted()?,
            };
            if effective < cutoff {
                plan.expired.push(row_key.value().to_vec());
            } else {
                if let DimensionRef::Lookup(lookup) = dim {
                    plan.used_keys.insert(lookup);
                }
                plan.used_values.insert(row.value);
            }
        }
        Ok(plan)
    }

    /// Drop entries effective before `before` that repeat the payload of the
    /// previous entry for the same key, then sweep keys and payloads left
    /// unreferenced. Lookups return the same payload afterwards. Runs on
    /// `writer`, which must belong to this store. Returns the number of
    /// entries dropped.
    pub fn condense(&self, writer: &mut Writer<'_>, before: Timestamp) -> Result<u64> {
        self.env.check_writer(writer)?;
        writer.commit()?;
        let plan = self.plan_condense(before)?;
        let dropped = retention::delete_rows(writer, &plan.expired)?;
        let keys = retention::sweep_unreferenced(writer, &self.keys, &plan.used_keys)?;
        let values = retention::sweep_unreferenced(writer, &self.values, &plan.used_values)?;
        writer.commit()?;
        info!(
            "Condensing before {} dropped {} entries, {} keys and {} values from {}",
            before,
            dropped,
            keys,
            values,
            self.env.path().display()
        );
        Ok(dropped)
    }

    fn plan_condense(&self, before: Timestamp) -> Result<RetentionPlan> {
        let signal = self.shutdown_signal();
        let txn = self.env.begin_read()?;
        let rows = txn.open_table(tables::ROWS)?;
        let mut plan = RetentionPlan::default();
        // encoded dimension and payload of the last kept entry
        let mut previous: Option<(Vec<u8>, ValueStoreKey)> = None;

        for entry in rows.iter()? {
            signal.check()?;
            let (row_key, row_value) = entry?;
            let row_key = row_key.value();
            let (dim, time) = split_row_key(row_key)?;
            let row = RowValue::decode(row_value.value())?;
            let dim_bytes = &row_key[..row_key.len() - TIME_LEN];

            let repeats = previous
                .as_ref()
                .is_some_and(|(d, v)| d.as_slice() == dim_bytes && *v == row.value);
            if repeats && self.times.decode(time)? < before {
                plan.expired.push(row_key.to_vec());
                continue;
            }
            if let DimensionRef::Lookup(lookup) = dim {
                plan.used_keys.insert(lookup);
            }
            plan.used_values.insert(row.value);
            previous = Some((dim_bytes.to_vec(), row.value));
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

    pub fn close(self) {
        debug!("Closing state store {}", self.env.path().display());
    }
}

/// Lazily decoded view of one state row
struct StateView<'a> {
    store: &'a StateStore,
    keys: &'a DedupReadTable,
    values: &'a DedupReadTable,
    row_key: &'a [u8],
    row_value: &'a [u8],
    key: Option<Vec<u8>>,
    payload: Option<StoredValue>,
}

impl StateView<'_> {
    fn check(&self) -> Result<()> {
        split_row_key(self.row_key)?;
        RowValue::decode(self.row_value).map(|_| ())
    }

    fn extract(&mut self, field: StateQueryField) -> Result<FieldValue> {
        Ok(match field {
            StateQueryField::Key => {
                if self.key.is_none() {
                    let (dim, _) = split_row_key(self.row_key)?;
                    self.key = Some(self.store.dimension_bytes(self.keys, dim)?);
                }
                FieldValue::Bytes(self.key.clone().unwrap_or_default())
            }
            StateQueryField::Time => {
                let (_, time) = split_row_key(self.row_key)?;
                FieldValue::Time(self.store.times.decode(time)?)
            }
            StateQueryField::InsertTime => {
                FieldValue::Time(RowValue::decode(self.row_value)?.inserted()?)
            }
            StateQueryField::Value => {
                if self.payload.is_none() {
                    let row = RowValue::decode(self.row_value)?;
                    let bytes = resolve(self.values, &self.store.values, row.value)?;
                    self.payload = Some(StoredValue::decode(&bytes)?);
                }
                FieldValue::Bytes(
                    self.payload
                        .as_ref()
                        .map(|p| p.bytes.clone())
                        .unwrap_or_default(),
                )
            }
        })
    }
}
