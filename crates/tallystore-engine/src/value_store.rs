//! Content-addressed value de-duplication
//!
//! Values are stored under `(content hash, disambiguator)`. Distinct values
//! that share a hash get distinct disambiguators; identical bytes always map
//! back to the key they were first stored under.
//!
//! Collision resolution lives in [`DisambiguatorScan`], a pure state machine
//! fed the entries stored for one hash in id order. [`ValueStore`] wires it to
//! a redb range scan.

use redb::{ReadTransaction, ReadableTable, ReadableTableMetadata, Table, TableDefinition};
use tallystore_common::{ContentHasher, Error, Result, ValueStoreKey};
use tracing::debug;

/// Result of scanning the entries stored for one hash
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Byte-identical value already stored under this id
    Existing(u16),
    /// Value not stored; this is the id to insert it under
    New(u16),
}

/// Walks the ids stored for one hash, looking for an identical value and
/// remembering the lowest unused id.
#[derive(Debug)]
pub struct DisambiguatorScan {
    hash: u64,
    next_expected: u32,
    first_gap: Option<u16>,
    found: Option<u16>,
}

impl DisambiguatorScan {
    #[must_use]
    pub const fn new(hash: u64) -> Self {
        Self {
            hash,
            next_expected: 0,
            first_gap: None,
            found: None,
        }
    }

    /// Feed the next stored entry. Ids must arrive in ascending order.
    ///
    /// Returns `true` once an identical value has been seen and the scan can
    /// stop.
    pub fn observe(&mut self, id: u16, is_equal: bool) -> bool {
        if is_equal {
            self.found = Some(id);
            return true;
        }
        let id = u32::from(id);
        if self.first_gap.is_none() && id > self.next_expected {
            // next_expected < id <= u16::MAX
            self.first_gap = u16::try_from(self.next_expected).ok();
        }
        self.next_expected = id + 1;
        false
    }

    pub fn finish(self) -> Result<ScanOutcome> {
        if let Some(id) = self.found {
            return Ok(ScanOutcome::Existing(id));
        }
        if let Some(gap) = self.first_gap {
            return Ok(ScanOutcome::New(gap));
        }
        u16::try_from(self.next_expected)
            .map(ScanOutcome::New)
            .map_err(|_| Error::DisambiguatorExhausted { hash: self.hash })
    }
}

type DedupTable = TableDefinition<'static, (u64, u16), &'static [u8]>;

/// A de-duplicating store over one `(u64, u16) -> bytes` table
#[derive(Clone, Copy)]
pub struct ValueStore {
    table: DedupTable,
    hasher: ContentHasher,
}

impl ValueStore {
    #[must_use]
    pub const fn new(table: DedupTable, hasher: ContentHasher) -> Self {
        Self { table, hasher }
    }

    #[must_use]
    pub const fn definition(&self) -> DedupTable {
        self.table
    }

    /// Scan the entries for `bytes`' hash
    fn scan<T>(&self, table: &T, bytes: &[u8]) -> Result<(u64, ScanOutcome)>
    where
        T: ReadableTable<(u64, u16), &'static [u8]>,
    {
        let hash = self.hasher.hash(bytes);
        let mut scan = DisambiguatorScan::new(hash);
        for entry in table.range((hash, 0u16)..=(hash, u16::MAX))? {
            let (key, value) = entry?;
            let (_, id) = key.value();
            if scan.observe(id, value.value() == bytes) {
                break;
            }
        }
        Ok((hash, scan.finish()?))
    }

    /// Key of `bytes`, inserting it under a fresh disambiguator if absent
    pub fn get_or_create_in(
        &self,
        table: &mut Table<'_, (u64, u16), &'static [u8]>,
        bytes: &[u8],
    ) -> Result<ValueStoreKey> {
        match self.scan(&*table, bytes)? {
            (hash, ScanOutcome::Existing(id)) => Ok(ValueStoreKey::new(hash, id)),
            (hash, ScanOutcome::New(id)) => {
                table.insert((hash, id), bytes)?;
                if id > 0 {
                    debug!("Hash collision on {:#018x}, stored as id {}", hash, id);
                }
                Ok(ValueStoreKey::new(hash, id))
            }
        }
    }

    pub fn get_or_create_key(
        &self,
        txn: &redb::WriteTransaction,
        bytes: &[u8],
    ) -> Result<ValueStoreKey> {
        let mut table = txn.open_table(self.table)?;
        self.get_or_create_in(&mut table, bytes)
    }

    /// Key of `bytes` if already stored. Never writes.
    pub fn find_key_in<T>(&self, table: &T, bytes: &[u8]) -> Result<Option<ValueStoreKey>>
    where
        T: ReadableTable<(u64, u16), &'static [u8]>,
    {
        match self.scan(table, bytes)? {
            (hash, ScanOutcome::Existing(id)) => Ok(Some(ValueStoreKey::new(hash, id))),
            (_, ScanOutcome::New(_)) => Ok(None),
        }
    }

    pub fn find_key(&self, txn: &ReadTransaction, bytes: &[u8]) -> Result<Option<ValueStoreKey>> {
        self.find_key_in(&txn.open_table(self.table)?, bytes)
    }

    pub fn get_in<T>(&self, table: &T, key: ValueStoreKey) -> Result<Option<Vec<u8>>>
    where
        T: ReadableTable<(u64, u16), &'static [u8]>,
    {
        Ok(table
            .get((key.hash, key.id))?
            .map(|guard| guard.value().to_vec()))
    }

    pub fn get(&self, txn: &ReadTransaction, key: ValueStoreKey) -> Result<Option<Vec<u8>>> {
        self.get_in(&txn.open_table(self.table)?, key)
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, txn: &redb::WriteTransaction, key: ValueStoreKey) -> Result<bool> {
        let mut table = txn.open_table(self.table)?;
        let existed = table.remove((key.hash, key.id))?.is_some();
        Ok(existed)
    }

    pub fn len(&self, txn: &ReadTransaction) -> Result<u64> {
        Ok(txn.open_table(self.table)?.len()?)
    }

    /// Every stored key, in (hash, id) order
    pub fn keys_in<T>(&self, table: &T) -> Result<Vec<ValueStoreKey>>
    where
        T: ReadableTable<(u64, u16), &'static [u8]>,
    {
        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            let (hash, id) = key.value();
            keys.push(ValueStoreKey::new(hash, id));
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables;
    use redb::Database;
    use tallystore_common::HashAlgorithm;
    use tempfile::tempdir;

    /// Strings built from `n` blocks of "Aa"/"BB" all share one poly31 hash
    fn colliding(n: usize) -> Vec<Vec<u8>> {
        (0..1u32 << n)
            .map(|bits| {
                (0..n)
                    .flat_map(|i| if bits & (1 << i) == 0 { *b"Aa" } else { *b"BB" })
                    .collect()
            })
            .collect()
    }

    fn open(dir: &std::path::Path) -> Database {
        Database::create(dir.join("values.redb")).unwrap()
    }

    fn store(algorithm: HashAlgorithm) -> ValueStore {
        ValueStore::new(tables::VALUES, ContentHasher::new(algorithm))
    }

    #[test]
    fn test_scan_empty() {
        assert_eq!(DisambiguatorScan::new(1).finish().unwrap(), ScanOutcome::New(0));
    }

    #[test]
    fn test_scan_match_and_append() {
        let mut scan = DisambiguatorScan::new(1);
        assert!(!scan.observe(0, false));
        assert!(scan.observe(1, true));
        assert_eq!(scan.finish().unwrap(), ScanOutcome::Existing(1));

        let mut scan = DisambiguatorScan::new(1);
        scan.observe(0, false);
        scan.observe(1, false);
        assert_eq!(scan.finish().unwrap(), ScanOutcome::New(2));
    }

    #[test]
    fn test_scan_lowest_gap() {
        let mut scan = DisambiguatorScan::new(1);
        for id in [0, 4, 6] {
            scan.observe(id, false);
        }
        assert_eq!(scan.finish().unwrap(), ScanOutcome::New(1));

        let mut scan = DisambiguatorScan::new(1);
        for id in [3, 4] {
            scan.observe(id, false);
        }
        assert_eq!(scan.finish().unwrap(), ScanOutcome::New(0));
    }

    #[test]
    fn test_scan_exhausted() {
        let mut scan = DisambiguatorScan::new(0xabc);
        for id in 0..=u16::MAX {
            scan.observe(id, false);
        }
        let err = scan.finish().unwrap_err();
        assert!(matches!(err, Error::DisambiguatorExhausted { hash: 0xabc }));
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let values = store(HashAlgorithm::Xx64);

        let txn = db.begin_write().unwrap();
        let a = values.get_or_create_key(&txn, b"hello").unwrap();
        let b = values.get_or_create_key(&txn, b"hello").unwrap();
        txn.commit().unwrap();
        assert_eq!(a, b);

        let read = db.begin_read().unwrap();
        assert_eq!(values.len(&read).unwrap(), 1);
        assert_eq!(values.get(&read, a).unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(values.find_key(&read, b"hello").unwrap(), Some(a));
        assert_eq!(values.find_key(&read, b"absent").unwrap(), None);
    }

    #[test]
    fn test_keys_in_lists_every_entry() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let values = store(HashAlgorithm::Poly31);

        let txn = db.begin_write().unwrap();
        let aa = values.get_or_create_key(&txn, b"Aa").unwrap();
        let bb = values.get_or_create_key(&txn, b"BB").unwrap();
        let other = values.get_or_create_key(&txn, b"zz").unwrap();
        txn.commit().unwrap();

        let read = db.begin_read().unwrap();
        let mut expected = vec![aa, bb, other];
        expected.sort();
        let table = read.open_table(values.definition()).unwrap();
        assert_eq!(values.keys_in(&table).unwrap(), expected);
    }

    #[test]
    fn test_collisions_get_distinct_ids() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let values = store(HashAlgorithm::Poly31);

        let txn = db.begin_write().unwrap();
        let aa = values.get_or_create_key(&txn, b"Aa").unwrap();
        let bb = values.get_or_create_key(&txn, b"BB").unwrap();
        assert_eq!(aa.hash, bb.hash);
        assert_eq!((aa.id, bb.id), (0, 1));
        assert_eq!(values.get_or_create_key(&txn, b"BB").unwrap(), bb);
        txn.commit().unwrap();

        let read = db.begin_read().unwrap();
        assert_eq!(values.get(&read, bb).unwrap().as_deref(), Some(&b"BB"[..]));
    }

    #[test]
    fn test_deleted_ids_are_reused_lowest_first() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let values = store(HashAlgorithm::Poly31);
        let strings = colliding(4);

        let txn = db.begin_write().unwrap();
        let first: Vec<_> = strings[..5]
            .iter()
            .map(|s| values.get_or_create_key(&txn, s).unwrap())
            .collect();
        assert_eq!(first.iter().map(|k| k.id).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        for key in &first[1..4] {
            assert!(values.delete(&txn, *key).unwrap());
        }
        let reused: Vec<_> = strings[5..10]
            .iter()
            .map(|s| values.get_or_create_key(&txn, s).unwrap().id)
            .collect();
        assert_eq!(reused, vec![1, 2, 3, 5, 6]);
        txn.commit().unwrap();
    }

    #[test]
    fn test_reuse_from_zero() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let values = store(HashAlgorithm::Poly31);
        let strings = colliding(4);

        let txn = db.begin_write().unwrap();
        let first: Vec<_> = strings[..5]
            .iter()
            .map(|s| values.get_or_create_key(&txn, s).unwrap())
            .collect();
        for key in &first[..3] {
            values.delete(&txn, *key).unwrap();
        }
        let reused: Vec<_> = strings[5..10]
            .iter()
            .map(|s| values.get_or_create_key(&txn, s).unwrap().id)
            .collect();
        assert_eq!(reused, vec![0, 1, 2, 5, 6]);
        txn.commit().unwrap();
    }
}
