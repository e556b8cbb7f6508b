//! Store environment backed by redb.
//!
//! A store is a directory holding one redb file. [`StoreEnv`] owns the
//! database handle, the validated settings, the shared buffer pool and the
//! write gate that keeps one [`Writer`] per store at a time. The metric and
//! state stores are thin typed layers on top of it.

use crate::pool::BufferPool;
use crate::schema::{SchemaInfo, StoreKind};
use crate::tables;
use crate::writer::{ShutdownSignal, Writer};
use parking_lot::Mutex;
use redb::{Builder, Database, ReadTransaction, ReadableTable, ReadableTableMetadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tallystore_common::{Error, Result, StoreSettings};
use tracing::{debug, info};

/// File name of the redb database inside a store directory
pub const DATA_FILE: &str = "data.redb";

/// Summary of a store's contents
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreInfo {
    pub path: PathBuf,
    pub schema: SchemaInfo,
    pub rows: u64,
    pub keys: u64,
    pub values: u64,
    pub file_size: u64,
}

/// Database handle plus everything a store needs to read and write it
pub struct StoreEnv {
    path: PathBuf,
    db: Database,
    kind: StoreKind,
    settings: StoreSettings,
    schema: SchemaInfo,
    pool: Arc<BufferPool>,
    write_gate: Mutex<()>,
    shutdown: ShutdownSignal,
}

impl StoreEnv {
    /// Create the store directory if needed and open it. An existing store
    /// must have been written with the same layout.
    pub fn create(
        path: impl AsRef<Path>,
        settings: &StoreSettings,
        kind: StoreKind,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        settings.validate()?;
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let db = builder(settings).create(path.join(DATA_FILE))?;
        Self::init(path, db, settings, kind, pool)
    }

    /// Open an existing store
    pub fn open(
        path: impl AsRef<Path>,
        settings: &StoreSettings,
        kind: StoreKind,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        settings.validate()?;
        let path = path.as_ref();
        let db = builder(settings).open(existing_data_file(path)?)?;
        Self::init(path, db, settings, kind, pool)
    }

    fn init(
        path: &Path,
        db: Database,
        settings: &StoreSettings,
        kind: StoreKind,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        let expected = SchemaInfo::for_store(kind, settings)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::KEYS)?;
            let _t = write_txn.open_table(tables::VALUES)?;
            let _t = write_txn.open_table(tables::ROWS)?;
            let mut meta = write_txn.open_table(tables::META)?;
            let stored = meta
                .get(tables::SCHEMA_KEY)?
                .map(|v| SchemaInfo::decode(v.value()))
                .transpose()?;
            match stored {
                Some(stored) => expected.ensure_matches(&stored)?,
                None => {
                    meta.insert(tables::SCHEMA_KEY, expected.encode()?.as_slice())?;
                    info!("Initialised {:?} store at {}", kind, path.display());
                }
            }
        }
        write_txn.commit()?;
        debug!("Opened store {} ({})", path.display(), expected);

        Ok(Self {
            path: path.to_path_buf(),
            db,
            kind,
            settings: settings.clone(),
            schema: expected,
            pool,
            write_gate: Mutex::new(()),
            shutdown: ShutdownSignal::default(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn kind(&self) -> StoreKind {
        self.kind
    }

    #[must_use]
    pub const fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    #[must_use]
    pub const fn schema(&self) -> &SchemaInfo {
        &self.schema
    }

    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    #[must_use]
    pub const fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub(crate) const fn db(&self) -> &Database {
        &self.db
    }

    pub fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    /// Exclusive writer, blocking until any other writer is released
    pub fn writer(&self) -> Writer<'_> {
        Writer::new(self, self.write_gate.lock())
    }

    /// Exclusive writer, or `None` while another writer is live
    pub fn try_writer(&self) -> Option<Writer<'_>> {
        self.write_gate.try_lock().map(|gate| Writer::new(self, gate))
    }

    /// Fail unless `writer` was issued by this store
    pub(crate) fn check_writer(&self, writer: &Writer<'_>) -> Result<()> {
        if std::ptr::eq(writer.env(), self) {
            Ok(())
        } else {
            Err(Error::invalid_argument("writer belongs to a different store"))
        }
    }

    /// Number of rows in the `rows` table
    pub fn count(&self) -> Result<u64> {
        let txn = self.begin_read()?;
        Ok(txn.open_table(tables::ROWS)?.len()?)
    }

    pub fn info(&self) -> Result<StoreInfo> {
        let txn = self.begin_read()?;
        let file_size = std::fs::metadata(self.path.join(DATA_FILE))?.len();
        Ok(StoreInfo {
            path: self.path.clone(),
            schema: self.schema.clone(),
            rows: txn.open_table(tables::ROWS)?.len()?,
            keys: txn.open_table(tables::KEYS)?.len()?,
            values: txn.open_table(tables::VALUES)?.len()?,
            file_size,
        })
    }

    /// Reclaim free pages. Returns whether anything was compacted.
    pub fn compact(&mut self) -> Result<bool> {
        let compacted = self.db.compact()?;
        if compacted {
            info!("Compacted store {}", self.path.display());
        }
        Ok(compacted)
    }
}

fn existing_data_file(path: &Path) -> Result<PathBuf> {
    let file = path.join(DATA_FILE);
    if file.exists() {
        Ok(file)
    } else {
        Err(Error::invalid_argument(format!("no store at {}", path.display())))
    }
}

/// Another store opened only to be read, as the source of a merge
pub struct SourceStore {
    path: PathBuf,
    db: Database,
    schema: SchemaInfo,
}

impl SourceStore {
    /// Open the store at `path` without creating or altering anything
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::open(existing_data_file(path)?)?;
        let schema = {
            let txn = db.begin_read()?;
            let meta = txn.open_table(tables::META)?;
            let stored = meta
                .get(tables::SCHEMA_KEY)?
                .ok_or_else(|| Error::corrupt("store has no schema record"))?;
            SchemaInfo::decode(stored.value())?
        };
        Ok(Self {
            path: path.to_path_buf(),
            db,
            schema,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn schema(&self) -> &SchemaInfo {
        &self.schema
    }

    pub fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }
}

fn builder(settings: &StoreSettings) -> Builder {
    let mut builder = Builder::new();
    if let Some(size) = settings.cache_size {
        builder.set_cache_size(size);
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use tallystore_common::Resolution;
    use tempfile::tempdir;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::default())
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempdir().unwrap();
        let settings = StoreSettings::default();
        let env = StoreEnv::create(dir.path(), &settings, StoreKind::Metric, pool()).unwrap();
        assert!(dir.path().join(DATA_FILE).exists());
        assert_eq!(env.count().unwrap(), 0);
        drop(env);

        let env = StoreEnv::open(dir.path(), &settings, StoreKind::Metric, pool()).unwrap();
        let info = env.info().unwrap();
        assert_eq!(info.rows, 0);
        assert!(info.file_size > 0);
        let expected = env.schema().clone();
        drop(env);

        let source = SourceStore::open(dir.path()).unwrap();
        assert_eq!(source.schema(), &expected);
    }

    #[test]
    fn test_open_missing_store() {
        let dir = tempdir().unwrap();
        let result = StoreEnv::open(
            dir.path().join("missing"),
            &StoreSettings::default(),
            StoreKind::Metric,
            pool(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_reopen_with_other_layout_rejected() {
        let dir = tempdir().unwrap();
        let settings = StoreSettings::default();
        drop(StoreEnv::create(dir.path(), &settings, StoreKind::Metric, pool()).unwrap());

        let mut other = settings.clone();
        other.key_schema.resolution = Resolution::Day;
        let result = StoreEnv::open(dir.path(), &other, StoreKind::Metric, pool());
        assert!(matches!(result, Err(Error::SchemaMismatch { .. })));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let dir = tempdir().unwrap();
        let mut settings = StoreSettings::default();
        settings.writer.commit_threshold = 0;
        let result = StoreEnv::create(dir.path(), &settings, StoreKind::Metric, pool());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_compact_empty_store() {
        let dir = tempdir().unwrap();
        let mut env =
            StoreEnv::create(dir.path(), &StoreSettings::default(), StoreKind::State, pool())
                .unwrap();
        assert!(env.compact().is_ok());
    }
}
