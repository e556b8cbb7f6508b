//! Age-based deletion shared by the metric and state stores
//!
//! A retention run first scans a read snapshot, recording the rows to delete
//! and every de-duplicated key still referenced by a kept row. It then deletes
//! in writer batches and finally sweeps the unreferenced entries. The caller
//! holds the store's writer for the whole run, so no insert can add a new
//! reference between the scan and the sweep.

use crate::tables;
use crate::value_store::ValueStore;
use crate::writer::Writer;
use std::collections::HashSet;
use tallystore_common::{Result, ValueStoreKey};
use tracing::debug;

/// Rows found expired by a scan, plus the references kept rows still hold
#[derive(Debug, Default)]
pub struct RetentionPlan {
    pub expired: Vec<Vec<u8>>,
    pub used_keys: HashSet<ValueStoreKey>,
    pub used_values: HashSet<ValueStoreKey>,
}

/// Delete `rows` from the `rows` table, checking for shutdown before each.
/// On cancellation the uncommitted batch is discarded.
pub(crate) fn delete_rows(writer: &mut Writer<'_>, rows: &[Vec<u8>]) -> Result<u64> {
    let signal = writer.env().shutdown_signal().clone();
    let mut deleted = 0;
    for row in rows {
        if let Err(e) = signal.check() {
            writer.abort();
            return Err(e);
        }
        let removed = writer.mutate(|txn| {
            let mut table = txn.open_table(tables::ROWS)?;
            let removed = table.remove(row.as_slice())?.is_some();
            Ok(removed)
        })?;
        if removed {
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Remove every entry of `store` not in `used`
pub(crate) fn sweep_unreferenced(
    writer: &mut Writer<'_>,
    store: &ValueStore,
    used: &HashSet<ValueStoreKey>,
) -> Result<u64> {
    let env = writer.env();
    let signal = env.shutdown_signal().clone();
    // Entries are only added through a writer, and the caller holds it
    let candidates = {
        let txn = env.begin_read()?;
        store.keys_in(&txn.open_table(store.definition())?)?
    };

    let mut swept = 0;
    for key in candidates.into_iter().filter(|k| !used.contains(k)) {
        if let Err(e) = signal.check() {
            writer.abort();
            return Err(e);
        }
        if writer.mutate(|txn| store.delete(txn, key))? {
            swept += 1;
        }
    }
    if swept > 0 {
        debug!("Swept {} unreferenced entries", swept);
    }
    Ok(swept)
}
