//! Write transaction lifecycle
//!
//! A [`Writer`] owns at most one redb write transaction at a time. The
//! transaction is opened lazily by the first mutation and committed either
//! explicitly or once the configured number of mutations is pending. Any
//! failure inside the transaction aborts it, so nothing is half committed.

use crate::store::StoreEnv;
use parking_lot::MutexGuard;
use redb::WriteTransaction;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tallystore_common::{Error, Result};
use tracing::{debug, error, warn};

/// Writer states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterState {
    /// No transaction open
    Idle,
    /// A transaction holds uncommitted mutations
    Writing,
    /// The last transaction was committed; the next mutation opens a new one
    Committed,
}

/// Cooperative cancellation flag checked between rows by long scans
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once triggered
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Exclusive writer for one store. Holds the store's write gate until
/// dropped or closed.
pub struct Writer<'s> {
    env: &'s StoreEnv,
    _gate: MutexGuard<'s, ()>,
    txn: Option<WriteTransaction>,
    pending: usize,
    threshold: usize,
    state: WriterState,
}

impl<'s> Writer<'s> {
    pub(crate) fn new(env: &'s StoreEnv, gate: MutexGuard<'s, ()>) -> Self {
        Self {
            env,
            _gate: gate,
            txn: None,
            pending: 0,
            threshold: env.settings().writer.commit_threshold.max(1),
            state: WriterState::Idle,
        }
    }

    #[must_use]
    pub const fn state(&self) -> WriterState {
        self.state
    }

    /// Mutations in the open transaction
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.pending
    }

    pub(crate) const fn env(&self) -> &'s StoreEnv {
        self.env
    }

    /// Run one mutation inside the current transaction, opening it first if
    /// needed. On failure the transaction is aborted and the error returned.
    pub fn mutate<T>(&mut self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        if self.txn.is_none() {
            self.txn = Some(self.env.db().begin_write()?);
            self.state = WriterState::Writing;
        }
        let outcome = match self.txn.as_ref() {
            Some(txn) => f(txn),
            None => Err(Error::invalid_argument("write transaction missing")),
        };
        match outcome {
            Ok(value) => {
                self.pending += 1;
                self.try_commit()?;
                Ok(value)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Commit if the pending mutation count reached the threshold.
    /// Returns whether a commit happened.
    pub fn try_commit(&mut self) -> Result<bool> {
        if self.pending >= self.threshold {
            self.commit()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Commit the open transaction, if any
    pub fn commit(&mut self) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        let pending = std::mem::take(&mut self.pending);
        match txn.commit() {
            Ok(()) => {
                debug!("Committed {} mutations", pending);
                self.state = WriterState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = WriterState::Idle;
                Err(e.into())
            }
        }
    }

    /// Discard the open transaction
    pub fn abort(&mut self) {
        if let Some(txn) = self.txn.take() {
            let pending = std::mem::take(&mut self.pending);
            if let Err(e) = txn.abort() {
                warn!("Failed to abort transaction with {} mutations: {}", pending, e);
            }
        }
        self.state = WriterState::Idle;
    }

    /// Commit and release the store's write gate
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }
}

impl Drop for Writer<'_> {
    /// Commits pending mutations, unless the thread is unwinding from a
    /// panic, in which case they are discarded
    fn drop(&mut self) {
        if self.txn.is_none() {
            return;
        }
        if std::thread::panicking() {
            warn!("Aborting {} pending mutations while panicking", self.pending);
            self.abort();
        } else if let Err(e) = self.commit() {
            error!("Failed to commit writer on drop: {}", e);
        }
    }
}
