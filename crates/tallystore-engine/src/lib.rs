//! Tallystore engine - embedded temporal aggregation and state storage
//!
//! Two store flavours share one on-disk environment: [`MetricStore`] folds
//! observations into per-bucket aggregates and [`StateStore`] keeps
//! de-duplicated per-entity state over time. Both are backed by redb, write
//! through a single [`Writer`] per store and draw scratch buffers from a
//! shared [`BufferPool`].

pub mod codec;
pub mod metric;
pub mod pool;
pub mod retention;
pub mod schema;
pub mod search;
pub mod state;
pub mod store;
pub mod tables;
pub mod value_store;
pub mod writer;

// Re-exports
pub use metric::{MetricQueryField, MetricRow, MetricStore};
pub use pool::{BufferPool, ClassStats, PooledBuffer};
pub use schema::{SchemaInfo, StoreKind};
pub use search::{Comparison, Criteria, FieldValue, SearchSummary, split_condition};
pub use state::{StateEntry, StateQueryField, StateRow, StateStore};
pub use store::{SourceStore, StoreEnv, StoreInfo};
pub use value_store::ValueStore;
pub use writer::{ShutdownSignal, Writer, WriterState};
