//! Persistent storage for data points.
//!
//! The store is append-only: a data point gets its local identity here,
//! exactly once, and is never updated or deleted afterwards. [`DataStore`]
//! is the capability set any backend must satisfy; [`SqliteStore`] is the
//! shipped implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use fathom_core::{DataPoint, NewDataPoint};

use crate::Result;

/// Capability set of a data point store.
///
/// Storage errors propagate to the caller uninterpreted; this layer does
/// not retry.
pub trait DataStore {
    /// Idempotently ensure the schema exists. Safe to call on existing
    /// storage.
    fn init(&self) -> Result<()>;

    /// The most recent `limit` records, newest-first by local identity.
    fn list_recent(&self, limit: usize) -> Result<Vec<DataPoint>>;

    /// Insert one record and return its assigned local identity.
    fn add(&self, point: &NewDataPoint) -> Result<i64>;

    /// Insert all records as one atomic unit: either every row becomes
    /// visible or none do, even under concurrent readers.
    fn add_batch(&self, points: &[NewDataPoint]) -> Result<()>;

    /// Release underlying resources. Idempotent; later calls are no-ops.
    fn close(&self) -> Result<()>;
}
