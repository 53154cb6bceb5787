//! Resume cursor derived from persisted storage.
//!
//! The cursor is not its own table: the `received` token of the most
//! recently persisted record *is* the cursor. That makes restarts cheap
//! (one indexed read) and keeps the cursor trivially consistent with what
//! was actually made durable.

use std::time::Duration;

use fathom_core::Timestamp;

use crate::storage::DataStore;
use crate::Result;

/// Lookback window used when the store holds nothing yet: 7 days.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// The point to resume backfilling from.
///
/// Returns the `received` token of the record with the highest local
/// identity (persist order, not token order), or [`DEFAULT_LOOKBACK`]
/// before now when the store is empty.
///
/// A storage failure here is fatal to startup: ingesting with an unknown
/// cursor would re-fetch or silently skip arbitrary history.
pub fn resume_point<S: DataStore>(store: &S) -> Result<Timestamp> {
    let recent = store.list_recent(1)?;

    Ok(match recent.first() {
        Some(point) => point.received,
        None => Timestamp::lookback(DEFAULT_LOOKBACK),
    })
}
