//! The data point record model.
//!
//! A *data point* is one observation ingested from the collection service.
//! It exists in two forms: [`NewDataPoint`] before persistence (no local
//! identity yet) and [`DataPoint`] after the store has assigned one.
//!
//! # Ordering
//!
//! The remote system stamps every data point with a `received` token: a
//! numeric string of milliseconds since the Unix epoch, non-decreasing per
//! collection. That token — not local wall-clock time — drives pagination
//! windows and the resume cursor. [`Timestamp`] wraps it as an `i64` so the
//! ordering is explicit in the type system.

use serde::Deserialize;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

/// The remote system's ordering token: milliseconds since the Unix epoch.
///
/// Non-decreasing per collection, but not guaranteed strictly increasing
/// across live-stream reconnects. Serialized on the wire and in storage as
/// a plain numeric string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Construct from milliseconds since the Unix epoch.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the Unix epoch.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }

    /// A point `window` before the current wall-clock time.
    pub fn lookback(window: Duration) -> Self {
        Self(Self::now().0.saturating_sub(window.as_millis() as i64))
    }

    /// Parse a numeric millisecond string as it appears on the wire.
    pub fn parse(token: &str) -> Result<Self> {
        token
            .trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|e| Error::InvalidTimestamp {
                token: token.to_string(),
                reason: e.to_string(),
            })
    }

    /// Add milliseconds, saturating at the numeric bounds.
    pub fn saturating_add_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A data point that has not been persisted yet.
///
/// Constructed by the backfill fetcher (from a paginated response) or the
/// live stream (from a pushed message) and handed straight to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDataPoint {
    /// Identity assigned by the remote system. Unique within a collection.
    pub source_id: String,
    /// The remote's ordering token for this observation.
    pub received: Timestamp,
    /// Raw opaque content. Not interpreted by the pipeline.
    pub payload: Option<String>,
}

/// A persisted data point.
///
/// `id` is assigned exactly once by the store and never reused. The record
/// is immutable from that moment on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    /// Store-assigned identity, monotonically increasing.
    pub id: i64,
    /// Local wall-clock time of persistence. Audit only — never used for
    /// ordering decisions.
    pub created_at: String,
    /// Identity assigned by the remote system.
    pub source_id: String,
    /// The remote's ordering token.
    pub received: Timestamp,
    /// Raw opaque content.
    pub payload: Option<String>,
}

/// Wire shape of a collection data message.
///
/// The paginated query endpoint and the push transport deliver the same
/// JSON object; every field is optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireMessage {
    /// Remote message identity.
    pub message_id: Option<String>,
    /// Millisecond ordering token as a numeric string.
    pub received: Option<String>,
    /// Opaque payload content.
    pub payload: Option<String>,
}

impl WireMessage {
    /// Convert into a [`NewDataPoint`], applying the wire defaults.
    ///
    /// A missing `messageId` becomes the empty string and a missing or
    /// empty `received` token becomes the epoch, matching the service's
    /// documented fallbacks. A present-but-malformed `received` token is
    /// an error — the caller decides whether that skips the message or
    /// fails the request.
    pub fn into_new_point(self) -> Result<NewDataPoint> {
        let received = match self.received.as_deref() {
            None | Some("") => Timestamp::from_millis(0),
            Some(token) => Timestamp::parse(token)?,
        };

        Ok(NewDataPoint {
            source_id: self.message_id.unwrap_or_default(),
            received,
            payload: self.payload,
        })
    }

    /// Parse a raw pushed payload into a [`NewDataPoint`].
    pub fn parse_json(bytes: &[u8]) -> Result<NewDataPoint> {
        let message: WireMessage = serde_json::from_slice(bytes)?;
        message.into_new_point()
    }
}
