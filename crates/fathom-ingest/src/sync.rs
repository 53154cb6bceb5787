//! The synchronizer: one bounded backfill pass, then live streaming.
//!
//! # Phases
//!
//! A run moves strictly forward through
//! `Starting → Backfilling → LiveStreaming → Draining → Closed`; there is
//! no loop back. If the historical gap exceeds the per-run backfill
//! ceiling, the remainder is deliberately left for the next run — the
//! resume cursor makes re-runs cheap, so operators re-running the daemon
//! *is* the retry mechanism.
//!
//! # Durability
//!
//! The backfill batch is one transaction, written oldest-first. Each live
//! data point is its own insert so it is durable as soon as possible; a
//! crash mid-stream loses at most the one in-flight record. A live point
//! whose token overlaps the just-finished backfill may be stored twice —
//! storage has no uniqueness constraint and readers dedupe downstream.
//!
//! # Shutdown
//!
//! Cancellation lets an in-flight insert finish, then closes the live
//! subscription, and closes storage only after the subscription close
//! completes. Either close failing makes the run fail; both are logged.

use chrono::DateTime;
use tokio_util::sync::CancellationToken;

use fathom_core::Timestamp;

use crate::cursor;
use crate::fetch::{CollectionQuery, Fetcher, MAX_TOTAL_RECORDS};
use crate::storage::DataStore;
use crate::stream::{LiveSource, Subscription};
use crate::{Error, Result};

/// Options for one synchronizer run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Collection to archive.
    pub collection_id: String,

    /// Per-run ceiling on backfilled records. Defaults to the fetcher's
    /// hard ceiling.
    pub backfill_limit: Option<usize>,
}

/// Forward-only phases of a synchronizer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Opening storage and computing the resume cursor.
    Starting,
    /// Draining the paginated fetcher up to "now".
    Backfilling,
    /// Consuming the live stream until cancelled.
    LiveStreaming,
    /// Closing the subscription, then storage.
    Draining,
    /// Terminal.
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Backfilling => "backfilling",
            Self::LiveStreaming => "live-streaming",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

/// What one synchronizer run accomplished.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Data points persisted by the backfill pass.
    pub backfilled: usize,

    /// Data points persisted from the live stream.
    pub streamed: usize,
}

/// Orchestrates cursor, fetcher, live stream and storage for one run.
///
/// Owns the store for the process lifetime; no concurrent writers outside
/// this synchronizer are assumed.
pub struct Synchronizer<S, C, L> {
    store: S,
    fetcher: Fetcher<C>,
    live: L,
    options: SyncOptions,
}

impl<S, C, L> Synchronizer<S, C, L>
where
    S: DataStore,
    C: CollectionQuery,
    L: LiveSource,
{
    /// Build a synchronizer from its collaborators.
    pub fn new(store: S, client: C, live: L, options: SyncOptions) -> Self {
        Self {
            store,
            fetcher: Fetcher::new(client),
            live,
            options,
        }
    }

    /// Run to completion: backfill, stream until `cancel` fires, drain.
    pub async fn run(self, cancel: CancellationToken) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        transition(Phase::Starting);
        self.store.init()?;
        let resume = cursor::resume_point(&self.store)?;
        // The next window starts just past the last persisted token.
        let since = resume.saturating_add_millis(1);
        tracing::info!(
            "Querying for data since '{}'",
            format_token(since)
        );

        transition(Phase::Backfilling);
        metrics::gauge!("backfill_running").set(1.0);
        let batch = self
            .fetcher
            .fetch(
                &self.options.collection_id,
                since,
                Timestamp::now(),
                self.options.backfill_limit,
            )
            .await?;
        metrics::gauge!("backfill_running").set(0.0);

        let ceiling = self.options.backfill_limit.unwrap_or(MAX_TOTAL_RECORDS);
        if batch.len() >= ceiling {
            tracing::warn!(
                "Backfill hit the per-run ceiling of {} records; older history \
                 remains — re-run to continue catching up",
                ceiling
            );
        }

        self.store.add_batch(&batch)?;
        report.backfilled = batch.len();
        metrics::counter!("backfill_points_total").increment(batch.len() as u64);
        tracing::info!("Backfilled {} data points", batch.len());

        transition(Phase::LiveStreaming);
        let (subscription, mut points) = self.live.subscribe().await?;

        let mut live_error: Option<Error> = None;
        let mut stream_died = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Stop signal received");
                    break;
                }
                point = points.recv() => match point {
                    Some(point) => match self.store.add(&point) {
                        Ok(id) => {
                            report.streamed += 1;
                            metrics::counter!("stream_points_total").increment(1);
                            tracing::debug!(
                                id,
                                received = %point.received,
                                "Stored live data point"
                            );
                        }
                        Err(e) => {
                            live_error = Some(e);
                            break;
                        }
                    },
                    None => {
                        stream_died = true;
                        break;
                    }
                },
            }
        }

        transition(Phase::Draining);
        // Subscription first; storage only after its close completes.
        let subscription_result = subscription.close().await;
        let store_result = self.store.close();

        if let Err(e) = &subscription_result {
            tracing::error!("Failed to close live subscription: {}", e);
        }
        if let Err(e) = &store_result {
            tracing::error!("Failed to close data store: {}", e);
        }

        // A mid-stream storage failure outranks close failures; then the
        // transport's own terminal error (surfaced by close), then a
        // store-close failure.
        if let Some(e) = live_error {
            return Err(e);
        }
        subscription_result?;
        store_result?;
        if stream_died {
            return Err(Error::Transport(
                "live stream ended before shutdown was requested".to_string(),
            ));
        }

        transition(Phase::Closed);
        Ok(report)
    }
}

fn transition(phase: Phase) {
    tracing::info!(phase = phase.as_str(), "Sync phase");
}

/// Human-readable rendering of a token for the catch-up log line.
fn format_token(token: Timestamp) -> String {
    DateTime::from_timestamp_millis(token.as_millis())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use fathom_core::{NewDataPoint, WireMessage};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Remote with a fixed set of eligible records (newest-first).
    struct FixedRemote {
        records: Vec<WireMessage>,
    }

    impl FixedRemote {
        fn with_tokens(tokens: &[i64]) -> Self {
            let mut records: Vec<WireMessage> = tokens
                .iter()
                .map(|t| WireMessage {
                    message_id: Some(format!("m{t}")),
                    received: Some(t.to_string()),
                    payload: None,
                })
                .collect();
            records.sort_by_key(|m| {
                std::cmp::Reverse(m.received.as_deref().unwrap().parse::<i64>().unwrap())
            });
            Self { records }
        }

        fn empty() -> Self {
            Self {
                records: Vec::new(),
            }
        }
    }

    impl CollectionQuery for FixedRemote {
        async fn query(
            &self,
            _collection_id: &str,
            start: Timestamp,
            end: Timestamp,
            limit: usize,
        ) -> Result<Vec<WireMessage>> {
            Ok(self
                .records
                .iter()
                .filter(|m| {
                    let t = Timestamp::parse(m.received.as_deref().unwrap()).unwrap();
                    t >= start && t < end
                })
                .take(limit)
                .cloned()
                .collect())
        }
    }

    /// Subscription double that records whether close was called.
    struct TestSubscription {
        closed: Arc<AtomicBool>,
        fail_close: bool,
    }

    impl Subscription for TestSubscription {
        async fn close(self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail_close {
                Err(Error::Transport("close failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Live source double fed from a test-owned channel.
    struct ChannelSource {
        rx: mpsc::Receiver<NewDataPoint>,
        closed: Arc<AtomicBool>,
        fail_close: bool,
    }

    impl ChannelSource {
        fn new() -> (Self, mpsc::Sender<NewDataPoint>, Arc<AtomicBool>) {
            let (tx, rx) = mpsc::channel(16);
            let closed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    rx,
                    closed: Arc::clone(&closed),
                    fail_close: false,
                },
                tx,
                closed,
            )
        }
    }

    impl LiveSource for ChannelSource {
        type Sub = TestSubscription;

        async fn subscribe(self) -> Result<(TestSubscription, mpsc::Receiver<NewDataPoint>)> {
            Ok((
                TestSubscription {
                    closed: self.closed,
                    fail_close: self.fail_close,
                },
                self.rx,
            ))
        }
    }

    fn live_point(received: i64) -> NewDataPoint {
        NewDataPoint {
            source_id: format!("live-{received}"),
            received: Timestamp::from_millis(received),
            payload: Some("live".to_string()),
        }
    }

    fn options() -> SyncOptions {
        SyncOptions {
            collection_id: "col-1".to_string(),
            backfill_limit: None,
        }
    }

    /// A token safely inside the empty-store lookback window and in the
    /// past relative to the backfill's `until = now`.
    fn recent_token(offset: i64) -> i64 {
        Timestamp::now().as_millis() - 60_000 + offset
    }

    #[tokio::test]
    async fn test_backfill_then_live_then_clean_drain() {
        let base = recent_token(0);
        let store = SqliteStore::open_in_memory().unwrap();
        let remote = FixedRemote::with_tokens(&[base + 10, base + 20, base + 30]);
        let (live, tx, closed) = ChannelSource::new();
        let cancel = CancellationToken::new();

        let sync = Synchronizer::new(store, remote, live, options());

        let driver = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tx.send(live_point(base + 40)).await.unwrap();
                tx.send(live_point(base + 50)).await.unwrap();
                // Let the in-flight writes land before stopping.
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
                tx
            }
        });

        let report = sync.run(cancel).await.unwrap();
        let _tx = driver.await.unwrap();

        assert_eq!(report.backfilled, 3);
        assert_eq!(report.streamed, 2);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_backfill_writes_ascending_then_live_appends() {
        let base = recent_token(0);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sync.db");

        let store = SqliteStore::open(&path).unwrap();
        // Remote holds tokens out of order; the store must end up ascending.
        let remote = FixedRemote::with_tokens(&[base + 30, base + 10, base + 20]);
        let (live, tx, _closed) = ChannelSource::new();
        let cancel = CancellationToken::new();

        let sync = Synchronizer::new(store, remote, live, options());
        let driver = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tx.send(live_point(base + 99)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
                tx
            }
        });

        let report = sync.run(cancel).await.unwrap();
        let _tx = driver.await.unwrap();
        assert_eq!(report.backfilled, 3);
        assert_eq!(report.streamed, 1);

        // Reopen the file and check insert order across the phase boundary.
        let store = SqliteStore::open(&path).unwrap();
        store.init().unwrap();
        let recent = store.list_recent(10).unwrap();
        let tokens: Vec<i64> = recent.iter().map(|p| p.received.as_millis()).collect();
        assert_eq!(
            tokens,
            vec![base + 99, base + 30, base + 20, base + 10],
            "newest-first by local identity, ascending across the batch"
        );
    }

    #[tokio::test]
    async fn test_overlapping_live_token_is_stored_as_duplicate() {
        // The live stream can deliver a token equal to the backfill's max;
        // both copies must be persisted.
        let base = recent_token(0);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dup.db");

        let store = SqliteStore::open(&path).unwrap();
        store.init().unwrap();
        store
            .add(&NewDataPoint {
                source_id: "backfilled".to_string(),
                received: Timestamp::from_millis(base),
                payload: None,
            })
            .unwrap();

        let remote = FixedRemote::empty();
        let (live, tx, _closed) = ChannelSource::new();
        let cancel = CancellationToken::new();

        let sync = Synchronizer::new(store, remote, live, options());
        let driver = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tx.send(live_point(base)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
                tx
            }
        });

        let report = sync.run(cancel).await.unwrap();
        let _tx = driver.await.unwrap();
        assert_eq!(report.streamed, 1);

        let store = SqliteStore::open(&path).unwrap();
        store.init().unwrap();
        let recent = store.list_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].received, recent[1].received);
        assert!(recent[0].id > recent[1].id);
    }

    #[tokio::test]
    async fn test_stream_dying_fails_the_run() {
        let store = SqliteStore::open_in_memory().unwrap();
        let remote = FixedRemote::empty();
        let (live, tx, closed) = ChannelSource::new();
        let cancel = CancellationToken::new();

        let sync = Synchronizer::new(store, remote, live, options());
        drop(tx); // transport gone before any stop signal

        let err = sync.run(cancel).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        // The subscription is still drained on the way out.
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_subscription_close_fails_the_run() {
        let store = SqliteStore::open_in_memory().unwrap();
        let remote = FixedRemote::empty();
        let (mut live, tx, _closed) = ChannelSource::new();
        live.fail_close = true;
        let cancel = CancellationToken::new();

        let sync = Synchronizer::new(store, remote, live, options());
        let driver = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
                tx
            }
        });

        let err = sync.run(cancel).await.unwrap_err();
        let _tx = driver.await.unwrap();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_cancel_before_any_live_point_still_reports_backfill() {
        let base = recent_token(0);
        let store = SqliteStore::open_in_memory().unwrap();
        let remote =
            FixedRemote::with_tokens(&[base + 1, base + 2, base + 3, base + 4]);
        let (live, tx, closed) = ChannelSource::new();
        let cancel = CancellationToken::new();
        cancel.cancel(); // stop signal already pending at subscribe time

        let sync = Synchronizer::new(store, remote, live, options());
        let report = sync.run(cancel).await.unwrap();
        drop(tx);

        assert_eq!(report.backfilled, 4);
        assert_eq!(report.streamed, 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Starting.as_str(), "starting");
        assert_eq!(Phase::Backfilling.as_str(), "backfilling");
        assert_eq!(Phase::LiveStreaming.as_str(), "live-streaming");
        assert_eq!(Phase::Draining.as_str(), "draining");
        assert_eq!(Phase::Closed.as_str(), "closed");
    }
}
