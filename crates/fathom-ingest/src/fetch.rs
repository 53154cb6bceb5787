//! Paginated historical backfill from the collection query endpoint.
//!
//! The remote endpoint returns data points newest-first within a
//! `[start, end)` window and caps each call at a server-side page limit.
//! There is no continuation token: paging is done entirely by shrinking
//! the window's `end` to the oldest timestamp seen so far and asking
//! again.
//!
//! # Termination
//!
//! A fetch stops when any of these holds after a call:
//! - the page came back shorter than requested (window exhausted — a
//!   zero-record page is the degenerate case of this),
//! - the running total reached the requested ceiling.
//!
//! # Failure
//!
//! Any call failure fails the whole window; no partial result is
//! returned. The caller (or the operator re-running the daemon) retries
//! the window, which the resume cursor makes cheap.

use serde::Deserialize;
use std::future::Future;

use fathom_core::{NewDataPoint, Timestamp, WireMessage};

use crate::{Error, Result};

/// Hard ceiling on the total records one fetch may accumulate when the
/// caller does not bound it. Keeps an unbounded historical gap from
/// turning into an unbounded run.
pub const MAX_TOTAL_RECORDS: usize = 100_000;

/// The service caps a single query call at this many records.
pub const MAX_PAGE_SIZE: usize = 256;

/// The remote paginated query endpoint.
///
/// One call returns up to `limit` data points with `received` in
/// `[start, end)`, newest-first. Behind a trait so the pagination logic
/// is tested against a scripted remote.
pub trait CollectionQuery {
    /// Issue a single query call.
    fn query(
        &self,
        collection_id: &str,
        start: Timestamp,
        end: Timestamp,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<WireMessage>>> + Send;
}

/// Page size for the next call given how much has been accumulated.
///
/// The remaining quota, capped at the server-side page ceiling. Zero when
/// the quota is already met.
pub(crate) fn page_limit(so_far: usize, wanted: usize) -> usize {
    wanted.saturating_sub(so_far).min(MAX_PAGE_SIZE)
}

/// The `received` token of the oldest record accumulated so far.
///
/// Pages arrive newest-first, so this is the last element. An absent or
/// empty token falls back to the epoch.
fn oldest_received(accumulated: &[WireMessage]) -> Timestamp {
    accumulated
        .last()
        .and_then(|m| m.received.as_deref())
        .and_then(|t| Timestamp::parse(t).ok())
        .unwrap_or(Timestamp::from_millis(0))
}

/// Windowed, bounded fetcher over a [`CollectionQuery`] endpoint.
pub struct Fetcher<C> {
    client: C,
}

impl<C: CollectionQuery> Fetcher<C> {
    /// Create a fetcher over the given endpoint client.
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Fetch every data point in `[since, until)`, oldest-first.
    ///
    /// `total_wanted` bounds the number of records this pass will pull;
    /// it defaults to [`MAX_TOTAL_RECORDS`]. The remote delivers each
    /// page newest-first; the final result is reversed into ascending
    /// `received` order so downstream writes happen in timestamp order.
    pub async fn fetch(
        &self,
        collection_id: &str,
        since: Timestamp,
        until: Timestamp,
        total_wanted: Option<usize>,
    ) -> Result<Vec<NewDataPoint>> {
        let total_wanted = total_wanted.unwrap_or(MAX_TOTAL_RECORDS);

        // Accumulated newest-first, exactly as the remote delivers.
        let mut accumulated: Vec<WireMessage> = Vec::new();
        let mut fetch_until = until;
        let mut fetch_limit = page_limit(0, total_wanted);
        let mut calls = 0usize;

        loop {
            let page = self
                .client
                .query(collection_id, since, fetch_until, fetch_limit)
                .await?;
            calls += 1;
            metrics::counter!("backfill_pages_total").increment(1);

            let returned = page.len();
            accumulated.extend(page);

            // Short page means the window is exhausted (a zero-record page
            // is the same condition); otherwise stop once the quota is met.
            if returned < fetch_limit || accumulated.len() >= total_wanted {
                break;
            }

            fetch_until = oldest_received(&accumulated);
            fetch_limit = page_limit(accumulated.len(), total_wanted);
        }

        tracing::debug!(
            calls,
            records = accumulated.len(),
            since = %since,
            until = %until,
            "pagination complete"
        );

        accumulated.reverse();
        accumulated
            .into_iter()
            .map(|message| message.into_new_point().map_err(Error::from))
            .collect()
    }
}

/// HTTP client for the collection service query endpoint.
pub struct HttpCollectionClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

/// Envelope of one paginated query response.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DataPage {
    data: Vec<WireMessage>,
}

impl HttpCollectionClient {
    /// Create a client against the given API base URL.
    pub fn new(base_url: &str, api_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        }
    }
}

impl CollectionQuery for HttpCollectionClient {
    async fn query(
        &self,
        collection_id: &str,
        start: Timestamp,
        end: Timestamp,
        limit: usize,
    ) -> Result<Vec<WireMessage>> {
        let url = format!("{}/collections/{}/data", self.base_url, collection_id);

        let page: DataPage = self
            .http
            .get(&url)
            .header("X-API-Token", &self.api_token)
            .query(&[
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(page.data)
    }
}
