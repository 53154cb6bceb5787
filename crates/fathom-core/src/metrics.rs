//! Prometheus metrics helpers for the Fathom daemon.
//!
//! This module provides centralized metrics initialization and the metric
//! definitions used across Fathom components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fathom_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     use metrics::counter;
//!     counter!("stream_points_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`backfill_`, `stream_`, `store_`)
//! - Suffix: unit or type (`_total`, `_seconds`)

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
/// Returns a handle for [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already
/// installed, instead of panicking. Useful for tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port. Spawns a
/// background task and returns immediately.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics Fathom emits.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    describe_counter!(
        "backfill_points_total",
        "Data points fetched and persisted during the backfill pass"
    );
    describe_counter!(
        "backfill_pages_total",
        "Paginated query calls issued during the backfill pass"
    );
    describe_gauge!(
        "backfill_running",
        "Whether the backfill pass is currently running (1=yes, 0=no)"
    );

    describe_counter!(
        "stream_points_total",
        "Data points received on the live stream and persisted"
    );
    describe_counter!(
        "stream_parse_errors_total",
        "Pushed messages that failed to parse and were skipped"
    );
    describe_counter!(
        "stream_reconnects_total",
        "Live stream connection drops followed by a reconnect attempt"
    );

    describe_counter!(
        "store_writes_total",
        "Individual data point inserts (label: mode=single|batch)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();
        // At most one install can succeed.
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
