//! Fathom ingestion pipeline components.
//!
//! This crate provides the synchronization engine that archives collection
//! data points from the remote service into local SQLite storage.
//!
//! # Modules
//!
//! - [`cursor`] - Resume cursor derived from persisted storage
//! - [`fetch`] - Paginated historical backfill from the query endpoint
//! - [`stream`] - Live data point stream over MQTT
//! - [`storage`] - SQLite-backed persistent storage
//! - [`sync`] - The synchronizer orchestrating backfill and live phases
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────┐
//!                  │ Cursor Store │  max received token in SQLite
//!                  └──────┬───────┘
//!                         │ resume point
//!                         ▼
//! ┌─────────────────┐           ┌─────────────────┐
//! │ Paginated Fetch │           │   Live Stream   │
//! │  (HTTP, windowed)│          │  (MQTT, pushed) │
//! └────────┬────────┘           └────────┬────────┘
//!          │ one ordered batch           │ one point at a time
//!          └───────────┬────────────────┘
//!                      ▼
//!            ┌──────────────────┐
//!            │   SQLite store   │  single source of truth
//!            └──────────────────┘
//! ```
//!
//! The synchronizer runs the backfill to "now" first, then consumes the
//! live stream until cancelled, writing both through the same store.

pub mod config;
pub mod cursor;
pub mod error;
pub mod fetch;
pub mod storage;
pub mod stream;
pub mod sync;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use config::Settings;
pub use fetch::{CollectionQuery, Fetcher, HttpCollectionClient, MAX_PAGE_SIZE, MAX_TOTAL_RECORDS};
pub use storage::{DataStore, SqliteStore};
pub use stream::{LiveSource, MqttSource, StreamConfig, Subscription};
pub use sync::{SyncOptions, SyncReport, Synchronizer};
