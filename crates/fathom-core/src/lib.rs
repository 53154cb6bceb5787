//! Core types and shared utilities for the Fathom archival pipeline.
//!
//! This crate provides:
//! - The data point record model ([`DataPoint`], [`NewDataPoint`], [`Timestamp`])
//! - The wire shape of collection data messages ([`WireMessage`])
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod record;
pub mod metrics;

pub use error::{Error, Result};
pub use record::{DataPoint, NewDataPoint, Timestamp, WireMessage};
