//! Daemon settings loaded from environment variables.
//!
//! Credentials come from the environment rather than the command line so
//! they stay out of shell history and process listings. Operational knobs
//! (paths, ports, limits) are CLI arguments on the binary instead.

use crate::{Error, Result};

/// Credentials and collection identity for one daemon run.
///
/// Both fields are required; a missing variable is an error before any
/// I/O happens.
#[derive(Debug, Clone)]
pub struct Settings {
    /// API token used for both the query endpoint and the MQTT broker.
    pub api_token: String,

    /// Identity of the collection to archive.
    pub collection_id: String,
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Required:
    /// - `FATHOM_API_TOKEN`: service API token
    /// - `FATHOM_COLLECTION_ID`: collection to archive
    pub fn from_env() -> Result<Self> {
        let api_token = require_env("FATHOM_API_TOKEN")?;
        let collection_id = require_env("FATHOM_COLLECTION_ID")?;

        tracing::info!(
            collection_id = %collection_id,
            "settings loaded"
        );

        Ok(Self {
            api_token,
            collection_id,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::Config(format!(
            "missing required environment variable '{name}'"
        ))),
    }
}
