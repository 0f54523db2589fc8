//! Error types shared by the meter crates.

use thiserror::Error;

/// Errors raised by data sources, enrichment sinks and domain helpers.
#[derive(Debug, Error)]
pub enum MeterError {
    /// A data source could not produce its partial aggregate.
    #[error("data source {source_name} failed: {message}")]
    Source {
        /// Name of the failing source (e.g. "melee").
        source_name: String,
        /// What went wrong.
        message: String,
    },

    /// An enrichment request could not be delivered.
    #[error("enrichment failed: {0}")]
    Enrichment(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MeterError {
    /// Build a [`MeterError::Source`] for the named source.
    pub fn source_failed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}
