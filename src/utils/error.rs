//! Error types for the brew and its transport adapter.
//!
//! `TransportError` is what an adapter reports back to the core. The ledger
//! and the brew tell an idempotent conflict (`AlreadyExists`, or `NotFound`
//! on teardown) apart from a permanent configuration problem
//! (`InvalidArgument`); anything else is treated as transient.
//!
//! `BrewError` is what the host-facing hooks return.

use config::ConfigError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Errors that will not go away by retrying the same call.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::InvalidArgument(_))
    }
}

#[derive(Debug, Error)]
pub enum BrewError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no project id configured; set `project_id` before registering brewers or patrons")]
    MissingProject,
}
