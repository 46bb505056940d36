//! Error taxonomy for a single alert cycle.
//!
//! Fetch, parse and storage-read failures abort the cycle. Notification
//! failures are per-listing and never leave this crate as a `CycleError`.

use std::time::Duration;
use thiserror::Error;

use crate::models::StrategyKind;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{strategy} strategy blocked: {reason}")]
    Blocked { strategy: StrategyKind, reason: String },

    #[error("{strategy} strategy network error: {message}")]
    Network { strategy: StrategyKind, message: String },

    #[error("{strategy} strategy timed out after {after:?}")]
    Timeout { strategy: StrategyKind, after: Duration },

    #[error("all retrieval strategies exhausted after {attempts} attempts (last: {last})")]
    ExhaustedRetries { attempts: u32, last: String },
}

impl FetchError {
    pub fn blocked(strategy: StrategyKind, reason: impl Into<String>) -> Self {
        Self::Blocked { strategy, reason: reason.into() }
    }

    pub fn network(strategy: StrategyKind, message: impl std::fmt::Display) -> Self {
        Self::Network { strategy, message: message.to_string() }
    }

    /// Short label used in attempt logs and the run audit table.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Blocked { .. } => "blocked",
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::ExhaustedRetries { .. } => "exhausted",
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// Upstream format changed. Never retried locally.
    #[error("content does not match any known listing schema: {0}")]
    SchemaMismatch(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Failures that abort a whole cycle before any alert goes out.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
