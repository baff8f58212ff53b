//! Postgres persistence for the Kepler explorer backend.
//!
//! The only write path is the [`postgres::import::Importer`]: it takes a
//! complete block batch, validates it, and ingests it inside a single
//! database transaction with a fixed, foreign-key-safe runner order. Reads
//! used by the fetchers (gap discovery, unfetched-work scans) live in
//! [`postgres::queries`].

pub mod postgres;

use thiserror::Error;

/// One rejected field of one input record, collected during pre-transaction
/// validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetError {
    pub entity: &'static str,
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ChangesetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}: {}", self.entity, self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    /// Pre-transaction validation failed; the transaction was never opened.
    #[error("invalid changesets: {0:?}")]
    Invalid(Vec<ChangesetError>),
    /// A runner failed inside the import transaction; the whole batch rolled
    /// back.
    #[error("import step `{step}` failed: {reason}")]
    Step { step: &'static str, reason: String },
    #[error("import transaction timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("unexpected storage error: {0}")]
    Unexpected(String),
}

impl StorageError {
    /// Timeouts and serialization conflicts are worth re-queueing the range
    /// for; validation failures are not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageError::Timeout(_) | StorageError::Step { .. } | StorageError::Pool(_)
        )
    }
}
