//! Migration-specific error types.

use thiserror::Error;

use super::validator::Discrepancy;
use crate::backend::{BackendError, ErrorClass};
use crate::version::ParseVersionError;

/// State the target database was left in by a failed migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseState {
    /// The failed unit ran in a transaction that was rolled back. The schema is consistent.
    RolledBack,
    /// Some statements of the failed unit took effect. Repair is required before retrying.
    PartiallyApplied,
}

impl std::fmt::Display for DatabaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseState::RolledBack => write!(f, "rolled back"),
            DatabaseState::PartiallyApplied => write!(f, "partially applied"),
        }
    }
}

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Two descriptors share one identity.
    #[error("found more than one migration with {identity}: {first} and {second}")]
    DuplicateMigration {
        /// The shared identity.
        identity: String,
        /// Script of the first descriptor.
        first: String,
        /// Script of the second descriptor.
        second: String,
    },

    /// A version string could not be parsed.
    #[error(transparent)]
    InvalidVersion(#[from] ParseVersionError),

    /// A script name does not follow the naming convention.
    #[error("invalid migration script name {name:?}: {reason}")]
    InvalidScriptName {
        /// The offending name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A backend operation outside any migration unit failed.
    #[error("backend error: {source}")]
    Backend {
        /// The backend error.
        source: BackendError,
        /// How the backend classified it.
        class: ErrorClass,
    },

    /// A transient failure persisted through every retry.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The final failure.
        last: Box<MigrationError>,
    },

    /// The ledger lock could not be acquired in time.
    #[error("timed out after {waited_ms} ms waiting for the schema history lock")]
    LockTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The migration unit itself failed.
    #[error("migration {identity} failed ({state}): {cause}")]
    MigrationFailed {
        /// Identity of the failed migration.
        identity: String,
        /// The underlying backend error.
        cause: BackendError,
        /// Whether the database was left consistent.
        state: DatabaseState,
    },

    /// The ledger records a failed migration, so nothing more may be applied.
    #[error("schema history contains a failed migration {identity}; run repair before migrating")]
    FailedMigrationPresent {
        /// Identity of the failed migration.
        identity: String,
    },

    /// Validation found drift between the ledger and the resolved migrations.
    #[error("validation failed with {} discrepancies: {}", .0.len(), join_discrepancies(.0))]
    Validation(Vec<Discrepancy>),

    /// Baseline cannot be applied to this ledger.
    #[error("baseline rejected: {0}")]
    BaselineConflict(String),

    /// Storage-layer failure in the history store.
    #[error("storage error: {0}")]
    Storage(crate::error::Error),
}

fn join_discrepancies(discrepancies: &[Discrepancy]) -> String {
    discrepancies
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl MigrationError {
    /// Wrap a backend error with its classification.
    pub fn backend(source: BackendError, class: ErrorClass) -> Self {
        MigrationError::Backend { source, class }
    }

    /// Whether retrying the failed unit of work may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrationError::LockTimeout { .. } => true,
            MigrationError::Backend { class, .. } => *class == ErrorClass::Transient,
            _ => false,
        }
    }

    /// Whether this is a configuration problem detected before touching the ledger.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MigrationError::DuplicateMigration { .. }
                | MigrationError::InvalidVersion(_)
                | MigrationError::InvalidScriptName { .. }
        )
    }
}

impl From<crate::error::Error> for MigrationError {
    fn from(error: crate::error::Error) -> Self {
        match error {
            crate::error::Error::LockTimeout { waited_ms } => MigrationError::LockTimeout { waited_ms },
            other => MigrationError::Storage(other),
        }
    }
}

/// Result alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;
