use std::time::Duration;

use thiserror::Error;

/// Error type returned by migration actions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Every way building a catalog or running it against a store can fail.
///
/// Variants tied to a single migration carry its version so callers can
/// branch on it without parsing messages.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("migration version {version} is already registered")]
    DuplicateVersion { version: u32 },

    #[error("migration version must be positive, got {version}")]
    InvalidVersion { version: u32 },

    #[error("failed to enable foreign keys: {source}")]
    ForeignKeys {
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create migrations table: {source}")]
    LedgerInit {
        #[source]
        source: rusqlite::Error,
    },

    #[error("migrations table is missing column `{column}`")]
    LedgerShape { column: String },

    #[error("failed to get current migration version: {source}")]
    VersionRead {
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to begin transaction for migration {version}: {source}")]
    Begin {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration {version} failed: {source}")]
    MigrationExecution {
        version: u32,
        #[source]
        source: BoxError,
    },

    #[error("failed to record migration {version}: {source}")]
    LedgerWrite {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to commit migration {version}: {source}")]
    Commit {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration run exceeded its {limit:?} deadline{}", .version.map(|v| format!(" at version {v}")).unwrap_or_default())]
    Timeout {
        version: Option<u32>,
        limit: Duration,
        /// The statement SQLite interrupted, when the deadline hit mid-query.
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("store connection lock poisoned")]
    ConnectionPoisoned,
}

impl MigrationError {
    /// The migration version the failure is attributed to, if any.
    pub fn version(&self) -> Option<u32> {
        match self {
            MigrationError::DuplicateVersion { version }
            | MigrationError::InvalidVersion { version }
            | MigrationError::Begin { version, .. }
            | MigrationError::MigrationExecution { version, .. }
            | MigrationError::LedgerWrite { version, .. }
            | MigrationError::Commit { version, .. } => Some(*version),
            MigrationError::Timeout { version, .. } => *version,
            MigrationError::ForeignKeys { .. }
            | MigrationError::LedgerInit { .. }
            | MigrationError::LedgerShape { .. }
            | MigrationError::VersionRead { .. }
            | MigrationError::ConnectionPoisoned => None,
        }
    }
}
