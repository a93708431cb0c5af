use std::collections::BTreeMap;
use std::fmt;

use rusqlite::Transaction;

use crate::error::{BoxError, MigrationError};

type Action = Box<dyn Fn(&Transaction<'_>) -> Result<(), BoxError> + Send + Sync>;

/// One versioned unit of schema change.
///
/// The action runs inside the transaction that also records the version in
/// the ledger, so it must not commit or roll back on its own.
pub struct Migration {
    version: u32,
    name: String,
    action: Action,
}

impl Migration {
    pub fn new<F>(version: u32, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&Transaction<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            version,
            name: name.into(),
            action: Box::new(action),
        }
    }

    /// A migration whose action is a batch of SQL statements.
    pub fn sql(version: u32, name: impl Into<String>, sql: &'static str) -> Self {
        Self::new(version, name, move |tx| {
            tx.execute_batch(sql)?;
            Ok(())
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn apply(&self, tx: &Transaction<'_>) -> Result<(), BoxError> {
        (self.action)(tx)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The complete set of known migrations, keyed by version.
///
/// Built once at startup and passed to the runner; performs no I/O.
#[derive(Debug, Default)]
pub struct MigrationCatalog {
    migrations: BTreeMap<u32, Migration>,
}

impl MigrationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a list, rejecting duplicate or zero versions.
    pub fn from_migrations(
        migrations: impl IntoIterator<Item = Migration>,
    ) -> Result<Self, MigrationError> {
        let mut catalog = Self::new();
        for migration in migrations {
            catalog.insert(migration)?;
        }
        Ok(catalog)
    }

    pub fn register<F>(
        &mut self,
        version: u32,
        name: impl Into<String>,
        action: F,
    ) -> Result<&mut Self, MigrationError>
    where
        F: Fn(&Transaction<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.insert(Migration::new(version, name, action))
    }

    pub fn register_sql(
        &mut self,
        version: u32,
        name: impl Into<String>,
        sql: &'static str,
    ) -> Result<&mut Self, MigrationError> {
        self.insert(Migration::sql(version, name, sql))
    }

    pub fn insert(&mut self, migration: Migration) -> Result<&mut Self, MigrationError> {
        let version = migration.version;
        // 0 is what an empty ledger reports, so it can never be pending.
        if version == 0 {
            return Err(MigrationError::InvalidVersion { version });
        }
        if self.migrations.contains_key(&version) {
            return Err(MigrationError::DuplicateVersion { version });
        }
        self.migrations.insert(version, migration);
        Ok(self)
    }

    /// All migrations in ascending version order. Can be called repeatedly.
    pub fn ordered(&self) -> impl Iterator<Item = &Migration> + '_ {
        self.migrations.values()
    }

    /// Migrations with a version strictly above `current`, ascending.
    pub fn pending(&self, current: u32) -> impl Iterator<Item = &Migration> + '_ {
        self.migrations
            .range((std::ops::Bound::Excluded(current), std::ops::Bound::Unbounded))
            .map(|(_, m)| m)
    }

    pub fn get(&self, version: u32) -> Option<&Migration> {
        self.migrations.get(&version)
    }

    pub fn contains(&self, version: u32) -> bool {
        self.migrations.contains_key(&version)
    }

    /// Highest registered version, or 0 for an empty catalog.
    pub fn latest_version(&self) -> u32 {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
