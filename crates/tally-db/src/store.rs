use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags};
use tally_common::{Error, Result};
use tally_config::DatabaseConfig;
use tracing::info;

use crate::catalog::MigrationCatalog;
use crate::error::MigrationError;
use crate::runner::{MigrationReport, MigrationRunner, SchemaStatus};
use crate::version_store::{SchemaLedgerEntry, VersionStore};

/// Owns the connection to a migrated SQLite store.
///
/// Opening does not migrate; callers run [`Store::migrate`] at startup and
/// only hand the store to the rest of the application once it succeeds.
pub struct Store {
    conn: Mutex<Connection>,
    label: String,
}

impl Store {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        info!(
            "opening {} store at {}",
            config.label,
            config.path.display()
        );
        if let Some(dir) = config.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(&config.path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        conn.busy_timeout(config.busy_timeout())
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode={}; PRAGMA foreign_keys=ON;",
            config.journal_mode.as_pragma()
        ))
        .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            label: config.label.clone(),
        })
    }

    /// Open an existing store without creating, converting or writing
    /// anything. Migrating through a read-only store fails.
    pub fn open_read_only(config: &DatabaseConfig) -> Result<Self> {
        info!(
            "opening {} store at {} (read-only)",
            config.label,
            config.path.display()
        );
        let conn = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        conn.busy_timeout(config.busy_timeout())
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            label: config.label.clone(),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            label: "memory".to_string(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn connection(&self) -> std::result::Result<MutexGuard<'_, Connection>, MigrationError> {
        self.conn
            .lock()
            .map_err(|_| MigrationError::ConnectionPoisoned)
    }

    /// Apply every pending migration in `catalog`, labelling log lines with
    /// this store's name.
    pub fn migrate(
        &self,
        catalog: &MigrationCatalog,
        runner: &MigrationRunner,
    ) -> std::result::Result<MigrationReport, MigrationError> {
        let mut conn = self.connection()?;
        runner
            .clone()
            .with_label(self.label.clone())
            .run(catalog, &mut conn)
    }

    pub fn status(
        &self,
        catalog: &MigrationCatalog,
    ) -> std::result::Result<SchemaStatus, MigrationError> {
        let conn = self.connection()?;
        SchemaStatus::inspect(catalog, &conn)
    }

    pub fn current_version(&self) -> std::result::Result<u32, MigrationError> {
        let conn = self.connection()?;
        VersionStore::current_version(&conn)
    }

    pub fn entries(&self) -> std::result::Result<Vec<SchemaLedgerEntry>, MigrationError> {
        let conn = self.connection()?;
        VersionStore::entries(&conn)
    }

    /// Run queries against the store once it has been migrated.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Database(format!("{} store lock poisoned", self.label)))?;
        f(&conn).map_err(|e| Error::Database(e.to_string()))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("label", &self.label).finish()
    }
}

#[cfg(test)]
mod tests {
    use tally_config::JournalMode;

    use super::*;
    use crate::migrations::app_catalog;

    #[test]
    fn in_memory_store_migrates() {
        let store = Store::in_memory().unwrap();
        let catalog = app_catalog().unwrap();

        let report = store.migrate(&catalog, &MigrationRunner::new()).unwrap();
        assert_eq!(report.applied, vec![1]);
        assert_eq!(store.current_version().unwrap(), 1);

        let count: i64 = store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO transactions (type, description, amount) VALUES ('expense', 'coffee', 2500)",
                    [],
                )?;
                conn.query_row("SELECT count(*) FROM transactions", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn open_creates_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("app.db"),
            ..DatabaseConfig::default()
        };

        let store = Store::open(&config).unwrap();
        assert_eq!(store.label(), "app");
        assert!(config.path.exists());
        assert!(!store.with_connection(VersionStore::ledger_exists).unwrap());

        store
            .migrate(&app_catalog().unwrap(), &MigrationRunner::new())
            .unwrap();
        assert!(store.with_connection(VersionStore::ledger_exists).unwrap());
    }

    #[test]
    fn status_before_migrate_is_read_only() {
        let store = Store::in_memory().unwrap();
        let status = store.status(&app_catalog().unwrap()).unwrap();
        assert_eq!(status.current_version, 0);
        assert_eq!(status.pending, vec![1]);
        assert!(store.entries().is_err());
    }

    #[test]
    fn read_only_status_leaves_journal_mode_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("app.db"),
            journal_mode: JournalMode::Delete,
            ..DatabaseConfig::default()
        };
        Store::open(&config)
            .unwrap()
            .migrate(&app_catalog().unwrap(), &MigrationRunner::new())
            .unwrap();

        let store = Store::open_read_only(&config).unwrap();
        let status = store.status(&app_catalog().unwrap()).unwrap();
        assert_eq!(status.current_version, 1);
        assert!(status.is_up_to_date());
        drop(store);

        let conn = Connection::open(&config.path).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "delete");
    }

    #[test]
    fn read_only_open_does_not_create_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("missing").join("app.db"),
            ..DatabaseConfig::default()
        };

        assert!(Store::open_read_only(&config).is_err());
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn read_only_store_refuses_to_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("app.db"),
            ..DatabaseConfig::default()
        };
        drop(Store::open(&config).unwrap());

        let store = Store::open_read_only(&config).unwrap();
        let err = store
            .migrate(&app_catalog().unwrap(), &MigrationRunner::new())
            .unwrap_err();
        assert!(matches!(err, MigrationError::LedgerInit { .. }));
    }
}
