use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, params};
use serde::Serialize;
use tracing::info;

use crate::error::MigrationError;

/// Name of the ledger table. Other tooling may inspect it, so it is fixed.
pub const LEDGER_TABLE: &str = "schema_migrations";

const CREATE_LEDGER_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

const LEDGER_COLUMNS: [&str; 2] = ["version", "applied_at"];

/// A ledger row proving a migration was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaLedgerEntry {
    pub version: u32,
    pub applied_at: DateTime<Utc>,
}

/// Reads and writes the `schema_migrations` ledger.
pub struct VersionStore;

impl VersionStore {
    /// Create the ledger if it is missing. Returns `true` when it was created.
    pub fn ensure_ledger(conn: &Connection) -> Result<bool, MigrationError> {
        if Self::ledger_exists(conn).map_err(|source| MigrationError::LedgerInit { source })? {
            Self::verify_shape(conn)?;
            return Ok(false);
        }

        conn.execute_batch(CREATE_LEDGER_SQL)
            .map_err(|source| MigrationError::LedgerInit { source })?;
        info!("created {LEDGER_TABLE} table");
        Ok(true)
    }

    pub fn ledger_exists(conn: &Connection) -> rusqlite::Result<bool> {
        conn.query_row(
            "SELECT count(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            params![LEDGER_TABLE],
            |row| row.get(0),
        )
    }

    fn verify_shape(conn: &Connection) -> Result<(), MigrationError> {
        let mut stmt = conn
            .prepare("SELECT name FROM pragma_table_info(?1)")
            .map_err(|source| MigrationError::LedgerInit { source })?;
        let columns = stmt
            .query_map(params![LEDGER_TABLE], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|source| MigrationError::LedgerInit { source })?;

        match LEDGER_COLUMNS
            .iter()
            .find(|expected| !columns.iter().any(|c| c.eq_ignore_ascii_case(expected)))
        {
            Some(missing) => Err(MigrationError::LedgerShape {
                column: missing.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Highest applied version, or 0 when the ledger is empty.
    pub fn current_version(conn: &Connection) -> Result<u32, MigrationError> {
        let version = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get::<_, u32>(0),
        );
        match version {
            Ok(version) => Ok(version),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(source) => Err(MigrationError::VersionRead { source }),
        }
    }

    /// Insert the ledger row for `version` inside the migration's own
    /// transaction, so it lands or vanishes together with the schema change.
    pub fn record_applied(tx: &Transaction<'_>, version: u32) -> Result<(), MigrationError> {
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            params![version],
        )
        .map_err(|source| MigrationError::LedgerWrite { version, source })?;
        Ok(())
    }

    /// All applied versions, ascending.
    pub fn applied_versions(conn: &Connection) -> Result<Vec<u32>, MigrationError> {
        let mut stmt = conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version")
            .map_err(|source| MigrationError::VersionRead { source })?;
        stmt.query_map([], |row| row.get::<_, u32>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|source| MigrationError::VersionRead { source })
    }

    pub fn entries(conn: &Connection) -> Result<Vec<SchemaLedgerEntry>, MigrationError> {
        let mut stmt = conn
            .prepare("SELECT version, applied_at FROM schema_migrations ORDER BY version")
            .map_err(|source| MigrationError::VersionRead { source })?;
        stmt.query_map([], |row| {
            Ok(SchemaLedgerEntry {
                version: row.get(0)?,
                applied_at: row.get(1)?,
            })
        })
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|source| MigrationError::VersionRead { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        VersionStore::ensure_ledger(&conn).unwrap();
        conn
    }

    fn record(conn: &mut Connection, version: u32) -> Result<(), MigrationError> {
        let tx = conn.transaction().unwrap();
        VersionStore::record_applied(&tx, version)?;
        tx.commit().unwrap();
        Ok(())
    }

    #[test]
    fn ensure_ledger_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(VersionStore::ensure_ledger(&conn).unwrap());
        assert!(!VersionStore::ensure_ledger(&conn).unwrap());
        assert!(VersionStore::ledger_exists(&conn).unwrap());
    }

    #[test]
    fn empty_ledger_reports_zero() {
        let conn = ledger_conn();
        assert_eq!(VersionStore::current_version(&conn).unwrap(), 0);
        assert!(VersionStore::applied_versions(&conn).unwrap().is_empty());
    }

    #[test]
    fn current_version_is_the_maximum() {
        let mut conn = ledger_conn();
        record(&mut conn, 2).unwrap();
        record(&mut conn, 1).unwrap();
        record(&mut conn, 5).unwrap();

        assert_eq!(VersionStore::current_version(&conn).unwrap(), 5);
        assert_eq!(VersionStore::applied_versions(&conn).unwrap(), vec![1, 2, 5]);
    }

    #[test]
    fn recording_a_version_twice_fails() {
        let mut conn = ledger_conn();
        record(&mut conn, 1).unwrap();

        let err = record(&mut conn, 1).unwrap_err();
        assert!(matches!(err, MigrationError::LedgerWrite { version: 1, .. }));
    }

    #[test]
    fn uncommitted_record_is_not_visible() {
        let mut conn = ledger_conn();
        {
            let tx = conn.transaction().unwrap();
            VersionStore::record_applied(&tx, 1).unwrap();
            tx.rollback().unwrap();
        }
        assert_eq!(VersionStore::current_version(&conn).unwrap(), 0);
    }

    #[test]
    fn missing_ledger_is_a_read_error() {
        let conn = Connection::open_in_memory().unwrap();
        let err = VersionStore::current_version(&conn).unwrap_err();
        assert!(matches!(err, MigrationError::VersionRead { .. }));
    }

    #[test]
    fn ledger_with_wrong_shape_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY)")
            .unwrap();

        let err = VersionStore::ensure_ledger(&conn).unwrap_err();
        assert!(matches!(err, MigrationError::LedgerShape { ref column } if column == "applied_at"));
    }

    #[test]
    fn entries_carry_commit_timestamps() {
        let mut conn = ledger_conn();
        let before = Utc::now() - chrono::Duration::seconds(5);
        record(&mut conn, 1).unwrap();
        record(&mut conn, 2).unwrap();

        let entries = VersionStore::entries(&conn).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].version, 1);
        assert_eq!(entries[1].version, 2);
        assert!(entries[0].applied_at >= before);
    }

    #[test]
    fn entries_read_stored_timestamps() {
        let conn = ledger_conn();
        conn.execute_batch(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (1, '2020-01-01T00:00:00');
             INSERT INTO schema_migrations (version, applied_at) VALUES (2, '2024-03-01 12:30:00');",
        )
        .unwrap();

        let entries = VersionStore::entries(&conn).unwrap();
        assert_eq!(entries[0].applied_at.to_rfc3339(), "2020-01-01T00:00:00+00:00");
        assert_eq!(entries[1].applied_at.to_rfc3339(), "2024-03-01T12:30:00+00:00");
    }

    #[test]
    fn unreadable_timestamp_is_a_read_error() {
        let conn = ledger_conn();
        conn.execute_batch(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (1, 'last tuesday')",
        )
        .unwrap();

        let err = VersionStore::entries(&conn).unwrap_err();
        assert!(matches!(err, MigrationError::VersionRead { .. }));
        assert_eq!(VersionStore::current_version(&conn).unwrap(), 1);
    }
}
