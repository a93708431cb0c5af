use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{Migration, MigrationCatalog};
use crate::error::MigrationError;
use crate::version_store::{SchemaLedgerEntry, VersionStore};

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub ledger_created: bool,
    pub starting_version: u32,
    /// Versions committed by this run, in the order they were applied.
    pub applied: Vec<u32>,
    pub current_version: u32,
}

/// Read-only view of a store's schema relative to a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaStatus {
    pub current_version: u32,
    pub entries: Vec<SchemaLedgerEntry>,
    pub pending: Vec<u32>,
    /// Ledger versions the catalog does not know about.
    pub unknown: Vec<u32>,
    /// Catalog versions below the current version with no ledger row.
    /// These will never run.
    pub skipped: Vec<u32>,
}

impl SchemaStatus {
    /// Inspect `conn` without creating or modifying anything.
    pub fn inspect(catalog: &MigrationCatalog, conn: &Connection) -> Result<Self, MigrationError> {
        let exists = VersionStore::ledger_exists(conn)
            .map_err(|source| MigrationError::VersionRead { source })?;
        let entries = if exists {
            VersionStore::entries(conn)?
        } else {
            Vec::new()
        };

        let current_version = entries.iter().map(|e| e.version).max().unwrap_or(0);
        let applied: Vec<u32> = entries.iter().map(|e| e.version).collect();
        let (unknown, skipped) = drift(catalog, &applied, current_version);
        let pending = catalog
            .pending(current_version)
            .map(Migration::version)
            .collect();

        Ok(Self {
            current_version,
            entries,
            pending,
            unknown,
            skipped,
        })
    }

    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

fn drift(catalog: &MigrationCatalog, applied: &[u32], current: u32) -> (Vec<u32>, Vec<u32>) {
    let unknown = applied
        .iter()
        .copied()
        .filter(|v| !catalog.contains(*v))
        .collect();
    let skipped = catalog
        .ordered()
        .map(Migration::version)
        .take_while(|v| *v < current)
        .filter(|v| applied.binary_search(v).is_err())
        .collect();
    (unknown, skipped)
}

/// Applies pending migrations from a catalog, one transaction per migration.
///
/// Runs synchronously and stops at the first failure. A failed version stays
/// pending, so the next run retries from it.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    label: String,
    deadline: Option<Duration>,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self {
            label: "store".to_string(),
            deadline: None,
        }
    }
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the store, used in log lines.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Bound the whole run. On expiry the running statement is interrupted,
    /// its transaction rolls back and the run fails with `Timeout`.
    pub fn with_deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(limit);
        self
    }

    pub fn run(
        &self,
        catalog: &MigrationCatalog,
        conn: &mut Connection,
    ) -> Result<MigrationReport, MigrationError> {
        let watchdog = self.deadline.map(|limit| Watchdog::arm(conn, limit));
        let result = self.apply_pending(catalog, conn, watchdog.as_ref());

        match (result, watchdog) {
            (Err(err), Some(watchdog)) if watchdog.fired() => match into_interrupted(err) {
                Ok((version, source)) => {
                    warn!(
                        "migration of {} interrupted after {:?}: {source}",
                        self.label, watchdog.limit
                    );
                    Err(MigrationError::Timeout {
                        version,
                        limit: watchdog.limit,
                        source: Some(source),
                    })
                }
                Err(err) => Err(err),
            },
            (result, _) => result,
        }
    }

    fn apply_pending(
        &self,
        catalog: &MigrationCatalog,
        conn: &mut Connection,
        watchdog: Option<&Watchdog>,
    ) -> Result<MigrationReport, MigrationError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|source| MigrationError::ForeignKeys { source })?;

        let ledger_created = VersionStore::ensure_ledger(conn)?;
        let starting_version = VersionStore::current_version(conn)?;
        self.warn_on_drift(catalog, conn, starting_version)?;

        let mut applied = Vec::new();
        for migration in catalog.pending(starting_version) {
            if let Some(watchdog) = watchdog.filter(|w| w.expired()) {
                return Err(MigrationError::Timeout {
                    version: Some(migration.version()),
                    limit: watchdog.limit,
                    source: None,
                });
            }
            self.apply_one(migration, conn)?;
            applied.push(migration.version());
        }

        let current_version = applied.last().copied().unwrap_or(starting_version);
        if applied.is_empty() {
            debug!("{} schema is up to date at version {current_version}", self.label);
        } else {
            info!(
                "{} schema migrated from version {starting_version} to {current_version}",
                self.label
            );
        }

        Ok(MigrationReport {
            ledger_created,
            starting_version,
            applied,
            current_version,
        })
    }

    fn apply_one(&self, migration: &Migration, conn: &mut Connection) -> Result<(), MigrationError> {
        let version = migration.version();
        info!(
            "applying migration {version} ({}) for {}",
            migration.name(),
            self.label
        );
        let started = Instant::now();

        // Write lock up front; a racing runner waits on the busy timeout.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| MigrationError::Begin { version, source })?;

        if let Err(source) = migration.apply(&tx) {
            rollback(tx, version);
            return Err(MigrationError::MigrationExecution { version, source });
        }

        if let Err(err) = VersionStore::record_applied(&tx, version) {
            rollback(tx, version);
            return Err(err);
        }

        tx.commit()
            .map_err(|source| MigrationError::Commit { version, source })?;

        info!(
            "successfully applied migration {version} in {:?}",
            started.elapsed()
        );
        Ok(())
    }

    fn warn_on_drift(
        &self,
        catalog: &MigrationCatalog,
        conn: &Connection,
        current: u32,
    ) -> Result<(), MigrationError> {
        let applied = VersionStore::applied_versions(conn)?;
        let (unknown, skipped) = drift(catalog, &applied, current);
        if !unknown.is_empty() {
            warn!(
                "{} ledger has versions {unknown:?} unknown to this build (latest known is {})",
                self.label,
                catalog.latest_version()
            );
        }
        if !skipped.is_empty() {
            warn!(
                "{} migrations {skipped:?} are below current version {current} and will not run",
                self.label
            );
        }
        Ok(())
    }
}

fn is_interrupted(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted
    )
}

/// Split out the SQLite error of a statement the watchdog interrupted.
/// Any other failure is handed back untouched.
fn into_interrupted(
    err: MigrationError,
) -> Result<(Option<u32>, rusqlite::Error), MigrationError> {
    match err {
        MigrationError::MigrationExecution { version, source } => {
            match source.downcast::<rusqlite::Error>() {
                Ok(sql) if is_interrupted(&sql) => Ok((Some(version), *sql)),
                Ok(sql) => Err(MigrationError::MigrationExecution {
                    version,
                    source: sql,
                }),
                Err(source) => Err(MigrationError::MigrationExecution { version, source }),
            }
        }
        MigrationError::Begin { version, source }
        | MigrationError::LedgerWrite { version, source }
        | MigrationError::Commit { version, source }
            if is_interrupted(&source) =>
        {
            Ok((Some(version), source))
        }
        MigrationError::ForeignKeys { source }
        | MigrationError::LedgerInit { source }
        | MigrationError::VersionRead { source }
            if is_interrupted(&source) =>
        {
            Ok((None, source))
        }
        other => Err(other),
    }
}

fn rollback(tx: Transaction<'_>, version: u32) {
    if let Err(e) = tx.rollback() {
        warn!("rollback of migration {version} failed: {e}");
    }
}

/// Interrupts the connection once the deadline passes.
struct Watchdog {
    limit: Duration,
    deadline: Instant,
    fired: Arc<AtomicBool>,
    disarm: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn arm(conn: &Connection, limit: Duration) -> Self {
        let interrupt = conn.get_interrupt_handle();
        let fired = Arc::new(AtomicBool::new(false));
        let (disarm, rx) = mpsc::channel::<()>();

        let flag = Arc::clone(&fired);
        let handle = std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(limit) {
                flag.store(true, Ordering::SeqCst);
                interrupt.interrupt();
            }
        });

        Self {
            limit,
            deadline: Instant::now() + limit,
            fired,
            disarm: Some(disarm),
            handle: Some(handle),
        }
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn expired(&self) -> bool {
        self.fired() || Instant::now() >= self.deadline
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Closing the channel wakes the thread with `Disconnected`.
        drop(self.disarm.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
