//! The production catalog for the finance store.
//!
//! Append only: once a version has shipped it is never edited, renumbered or
//! removed, otherwise stores created by older builds cannot be replayed.

use crate::catalog::{Migration, MigrationCatalog};
use crate::error::MigrationError;

pub const TRANSACTIONS_V1_SQL: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL CHECK(type IN ('income', 'expense')),
    description TEXT NOT NULL,
    amount INTEGER NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";

pub fn app_catalog() -> Result<MigrationCatalog, MigrationError> {
    MigrationCatalog::from_migrations([Migration::sql(1, "transactions_v1", TRANSACTIONS_V1_SQL)])
}
