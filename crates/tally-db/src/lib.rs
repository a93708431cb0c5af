pub mod catalog;
pub mod error;
pub mod migrations;
pub mod runner;
pub mod store;
pub mod version_store;

pub use catalog::{Migration, MigrationCatalog};
pub use error::{BoxError, MigrationError};
pub use migrations::app_catalog;
pub use runner::{MigrationReport, MigrationRunner, SchemaStatus};
pub use store::Store;
pub use version_store::{LEDGER_TABLE, SchemaLedgerEntry, VersionStore};
