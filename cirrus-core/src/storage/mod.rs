//! Storage layer modules
//!
//! Every component shares one `redb` database. A `redb` write transaction is
//! exclusive, so each read-modify-write below runs as a single locked critical
//! section: no other writer can observe or change the rows in between.

pub mod database_transaction;

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use crate::error::{BincodeContext, CirrusResult, StorageContext};

pub use database_transaction::TransactionExecutor;

/// Network records keyed by network id
pub const NETWORK_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("networks");

/// Security-group work items keyed by work id
pub const SG_WORK_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("sg_work");

/// Per-VM ruleset log entries keyed by VM id
pub const VM_RULESET_LOG_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("vm_ruleset_log");

/// Named monotonic counters used for id allocation
pub const SEQUENCE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Counter name for work item ids
pub const WORK_ID_SEQUENCE: &str = "sg_work_id";

/// Create every table so read transactions never hit a missing table
pub fn init_database_tables(database: &Database) -> CirrusResult<()> {
    let write_txn = database.begin_write()?;

    let _ = write_txn.open_table(NETWORK_TABLE)?;
    let _ = write_txn.open_table(SG_WORK_TABLE)?;
    let _ = write_txn.open_table(VM_RULESET_LOG_TABLE)?;
    let _ = write_txn.open_table(SEQUENCE_TABLE)?;

    write_txn.commit()?;
    Ok(())
}

/// Open (or create) the database file and make sure all tables exist
pub fn open_database(path: &Path) -> CirrusResult<Arc<Database>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let database = Database::create(path).storage_context("open database")?;
    init_database_tables(&database)?;

    info!("Opened control-plane store at {}", path.display());
    Ok(Arc::new(database))
}

/// Allocate the next value of a named counter inside an open write transaction
pub fn next_sequence(txn: &redb::WriteTransaction, name: &str) -> CirrusResult<u64> {
    let mut table = txn.open_table(SEQUENCE_TABLE)?;
    let current = table.get(name)?.map(|v| v.value()).unwrap_or(0);
    let next = current + 1;
    table.insert(name, next)?;
    Ok(next)
}

pub(crate) fn encode<T: Serialize>(value: &T, what: &str) -> CirrusResult<Vec<u8>> {
    bincode::serialize(value).bincode_context(&format!("serialize {}", what))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> CirrusResult<T> {
    bincode::deserialize(bytes).bincode_context(&format!("deserialize {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_parent_directories_and_tables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cirrus.redb");

        let db = open_database(&path).unwrap();
        assert!(path.exists());

        let read_txn = db.begin_read().unwrap();
        assert!(read_txn.open_table(NETWORK_TABLE).is_ok());
        assert!(read_txn.open_table(SG_WORK_TABLE).is_ok());
        assert!(read_txn.open_table(VM_RULESET_LOG_TABLE).is_ok());
        assert!(read_txn.open_table(SEQUENCE_TABLE).is_ok());
    }

    #[test]
    fn sequences_are_monotonic_per_name() {
        let dir = TempDir::new().unwrap();
        let db = open_database(&dir.path().join("seq.redb")).unwrap();

        let txn = db.begin_write().unwrap();
        assert_eq!(next_sequence(&txn, "a").unwrap(), 1);
        assert_eq!(next_sequence(&txn, "a").unwrap(), 2);
        assert_eq!(next_sequence(&txn, "b").unwrap(), 1);
        txn.commit().unwrap();

        let txn = db.begin_write().unwrap();
        assert_eq!(next_sequence(&txn, "a").unwrap(), 3);
        txn.abort().unwrap();

        let txn = db.begin_write().unwrap();
        assert_eq!(next_sequence(&txn, "a").unwrap(), 3);
    }
}
