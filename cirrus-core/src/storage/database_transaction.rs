//! Transaction executor for consistent transaction management
//!
//! Every locked critical section in the crate goes through
//! [`TransactionExecutor::write`]: the closure runs inside one exclusive
//! `redb` write transaction and its effects become visible only when it
//! returns `Ok`. An `Err` drops the transaction, discarding every change.

use std::sync::Arc;

use redb::{Database, ReadTransaction, WriteTransaction};
use tracing::debug;

use crate::error::{CirrusResult, StorageContext};
use crate::patterns::retry::{retry, RetryConfig};

/// Runs closures inside read or write transactions of a shared database
#[derive(Clone, Debug)]
pub struct TransactionExecutor {
    database: Arc<Database>,
}

impl TransactionExecutor {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Execute a read operation against a consistent snapshot
    pub fn read<F, R>(&self, operation: &str, f: F) -> CirrusResult<R>
    where
        F: FnOnce(&ReadTransaction) -> CirrusResult<R>,
    {
        let txn = self
            .database
            .begin_read()
            .storage_context(&format!("begin read transaction for {}", operation))?;
        f(&txn)
    }

    /// Execute a write operation; commits only if the closure succeeds
    pub fn write<F, R>(&self, operation: &str, f: F) -> CirrusResult<R>
    where
        F: FnOnce(&WriteTransaction) -> CirrusResult<R>,
    {
        let txn = self
            .database
            .begin_write()
            .storage_context(&format!("begin write transaction for {}", operation))?;

        let result = f(&txn)?;

        txn.commit()
            .storage_context(&format!("commit transaction for {}", operation))?;
        debug!("Committed transaction for: {}", operation);
        Ok(result)
    }

    /// Execute a write operation, re-running it while it fails transiently
    pub async fn write_with_retry<F, R>(
        &self,
        config: RetryConfig,
        operation: &str,
        f: F,
    ) -> CirrusResult<R>
    where
        F: Fn(&WriteTransaction) -> CirrusResult<R> + Send + Sync,
        R: Send + 'static,
    {
        retry(config, || {
            let result = self.write(operation, &f);
            Box::pin(async move { result })
        })
        .await
    }
}
