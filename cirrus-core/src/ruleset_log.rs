//! Per-VM ruleset sequence numbers
//!
//! Every logical change to a VM's rule set bumps its sequence exactly once.
//! A bump is an upsert (create with 1, otherwise increment) performed inside
//! an exclusive write transaction, so concurrent bumps for the same VM
//! serialize instead of losing increments.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RetrySettings;
use crate::error::{CirrusError, CirrusResult};
use crate::patterns::retry::RetryConfig;
use crate::storage::{decode, encode, TransactionExecutor, VM_RULESET_LOG_TABLE};
use crate::types::VmId;

/// Batch sizes, largest first, that a bump is split into
pub const BATCH_SIZES: [usize; 8] = [128, 64, 32, 16, 8, 4, 2, 1];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRulesetLogEntry {
    pub vm_id: VmId,
    pub sequence: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Split `len` items greedily into the fixed batch sizes
pub fn batch_plan(mut len: usize) -> Vec<usize> {
    let mut plan = Vec::new();
    while len > 0 {
        let size = BATCH_SIZES
            .iter()
            .copied()
            .find(|size| *size <= len)
            .unwrap_or(1);
        plan.push(size);
        len -= size;
    }
    plan
}

#[derive(Debug, Clone)]
pub struct VmRulesetLog {
    executor: TransactionExecutor,
    retry: RetrySettings,
}

impl VmRulesetLog {
    pub fn new(executor: TransactionExecutor, retry: RetrySettings) -> Self {
        Self { executor, retry }
    }

    pub fn entry(&self, vm: VmId) -> CirrusResult<Option<VmRulesetLogEntry>> {
        self.executor.read("read ruleset log", |txn| {
            let table = txn.open_table(VM_RULESET_LOG_TABLE)?;
            let value = table.get(vm.0)?;
            value
                .map(|v| decode(v.value(), "ruleset log entry"))
                .transpose()
        })
    }

    /// Current sequence for the VM; 0 when no change was ever recorded
    pub fn current_sequence(&self, vm: VmId) -> CirrusResult<u64> {
        Ok(self.entry(vm)?.map(|e| e.sequence).unwrap_or(0))
    }

    pub fn list(&self) -> CirrusResult<Vec<VmRulesetLogEntry>> {
        self.executor.read("list ruleset log", |txn| {
            let table = txn.open_table(VM_RULESET_LOG_TABLE)?;
            let mut entries = Vec::new();
            for item in table.iter()? {
                let (_, value) = item?;
                entries.push(decode(value.value(), "ruleset log entry")?);
            }
            Ok(entries)
        })
    }

    /// Increment the sequence of every VM in the set once
    ///
    /// Duplicate ids count once. Returns the sequence each VM holds after
    /// its increment. All batches run in one write transaction, so the call
    /// either bumps every VM or none; write contention is retried with the
    /// configured backoff.
    pub async fn bump_sequence(&self, vms: &[VmId]) -> CirrusResult<BTreeMap<VmId, u64>> {
        let unique = unique_vms(vms);
        let bumped = self
            .executor
            .write_with_retry(self.retry_config(), "bump ruleset sequence", |txn| {
                bump_in_txn(txn, &unique)
            })
            .await?;

        debug!("Bumped ruleset sequence for {} VMs", bumped.len());
        Ok(bumped)
    }

    pub(crate) fn retry_config(&self) -> RetryConfig {
        RetryConfig::from_settings(&self.retry).with_operation_name("bump_sequence")
    }

    /// Drop the VM's entry once the VM is gone
    pub fn remove_vm(&self, vm: VmId) -> CirrusResult<bool> {
        let removed = self.executor.write("remove ruleset log entry", |txn| {
            let mut table = txn.open_table(VM_RULESET_LOG_TABLE)?;
            let removed = table.remove(vm.0)?.is_some();
            Ok(removed)
        })?;
        if removed {
            info!("Removed ruleset log for {}", vm);
        }
        Ok(removed)
    }
}

pub(crate) fn unique_vms(vms: &[VmId]) -> Vec<VmId> {
    vms.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Upsert every VM batch by batch inside the caller's transaction
pub(crate) fn bump_in_txn(
    txn: &redb::WriteTransaction,
    unique: &[VmId],
) -> CirrusResult<BTreeMap<VmId, u64>> {
    let mut bumped = BTreeMap::new();
    let mut offset = 0;
    for size in batch_plan(unique.len()) {
        let batch = &unique[offset..offset + size];
        offset += size;

        crate::fail_point!(
            crate::failpoints::names::RULESET_BUMP,
            CirrusError::StorageContention {
                operation: "bump_sequence".to_string(),
            }
        );
        bumped.extend(upsert_batch(txn, batch)?);
    }
    Ok(bumped)
}

fn upsert_batch(txn: &redb::WriteTransaction, batch: &[VmId]) -> CirrusResult<Vec<(VmId, u64)>> {
    let mut table = txn.open_table(VM_RULESET_LOG_TABLE)?;
    let now = Utc::now();
    let mut results = Vec::with_capacity(batch.len());

    for vm in batch {
        let existing: Option<VmRulesetLogEntry> = {
            let value = table.get(vm.0)?;
            value
                .map(|v| decode(v.value(), "ruleset log entry"))
                .transpose()?
        };

        let entry = match existing {
            Some(mut entry) => {
                entry.sequence += 1;
                entry.updated = now;
                entry
            }
            None => VmRulesetLogEntry {
                vm_id: *vm,
                sequence: 1,
                created: now,
                updated: now,
            },
        };

        let bytes = encode(&entry, "ruleset log entry")?;
        table.insert(vm.0, bytes.as_slice())?;
        results.push((*vm, entry.sequence));
    }

    Ok(results)
}
