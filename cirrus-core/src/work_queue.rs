//! Durable queue of security-group synchronization jobs
//!
//! One [`SecurityGroupWork`] item asks a worker to bring one VM's agent up
//! to date. Items move `Scheduled -> Processing -> Done | Error`. Claiming
//! is a single write transaction, so two workers can never claim the same
//! item, and at most one item per VM is `Processing` at any time.
//!
//! A worker that dies leaves its item in `Processing`. Nothing reclaims it
//! in-band; the timeout sweep moves it to `Error` so a new item can be
//! scheduled. Delivery is therefore at-least-once and relies on the
//! convergence check to make repeats harmless.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RetrySettings;
use crate::error::{CirrusError, CirrusResult};
use crate::patterns::retry::RetryConfig;
use crate::ruleset_log::VmRulesetLogEntry;
use crate::storage::{
    decode, encode, next_sequence, TransactionExecutor, SG_WORK_TABLE, VM_RULESET_LOG_TABLE,
    WORK_ID_SEQUENCE,
};
use crate::types::{VmId, WorkId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Scheduled,
    Processing,
    Done,
    Error,
}

impl Step {
    pub fn is_terminal(self) -> bool {
        matches!(self, Step::Done | Step::Error)
    }

    /// Whether an item in this step may be moved to `next`
    pub fn can_advance_to(self, next: Step) -> bool {
        matches!(
            (self, next),
            (Step::Scheduled, Step::Processing)
                | (Step::Processing, Step::Done)
                | (Step::Processing, Step::Error)
        )
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupWork {
    pub id: WorkId,
    pub vm_id: VmId,
    /// Worker that claimed the item
    pub server_id: Option<WorkerId>,
    pub step: Step,
    pub created: DateTime<Utc>,
    pub taken: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Ruleset sequence of the VM when the item was claimed
    pub log_sequence: Option<u64>,
}

/// Result of a successful claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TakenWork {
    /// The caller owns the item, now `Processing`
    Claimed(SecurityGroupWork),
    /// Another item for the same VM is already `Processing`; this one was
    /// closed as `Done` and the caller must not program the VM
    Superseded(SecurityGroupWork),
}

impl TakenWork {
    pub fn work(&self) -> &SecurityGroupWork {
        match self {
            TakenWork::Claimed(work) | TakenWork::Superseded(work) => work,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityGroupWorkQueue {
    executor: TransactionExecutor,
    retry: RetrySettings,
}

impl SecurityGroupWorkQueue {
    pub fn new(executor: TransactionExecutor, retry: RetrySettings) -> Self {
        Self { executor, retry }
    }

    pub(crate) fn executor(&self) -> &TransactionExecutor {
        &self.executor
    }

    /// Queue a job for the VM unless an unclaimed one is already waiting
    ///
    /// Returns the waiting item, new or existing.
    pub fn schedule(&self, vm: VmId) -> CirrusResult<SecurityGroupWork> {
        self.executor
            .write("schedule security group work", |txn| schedule_in_txn(txn, vm))
    }

    /// Claim the oldest scheduled item
    ///
    /// Selection, the same-VM check and the claim happen in one write
    /// transaction. Transient contention is retried with the configured
    /// backoff.
    pub async fn take(&self, worker: &WorkerId) -> CirrusResult<Option<TakenWork>> {
        let config = RetryConfig::from_settings(&self.retry).with_operation_name("take");

        let taken = self
            .executor
            .write_with_retry(config, "take security group work", |txn| {
                crate::fail_point!(
                    crate::failpoints::names::WORK_TAKE,
                    CirrusError::StorageContention {
                        operation: "take".to_string(),
                    }
                );
                claim_oldest(txn, worker)
            })
            .await?;

        match &taken {
            Some(TakenWork::Claimed(work)) => {
                debug!("{} claimed {} for {}", worker, work.id, work.vm_id)
            }
            Some(TakenWork::Superseded(work)) => info!(
                "{} for {} superseded by an item already in progress",
                work.id, work.vm_id
            ),
            None => {}
        }
        Ok(taken)
    }

    /// Move an item to `step`
    pub fn update_step(&self, id: WorkId, step: Step) -> CirrusResult<SecurityGroupWork> {
        self.executor.write("update work step", |txn| {
            let work = load(txn, id)?.ok_or_else(|| CirrusError::NotFound {
                resource: format!("work item {}", id),
            })?;
            advance(txn, work, step)
        })
    }

    /// Move the VM's in-progress item claimed at `sequence` to `step`
    pub fn update_step_for_vm(
        &self,
        vm: VmId,
        sequence: u64,
        step: Step,
    ) -> CirrusResult<SecurityGroupWork> {
        self.executor.write("update work step for vm", |txn| {
            let work = scan(txn, |w| {
                w.vm_id == vm && w.step == Step::Processing && w.log_sequence == Some(sequence)
            })?
            .into_iter()
            .next()
            .ok_or_else(|| CirrusError::NotFound {
                resource: format!("in-progress work for {} at sequence {}", vm, sequence),
            })?;
            advance(txn, work, step)
        })
    }

    /// Items stuck in `Processing` since before `cutoff`
    pub fn find_unfinished_work(&self, cutoff: DateTime<Utc>) -> CirrusResult<Vec<SecurityGroupWork>> {
        self.executor.read("find unfinished work", |txn| {
            let table = txn.open_table(SG_WORK_TABLE)?;
            let mut stuck = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let work: SecurityGroupWork = decode(value.value(), "work item")?;
                if is_abandoned(&work, cutoff) {
                    stuck.push(work);
                }
            }
            Ok(stuck)
        })
    }

    /// Move items stuck in `Processing` since before `cutoff` to `Error`
    ///
    /// Returns the items as they were before the change.
    pub fn find_and_cleanup_unfinished_work(
        &self,
        cutoff: DateTime<Utc>,
    ) -> CirrusResult<Vec<SecurityGroupWork>> {
        let stuck = self.executor.write("cleanup unfinished work", |txn| {
            let stuck = scan(txn, |w| is_abandoned(w, cutoff))?;
            for work in &stuck {
                advance(txn, work.clone(), Step::Error)?;
            }
            Ok(stuck)
        })?;

        for work in &stuck {
            warn!(
                "Abandoned {} for {} claimed by {:?} at {:?}",
                work.id, work.vm_id, work.server_id, work.taken
            );
        }
        Ok(stuck)
    }

    /// Delete `Done`/`Error` items that finished before `cutoff`
    pub fn delete_finished_work(&self, cutoff: DateTime<Utc>) -> CirrusResult<usize> {
        let deleted = self.executor.write("delete finished work", |txn| {
            let finished = scan(txn, |w| {
                w.step.is_terminal() && w.finished.unwrap_or(w.created) < cutoff
            })?;
            let mut table = txn.open_table(SG_WORK_TABLE)?;
            for work in &finished {
                table.remove(work.id.0)?;
            }
            Ok(finished.len())
        })?;

        if deleted > 0 {
            debug!("Deleted {} finished work items", deleted);
        }
        Ok(deleted)
    }

    pub fn get(&self, id: WorkId) -> CirrusResult<Option<SecurityGroupWork>> {
        self.executor.read("get work item", |txn| {
            let table = txn.open_table(SG_WORK_TABLE)?;
            let value = table.get(id.0)?;
            value.map(|v| decode(v.value(), "work item")).transpose()
        })
    }

    /// All items in id order
    pub fn list(&self) -> CirrusResult<Vec<SecurityGroupWork>> {
        self.executor.read("list work items", |txn| {
            let table = txn.open_table(SG_WORK_TABLE)?;
            let mut items = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                items.push(decode(value.value(), "work item")?);
            }
            Ok(items)
        })
    }

    pub fn list_by_step(&self, step: Step) -> CirrusResult<Vec<SecurityGroupWork>> {
        Ok(self.list()?.into_iter().filter(|w| w.step == step).collect())
    }
}

/// Coalescing schedule inside the caller's transaction
pub(crate) fn schedule_in_txn(txn: &WriteTransaction, vm: VmId) -> CirrusResult<SecurityGroupWork> {
    let waiting = scan(txn, |w| {
        w.vm_id == vm && w.step == Step::Scheduled && w.server_id.is_none()
    })?;
    if let Some(existing) = waiting.into_iter().next() {
        debug!("Coalesced schedule for {} into {}", vm, existing.id);
        return Ok(existing);
    }

    let work = SecurityGroupWork {
        id: WorkId(next_sequence(txn, WORK_ID_SEQUENCE)?),
        vm_id: vm,
        server_id: None,
        step: Step::Scheduled,
        created: Utc::now(),
        taken: None,
        finished: None,
        log_sequence: None,
    };
    put(txn, &work)?;
    debug!("Scheduled {} for {}", work.id, vm);
    Ok(work)
}

fn is_abandoned(work: &SecurityGroupWork, cutoff: DateTime<Utc>) -> bool {
    work.step == Step::Processing && work.taken.map(|t| t < cutoff).unwrap_or(true)
}

fn claim_oldest(txn: &WriteTransaction, worker: &WorkerId) -> CirrusResult<Option<TakenWork>> {
    let items = scan(txn, |_| true)?;

    // Ids are allocated in creation order, so the first scheduled item is the oldest
    let Some(mut work) = items
        .iter()
        .find(|w| w.step == Step::Scheduled && w.server_id.is_none())
        .cloned()
    else {
        return Ok(None);
    };

    let busy = items
        .iter()
        .any(|w| w.vm_id == work.vm_id && w.id != work.id && w.step == Step::Processing);

    let now = Utc::now();
    work.server_id = Some(worker.clone());
    work.taken = Some(now);
    work.log_sequence = Some(sequence_in_txn(txn, work.vm_id)?);

    if busy {
        work.step = Step::Done;
        work.finished = Some(now);
        put(txn, &work)?;
        Ok(Some(TakenWork::Superseded(work)))
    } else {
        work.step = Step::Processing;
        put(txn, &work)?;
        Ok(Some(TakenWork::Claimed(work)))
    }
}

fn advance(
    txn: &WriteTransaction,
    mut work: SecurityGroupWork,
    step: Step,
) -> CirrusResult<SecurityGroupWork> {
    if !work.step.can_advance_to(step) {
        return Err(CirrusError::InvalidInput {
            field: "step".to_string(),
            message: format!("{} cannot move from {} to {}", work.id, work.step, step),
        });
    }

    work.step = step;
    if step.is_terminal() {
        work.finished = Some(Utc::now());
    }
    put(txn, &work)?;
    Ok(work)
}

fn sequence_in_txn(txn: &WriteTransaction, vm: VmId) -> CirrusResult<u64> {
    let table = txn.open_table(VM_RULESET_LOG_TABLE)?;
    let value = table.get(vm.0)?;
    let entry: Option<VmRulesetLogEntry> = value
        .map(|v| decode(v.value(), "ruleset log entry"))
        .transpose()?;
    Ok(entry.map(|e| e.sequence).unwrap_or(0))
}

fn load(txn: &WriteTransaction, id: WorkId) -> CirrusResult<Option<SecurityGroupWork>> {
    let table = txn.open_table(SG_WORK_TABLE)?;
    let value = table.get(id.0)?;
    value.map(|v| decode(v.value(), "work item")).transpose()
}

fn put(txn: &WriteTransaction, work: &SecurityGroupWork) -> CirrusResult<()> {
    let bytes = encode(work, "work item")?;
    let mut table = txn.open_table(SG_WORK_TABLE)?;
    table.insert(work.id.0, bytes.as_slice())?;
    Ok(())
}

fn scan<P>(txn: &WriteTransaction, predicate: P) -> CirrusResult<Vec<SecurityGroupWork>>
where
    P: Fn(&SecurityGroupWork) -> bool,
{
    let table = txn.open_table(SG_WORK_TABLE)?;
    let mut matched = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        let work: SecurityGroupWork = decode(value.value(), "work item")?;
        if predicate(&work) {
            matched.push(work);
        }
    }
    Ok(matched)
}
