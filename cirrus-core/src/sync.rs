//! Rule synchronization driver
//!
//! [`SecurityGroupSync`] records rule changes, [`SyncWorker`] drains the
//! work queue through the convergence check and [`Sweeper`] recovers
//! abandoned items and collects finished ones.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{WorkQueueConfig, WorkerConfig};
use crate::convergence::{ConvergenceDecision, RuleConvergence};
use crate::error::{CirrusError, CirrusResult};
use crate::ruleset_log::{bump_in_txn, unique_vms, VmRulesetLog};
use crate::security_group::PolicySource;
use crate::types::{VmId, WorkId, WorkerId};
use crate::work_queue::{schedule_in_txn, SecurityGroupWork, SecurityGroupWorkQueue, Step, TakenWork};

/// Entry point for rule-affecting events
#[derive(Debug, Clone)]
pub struct SecurityGroupSync {
    log: VmRulesetLog,
    queue: SecurityGroupWorkQueue,
}

impl SecurityGroupSync {
    pub fn new(log: VmRulesetLog, queue: SecurityGroupWorkQueue) -> Self {
        Self { log, queue }
    }

    /// Record one rule change for every VM in the set and queue their sync
    ///
    /// The bump and the schedule share one write transaction: either every
    /// VM gets a new sequence and a waiting item, or nothing changes and the
    /// caller may resubmit. A worker that claims the item therefore always
    /// sees the new sequence.
    pub async fn rules_changed(&self, vms: &[VmId]) -> CirrusResult<Vec<SecurityGroupWork>> {
        let unique = unique_vms(vms);
        let config = self.log.retry_config().with_operation_name("rules_changed");

        let (bumped, scheduled) = self
            .queue
            .executor()
            .write_with_retry(config, "record rule change", |txn| {
                let bumped = bump_in_txn(txn, &unique)?;
                let mut scheduled = Vec::with_capacity(unique.len());
                for vm in &unique {
                    scheduled.push(schedule_in_txn(txn, *vm)?);
                }
                Ok((bumped, scheduled))
            })
            .await?;

        debug!("Recorded rule change for {} VMs", bumped.len());
        Ok(scheduled)
    }
}

/// What one call to [`SyncWorker::process_next`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing was scheduled
    Idle,
    /// The claimed item was closed because its VM is already in progress
    Superseded(WorkId),
    Completed {
        work: WorkId,
        decision: ConvergenceDecision,
    },
    /// Marked `Error`; the VM was scheduled again
    Failed { work: WorkId, reason: String },
}

/// Claims work items and converges the VMs they name
pub struct SyncWorker {
    id: WorkerId,
    queue: SecurityGroupWorkQueue,
    log: VmRulesetLog,
    policy: Arc<dyn PolicySource>,
    convergence: Arc<RuleConvergence>,
    poll_interval: Duration,
}

impl SyncWorker {
    pub fn new(
        id: WorkerId,
        queue: SecurityGroupWorkQueue,
        log: VmRulesetLog,
        policy: Arc<dyn PolicySource>,
        convergence: Arc<RuleConvergence>,
    ) -> Self {
        Self {
            id,
            queue,
            log,
            policy,
            convergence,
            poll_interval: WorkerConfig::default().poll_interval,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Take one item and drive its VM to the current rules
    pub async fn process_next(&self) -> CirrusResult<ProcessOutcome> {
        let work = match self.queue.take(&self.id).await? {
            None => return Ok(ProcessOutcome::Idle),
            Some(TakenWork::Superseded(work)) => return Ok(ProcessOutcome::Superseded(work.id)),
            Some(TakenWork::Claimed(work)) => work,
        };

        let sequence = work.log_sequence.unwrap_or(0);
        match self.converge(work.vm_id, sequence).await {
            Ok(decision) => {
                self.queue.update_step(work.id, Step::Done)?;

                // Changes that landed after the claim need another pass
                if self.log.current_sequence(work.vm_id)? > sequence {
                    self.queue.schedule(work.vm_id)?;
                }

                debug!("{} finished {} with {:?}", self.id, work.id, decision);
                Ok(ProcessOutcome::Completed {
                    work: work.id,
                    decision,
                })
            }
            Err(e) => {
                warn!("{} failed {} for {}: {}", self.id, work.id, work.vm_id, e);
                self.queue.update_step(work.id, Step::Error)?;
                self.queue.schedule(work.vm_id)?;
                Ok(ProcessOutcome::Failed {
                    work: work.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn converge(&self, vm: VmId, sequence: u64) -> CirrusResult<ConvergenceDecision> {
        let rules = self.policy.rules_for_vm(vm).await?;
        self.convergence.converge(vm, sequence, &rules).await
    }

    /// Process items until `shutdown` turns true
    ///
    /// Sleeps for the poll interval whenever the queue is empty or an item
    /// failed.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let span = info_span!("sync_worker", worker = %self.id);
        self.poll_loop(shutdown).instrument(span).await
    }

    async fn poll_loop(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Sync worker {} started", self.id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.process_next().await {
                Ok(ProcessOutcome::Completed { .. }) | Ok(ProcessOutcome::Superseded(_)) => false,
                Ok(ProcessOutcome::Idle) | Ok(ProcessOutcome::Failed { .. }) => true,
                Err(e) => {
                    error!("Sync worker {} could not process work: {}", self.id, e);
                    true
                }
            };

            if pause {
                tokio::select! {
                    changed = shutdown.changed() => {
                        // Sender dropped
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!("Sync worker {} stopped", self.id);
    }
}

/// Totals from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub abandoned: usize,
    pub rescheduled: usize,
    pub deleted: usize,
}

/// Timeout recovery and garbage collection for the work queue
#[derive(Debug, Clone)]
pub struct Sweeper {
    queue: SecurityGroupWorkQueue,
    config: WorkQueueConfig,
}

impl Sweeper {
    pub fn new(queue: SecurityGroupWorkQueue, config: WorkQueueConfig) -> Self {
        Self { queue, config }
    }

    pub fn sweep_once(&self) -> CirrusResult<SweepReport> {
        let now = Utc::now();
        let processing_cutoff = cutoff(now, self.config.processing_timeout, "work_queue.processing_timeout")?;
        let retention_cutoff = cutoff(now, self.config.retention, "work_queue.retention")?;

        let abandoned = self.queue.find_and_cleanup_unfinished_work(processing_cutoff)?;

        let vms: BTreeSet<VmId> = abandoned.iter().map(|w| w.vm_id).collect();
        for vm in &vms {
            self.queue.schedule(*vm)?;
        }

        let deleted = self.queue.delete_finished_work(retention_cutoff)?;

        let report = SweepReport {
            abandoned: abandoned.len(),
            rescheduled: vms.len(),
            deleted,
        };
        if report != SweepReport::default() {
            info!(
                "Sweep recovered {} abandoned items, rescheduled {} VMs, deleted {} finished items",
                report.abandoned, report.rescheduled, report.deleted
            );
        }
        Ok(report)
    }

    /// Sweep every `sweep_interval` until `shutdown` turns true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.sweep_loop(shutdown)
            .instrument(info_span!("work_queue_sweeper"))
            .await
    }

    async fn sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Sweeper shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once() {
                        error!("Work queue sweep failed: {}", e);
                    }
                }
            }
        }
    }
}

/// `now - age`, or a config error when `age` reaches past the representable range
fn cutoff(now: DateTime<Utc>, age: Duration, setting: &str) -> CirrusResult<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| CirrusError::ConfigError(format!("{} of {:?} is out of range", setting, age)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use crate::convergence::AgentDispatcher;
    use crate::security_group::{InMemoryPolicy, RuleSet, RuleSignature, SecurityGroupRule};
    use crate::storage::{init_database_tables, TransactionExecutor};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use redb::Database;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct Agent {
        pushes: AtomicUsize,
        offline: AtomicBool,
    }

    #[async_trait]
    impl AgentDispatcher for Agent {
        async fn push(&self, vm: VmId, _signature: &RuleSignature, _rules: &RuleSet) -> CirrusResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(CirrusError::Dispatch {
                    vm: vm.to_string(),
                    reason: "offline".to_string(),
                });
            }
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _file: NamedTempFile,
        sync: SecurityGroupSync,
        queue: SecurityGroupWorkQueue,
        log: VmRulesetLog,
        policy: Arc<InMemoryPolicy>,
        agent: Arc<Agent>,
        worker: SyncWorker,
    }

    fn fixture() -> Fixture {
        let file = NamedTempFile::new().unwrap();
        let db = Database::create(file.path()).unwrap();
        init_database_tables(&db).unwrap();
        let executor = TransactionExecutor::new(Arc::new(db));

        let log = VmRulesetLog::new(executor.clone(), RetrySettings::default());
        let queue = SecurityGroupWorkQueue::new(executor, RetrySettings::default());
        let policy = Arc::new(InMemoryPolicy::new());
        let agent = Arc::new(Agent::default());
        let convergence = Arc::new(RuleConvergence::new(agent.clone()));
        let worker = SyncWorker::new(
            WorkerId::new("w1"),
            queue.clone(),
            log.clone(),
            policy.clone(),
            convergence,
        );

        Fixture {
            _file: file,
            sync: SecurityGroupSync::new(log.clone(), queue.clone()),
            queue,
            log,
            policy,
            agent,
            worker,
        }
    }

    fn ssh() -> RuleSet {
        RuleSet::new(vec![SecurityGroupRule::ingress_tcp(22, "10.0.0.0/8".parse().unwrap()).unwrap()])
    }

    #[tokio::test]
    async fn rule_change_is_pushed_once() {
        let f = fixture();
        f.policy.set_rules(VmId(1), ssh());

        let scheduled = f.sync.rules_changed(&[VmId(1), VmId(1)]).await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(f.log.current_sequence(VmId(1)).unwrap(), 1);

        let outcome = f.worker.process_next().await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Completed {
                work: scheduled[0].id,
                decision: ConvergenceDecision::Reprogram
            }
        );
        assert_eq!(f.worker.process_next().await.unwrap(), ProcessOutcome::Idle);
        assert_eq!(f.agent.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_failure_reschedules() {
        let f = fixture();
        f.policy.set_rules(VmId(1), ssh());
        f.agent.offline.store(true, Ordering::SeqCst);
        f.sync.rules_changed(&[VmId(1)]).await.unwrap();

        let outcome = f.worker.process_next().await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
        assert_eq!(f.queue.list_by_step(Step::Error).unwrap().len(), 1);
        assert_eq!(f.queue.list_by_step(Step::Scheduled).unwrap().len(), 1);

        f.agent.offline.store(false, Ordering::SeqCst);
        let outcome = f.worker.process_next().await.unwrap();
        assert!(matches!(
            outcome,
            ProcessOutcome::Completed {
                decision: ConvergenceDecision::Reprogram,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn sweep_recovers_abandoned_items() {
        let f = fixture();
        f.sync.rules_changed(&[VmId(1)]).await.unwrap();
        f.queue.take(&WorkerId::new("crashed")).await.unwrap().unwrap();

        let sweeper = Sweeper::new(
            f.queue.clone(),
            WorkQueueConfig {
                processing_timeout: Duration::ZERO,
                retention: Duration::from_secs(3600),
                sweep_interval: Duration::from_secs(60),
            },
        );

        let report = sweeper.sweep_once().unwrap();
        assert_eq!(
            report,
            SweepReport {
                abandoned: 1,
                rescheduled: 1,
                deleted: 0
            }
        );
        assert_eq!(f.queue.list_by_step(Step::Error).unwrap().len(), 1);
        assert_eq!(f.queue.list_by_step(Step::Scheduled).unwrap().len(), 1);

        // Nothing left to recover on the next pass
        assert_eq!(sweeper.sweep_once().unwrap().abandoned, 0);
    }

    #[tokio::test]
    async fn sweep_collects_finished_items() {
        let f = fixture();
        f.sync.rules_changed(&[VmId(1)]).await.unwrap();
        f.worker.process_next().await.unwrap();

        let sweeper = Sweeper::new(
            f.queue.clone(),
            WorkQueueConfig {
                processing_timeout: Duration::from_secs(600),
                retention: Duration::ZERO,
                sweep_interval: Duration::from_secs(60),
            },
        );
        assert_eq!(sweeper.sweep_once().unwrap().deleted, 1);
        assert!(f.queue.list().unwrap().is_empty());
    }

    #[test]
    fn oversized_retention_is_a_config_error() {
        let f = fixture();
        let sweeper = Sweeper::new(
            f.queue.clone(),
            WorkQueueConfig {
                processing_timeout: Duration::from_secs(600),
                // Fits in a chrono duration but not before the earliest timestamp
                retention: Duration::from_secs(300_000 * 365 * 86_400),
                sweep_interval: Duration::from_secs(60),
            },
        );
        assert!(matches!(sweeper.sweep_once(), Err(CirrusError::ConfigError(_))));

        let sweeper = Sweeper::new(
            f.queue.clone(),
            WorkQueueConfig {
                processing_timeout: Duration::MAX,
                retention: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(60),
            },
        );
        assert!(matches!(sweeper.sweep_once(), Err(CirrusError::ConfigError(_))));
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let worker = f.worker.with_poll_interval(Duration::from_millis(10));

        let handle = tokio::spawn(async move { worker.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
