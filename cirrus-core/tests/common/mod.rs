// Common fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cirrus_core::{
    config::RetrySettings,
    convergence::AgentDispatcher,
    error::CirrusResult,
    network::NetworkStore,
    ruleset_log::VmRulesetLog,
    security_group::{RuleSet, RuleSignature},
    storage::{open_database, TransactionExecutor},
    types::VmId,
    work_queue::SecurityGroupWorkQueue,
};
use dashmap::DashMap;
use tempfile::TempDir;

/// Fresh database plus every store built on it
pub struct Harness {
    _dir: TempDir,
    pub executor: TransactionExecutor,
    pub networks: NetworkStore,
    pub log: VmRulesetLog,
    pub queue: SecurityGroupWorkQueue,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_retry(RetrySettings::default())
    }

    pub fn with_retry(retry: RetrySettings) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = TempDir::new().unwrap();
        let database = open_database(&dir.path().join("cirrus.redb")).unwrap();
        let executor = TransactionExecutor::new(database);

        Self {
            networks: NetworkStore::new(executor.clone()),
            log: VmRulesetLog::new(executor.clone(), retry.clone()),
            queue: SecurityGroupWorkQueue::new(executor.clone(), retry),
            executor,
            _dir: dir,
        }
    }
}

/// Agent that records every push it receives
#[derive(Default)]
pub struct RecordingAgent {
    pushes: AtomicUsize,
    applied: DashMap<VmId, RuleSignature>,
}

impl RecordingAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn applied(&self, vm: VmId) -> Option<RuleSignature> {
        self.applied.get(&vm).map(|s| s.value().clone())
    }
}

#[async_trait]
impl AgentDispatcher for RecordingAgent {
    async fn push(&self, vm: VmId, signature: &RuleSignature, _rules: &RuleSet) -> CirrusResult<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.applied.insert(vm, signature.clone());
        Ok(())
    }
}
