//! Decide whether an agent needs its rules re-programmed
//!
//! The authoritative `(sequence, signature)` of a VM is compared with the
//! last pair its agent acknowledged:
//!
//! | sequence      | signature | decision          |
//! |---------------|-----------|-------------------|
//! | newer         | differs   | `Reprogram`       |
//! | newer         | same      | `AcknowledgeOnly` |
//! | older         | any       | `Ignore`          |
//! | same          | differs   | `Reprogram`       |
//! | same          | same      | `NoOp`            |
//!
//! Replaying or reordering deliveries therefore never applies a rule set
//! twice and never lets an older set overwrite a newer one.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CirrusResult;
use crate::security_group::{RuleSet, RuleSignature};
use crate::types::VmId;

/// A point in a VM's rule history
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RulesetVersion {
    pub sequence: u64,
    pub signature: RuleSignature,
}

impl RulesetVersion {
    pub fn new(sequence: u64, signature: impl Into<RuleSignature>) -> Self {
        Self {
            sequence,
            signature: signature.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvergenceDecision {
    /// Push the rule set to the agent
    Reprogram,
    /// Record the newer sequence without pushing; content is unchanged
    AcknowledgeOnly,
    /// Stale delivery; keep the newer acknowledged state
    Ignore,
    /// Duplicate delivery
    NoOp,
}

/// Compare the authoritative version against the acknowledged one
pub fn decide(authoritative: &RulesetVersion, acknowledged: &RulesetVersion) -> ConvergenceDecision {
    let same_content = authoritative.signature == acknowledged.signature;
    match authoritative.sequence.cmp(&acknowledged.sequence) {
        Ordering::Less => ConvergenceDecision::Ignore,
        Ordering::Greater if same_content => ConvergenceDecision::AcknowledgeOnly,
        Ordering::Equal if same_content => ConvergenceDecision::NoOp,
        Ordering::Greater | Ordering::Equal => ConvergenceDecision::Reprogram,
    }
}

/// Pushes rule sets to the agent enforcing a VM's rules
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn push(&self, vm: VmId, signature: &RuleSignature, rules: &RuleSet) -> CirrusResult<()>;
}

/// Tracks what each agent acknowledged and gates pushes on [`decide`]
pub struct RuleConvergence {
    dispatcher: Arc<dyn AgentDispatcher>,
    acknowledged: DashMap<VmId, RulesetVersion>,
}

impl RuleConvergence {
    pub fn new(dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self {
            dispatcher,
            acknowledged: DashMap::new(),
        }
    }

    /// Last acknowledged version; `(0, "")` for an agent never programmed
    pub fn acknowledged(&self, vm: VmId) -> RulesetVersion {
        self.acknowledged
            .get(&vm)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    /// Bring the VM's agent to `(sequence, rules)` if needed
    ///
    /// A failed push leaves the acknowledged version untouched so the next
    /// delivery reprograms again.
    pub async fn converge(
        &self,
        vm: VmId,
        sequence: u64,
        rules: &RuleSet,
    ) -> CirrusResult<ConvergenceDecision> {
        let version = RulesetVersion {
            sequence,
            signature: rules.signature(),
        };
        let decision = decide(&version, &self.acknowledged(vm));

        match decision {
            ConvergenceDecision::Reprogram => {
                self.dispatcher.push(vm, &version.signature, rules).await?;
                info!("Reprogrammed {} to sequence {} ({} rules)", vm, sequence, rules.len());
                self.record(vm, version);
            }
            ConvergenceDecision::AcknowledgeOnly => {
                debug!("{} unchanged at sequence {}; acknowledged without push", vm, sequence);
                self.record(vm, version);
            }
            ConvergenceDecision::Ignore => {
                debug!("Ignored stale sequence {} for {}", sequence, vm);
            }
            ConvergenceDecision::NoOp => {}
        }

        Ok(decision)
    }

    /// Forget what the agent acknowledged, e.g. after it restarted empty
    pub fn forget_vm(&self, vm: VmId) {
        self.acknowledged.remove(&vm);
    }

    fn record(&self, vm: VmId, version: RulesetVersion) {
        self.acknowledged
            .entry(vm)
            .and_modify(|current| {
                if version.sequence >= current.sequence {
                    *current = version.clone();
                }
            })
            .or_insert(version);
    }
}
