//! Rule edit to agent push, and network implement, end to end

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use cirrus_core::{
    capability::{providers, services, CapabilityRegistry},
    convergence::{ConvergenceDecision, RuleConvergence, RulesetVersion},
    error::{CirrusError, CirrusResult},
    network::{GuestType, Network, NewNetwork},
    network_state::NetworkState,
    offering::{NetworkOffering, OfferingCatalog},
    orchestrator::{NetworkElement, NetworkOrchestrator},
    security_group::{InMemoryPolicy, RuleSet, SecurityGroupRule},
    sync::{ProcessOutcome, SecurityGroupSync, SyncWorker},
    types::{OfferingId, VmId, WorkerId},
    work_queue::{Step, TakenWork},
};
use common::{Harness, RecordingAgent};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn rule_edit_reaches_agent_once() {
    let harness = Harness::new();
    let agent = RecordingAgent::new();
    let convergence = RuleConvergence::new(agent.clone());
    let v1 = VmId(1);

    assert_eq!(harness.log.current_sequence(v1).unwrap(), 0);

    // Rule edit
    let rules = RuleSet::new(vec![
        SecurityGroupRule::ingress_tcp(443, "0.0.0.0/0".parse().unwrap()).unwrap(),
    ]);
    harness.log.bump_sequence(&[v1]).await.unwrap();
    assert_eq!(harness.log.current_sequence(v1).unwrap(), 1);
    let s1 = rules.signature();

    harness.queue.schedule(v1).unwrap();
    let Some(TakenWork::Claimed(work)) = harness.queue.take(&WorkerId::new("worker1")).await.unwrap()
    else {
        panic!("expected worker1 to claim the item");
    };
    assert_eq!(work.step, Step::Processing);
    assert_eq!(work.log_sequence, Some(1));

    assert_eq!(convergence.acknowledged(v1), RulesetVersion::new(0, ""));
    let decision = convergence.converge(v1, 1, &rules).await.unwrap();
    assert_eq!(decision, ConvergenceDecision::Reprogram);
    assert_eq!(agent.applied(v1), Some(s1.clone()));
    harness.queue.update_step(work.id, Step::Done).unwrap();

    // Identical job delivered again
    let replay = convergence.converge(v1, 1, &rules).await.unwrap();
    assert_eq!(replay, ConvergenceDecision::NoOp);
    assert_eq!(agent.pushes(), 1);
    assert_eq!(convergence.acknowledged(v1), RulesetVersion { sequence: 1, signature: s1 });
}

#[tokio::test]
async fn sync_driver_converges_many_vms() {
    let harness = Harness::new();
    let agent = RecordingAgent::new();
    let policy = Arc::new(InMemoryPolicy::new());
    let convergence = Arc::new(RuleConvergence::new(agent.clone()));
    let sync = SecurityGroupSync::new(harness.log.clone(), harness.queue.clone());
    let worker = SyncWorker::new(
        WorkerId::new("worker1"),
        harness.queue.clone(),
        harness.log.clone(),
        policy.clone(),
        convergence.clone(),
    );

    let web = RuleSet::new(vec![
        SecurityGroupRule::ingress_tcp(80, "0.0.0.0/0".parse().unwrap()).unwrap(),
    ]);
    let vms: Vec<VmId> = (1..=5).map(VmId).collect();
    for vm in &vms {
        policy.set_rules(*vm, web.clone());
    }

    sync.rules_changed(&vms).await.unwrap();
    // Churn that cancels out: a second change with the same final rules
    sync.rules_changed(&vms).await.unwrap();

    let mut decisions = Vec::new();
    loop {
        match worker.process_next().await.unwrap() {
            ProcessOutcome::Idle => break,
            ProcessOutcome::Completed { decision, .. } => decisions.push(decision),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(decisions.len(), 5);
    assert!(decisions.iter().all(|d| *d == ConvergenceDecision::Reprogram));
    assert_eq!(agent.pushes(), 5);
    for vm in &vms {
        assert_eq!(convergence.acknowledged(*vm).sequence, 2);
        assert_eq!(agent.applied(*vm), Some(web.signature()));
    }
}

struct NoopElement(&'static str);

#[async_trait]
impl NetworkElement for NoopElement {
    fn provider(&self) -> &str {
        self.0
    }

    async fn implement(&self, _network: &Network, _offering: &NetworkOffering) -> CirrusResult<()> {
        Ok(())
    }

    async fn shutdown(&self, _network: &Network, _offering: &NetworkOffering) -> CirrusResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn network_lifecycle_through_orchestrator() {
    let harness = Harness::new();
    let offerings = OfferingCatalog::new();
    offerings
        .register(
            NetworkOffering::new(OfferingId(1), "default-isolated", GuestType::Isolated)
                .with_service(services::DHCP, providers::VIRTUAL_ROUTER)
                .with_service(services::DNS, providers::VIRTUAL_ROUTER)
                .with_service(services::SOURCE_NAT, providers::VIRTUAL_ROUTER),
        )
        .unwrap();
    offerings
        .register(
            NetworkOffering::new(OfferingId(2), "vpn-on-f5", GuestType::Isolated)
                .with_service(services::VPN, providers::F5_BIG_IP),
        )
        .unwrap();

    let mut orchestrator = NetworkOrchestrator::new(
        Arc::new(CapabilityRegistry::standard().unwrap()),
        Arc::new(offerings),
        harness.networks.clone(),
    );
    orchestrator
        .register_element(Arc::new(NoopElement(providers::VIRTUAL_ROUTER)))
        .unwrap();
    orchestrator
        .register_element(Arc::new(NoopElement(providers::F5_BIG_IP)))
        .unwrap();

    let good = harness
        .networks
        .allocate(NewNetwork::guest("good", "tenant", OfferingId(1)))
        .unwrap();
    let bad = harness
        .networks
        .allocate(NewNetwork::guest("bad", "tenant", OfferingId(2)))
        .unwrap();

    let implemented = orchestrator.implement_network(good.id).await.unwrap();
    assert_eq!(implemented.state, NetworkState::Implemented);

    let err = orchestrator.implement_network(bad.id).await.unwrap_err();
    assert!(matches!(err, CirrusError::UnsupportedServiceCombination { .. }));
    assert_eq!(harness.networks.get(bad.id).unwrap().state, NetworkState::Allocated);

    let destroyed = orchestrator.destroy_network(good.id).await.unwrap();
    assert_eq!(destroyed.state, NetworkState::Destroy);
    assert_eq!(harness.networks.reclaim_destroyed().unwrap(), 1);
}
