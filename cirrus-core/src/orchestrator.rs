//! Network implement and teardown workflows
//!
//! The orchestrator drives a network through the state table while calling
//! the network elements of every provider the network's offering names.
//! Provider capability is verified before the first transition so an
//! unsupported offering never leaves `Allocated`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::capability::CapabilityRegistry;
use crate::error::{CirrusError, CirrusResult};
use crate::network::{Network, NetworkStore};
use crate::network_state::{NetworkEvent, NetworkState};
use crate::offering::{NetworkOffering, OfferingCatalog};
use crate::types::NetworkId;

/// Configures one provider's devices for a network
///
/// Each provider in the catalog is backed by exactly one element.
#[async_trait]
pub trait NetworkElement: Send + Sync {
    /// Provider name as registered in the capability catalog
    fn provider(&self) -> &str;

    /// Bring up the services the offering assigns to this provider
    async fn implement(&self, network: &Network, offering: &NetworkOffering) -> CirrusResult<()>;

    /// Release everything `implement` configured; must tolerate partial setups
    async fn shutdown(&self, network: &Network, offering: &NetworkOffering) -> CirrusResult<()>;
}

pub struct NetworkOrchestrator {
    registry: Arc<CapabilityRegistry>,
    offerings: Arc<OfferingCatalog>,
    store: NetworkStore,
    elements: BTreeMap<String, Arc<dyn NetworkElement>>,
}

impl NetworkOrchestrator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        offerings: Arc<OfferingCatalog>,
        store: NetworkStore,
    ) -> Self {
        Self {
            registry,
            offerings,
            store,
            elements: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &NetworkStore {
        &self.store
    }

    /// Attach the element for a catalog provider
    pub fn register_element(&mut self, element: Arc<dyn NetworkElement>) -> CirrusResult<()> {
        let provider = element.provider().to_string();
        self.registry.resolve_provider(&provider)?;

        if self.elements.contains_key(&provider) {
            return Err(CirrusError::DuplicateDefinition {
                kind: "network element".to_string(),
                name: provider,
            });
        }

        info!("Registered network element for provider {}", provider);
        self.elements.insert(provider, element);
        Ok(())
    }

    /// Fail unless every provider of the offering supports its services and has an element
    ///
    /// A provider without an element cannot supply anything, so it is
    /// reported as unsupported for every service the offering assigns it.
    pub fn verify_offering(&self, offering: &NetworkOffering) -> CirrusResult<()> {
        offering.verify(&self.registry)?;
        for (provider, services) in offering.services_by_provider() {
            if !self.elements.contains_key(provider) {
                return Err(CirrusError::UnsupportedServiceCombination {
                    provider: provider.to_string(),
                    services: services.into_iter().map(str::to_string).collect(),
                });
            }
        }
        Ok(())
    }

    fn elements_for(&self, offering: &NetworkOffering) -> Vec<Arc<dyn NetworkElement>> {
        offering
            .services_by_provider()
            .keys()
            .filter_map(|provider| self.elements.get(*provider).cloned())
            .collect()
    }

    /// Implement a network; a network already `Implemented` is returned as is
    ///
    /// When an element fails, the network is rolled back through `Shutdown`
    /// to `Allocated` and the element's error is returned.
    pub async fn implement_network(&self, id: NetworkId) -> CirrusResult<Network> {
        let network = self.store.get(id)?;
        if network.state == NetworkState::Implemented {
            return Ok(network);
        }

        let offering = self.offerings.get(network.offering_id)?;
        self.verify_offering(&offering)?;

        let implementing = self
            .store
            .transition(&network, NetworkEvent::ImplementNetwork)?;

        for element in self.elements_for(&offering) {
            if let Err(e) = element.implement(&implementing, &offering).await {
                error!(
                    "Element {} failed to implement network {}: {}",
                    element.provider(),
                    id,
                    e
                );
                let shutting_down = self
                    .store
                    .transition(&implementing, NetworkEvent::OperationFailed)?;
                if let Err(cleanup) = self.shutdown_elements(&shutting_down, &offering).await {
                    warn!("Cleanup after failed implement of {} incomplete: {}", id, cleanup);
                }
                self.store
                    .transition(&shutting_down, NetworkEvent::OperationSucceeded)?;
                return Err(e);
            }
        }

        let implemented = self
            .store
            .transition(&implementing, NetworkEvent::OperationSucceeded)?;
        info!("Network {} implemented", id);
        Ok(implemented)
    }

    /// Tear down an implemented network; an `Allocated` network is returned as is
    pub async fn shutdown_network(&self, id: NetworkId) -> CirrusResult<Network> {
        let network = self.store.get(id)?;
        if network.state == NetworkState::Allocated {
            return Ok(network);
        }

        let offering = self.offerings.get(network.offering_id)?;
        let shutting_down = self
            .store
            .transition(&network, NetworkEvent::DestroyNetwork)?;

        match self.shutdown_elements(&shutting_down, &offering).await {
            Ok(()) => {
                let allocated = self
                    .store
                    .transition(&shutting_down, NetworkEvent::OperationSucceeded)?;
                info!("Network {} shut down", id);
                Ok(allocated)
            }
            Err(e) => {
                self.store
                    .transition(&shutting_down, NetworkEvent::OperationFailed)?;
                Err(e)
            }
        }
    }

    /// Shut the network down if needed, then retire it
    pub async fn destroy_network(&self, id: NetworkId) -> CirrusResult<Network> {
        let mut network = self.store.get(id)?;
        if network.state == NetworkState::Implemented {
            network = self.shutdown_network(id).await?;
        }
        self.store.mark_destroyed(&network)
    }

    /// Run every element's shutdown, returning the first failure
    async fn shutdown_elements(
        &self,
        network: &Network,
        offering: &NetworkOffering,
    ) -> CirrusResult<()> {
        let mut first_error = None;
        for element in self.elements_for(offering) {
            if let Err(e) = element.shutdown(network, offering).await {
                warn!(
                    "Element {} failed to shut down network {}: {}",
                    element.provider(),
                    network.id,
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{providers, services};
    use crate::network::{GuestType, NewNetwork};
    use crate::storage::{init_database_tables, TransactionExecutor};
    use crate::types::OfferingId;
    use redb::Database;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    struct FakeElement {
        provider: &'static str,
        fail_implement: AtomicBool,
        fail_shutdown: AtomicBool,
        implemented: AtomicUsize,
        shut_down: AtomicUsize,
    }

    impl FakeElement {
        fn new(provider: &'static str) -> Arc<Self> {
            Arc::new(Self {
                provider,
                fail_implement: AtomicBool::new(false),
                fail_shutdown: AtomicBool::new(false),
                implemented: AtomicUsize::new(0),
                shut_down: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NetworkElement for FakeElement {
        fn provider(&self) -> &str {
            self.provider
        }

        async fn implement(&self, _network: &Network, _offering: &NetworkOffering) -> CirrusResult<()> {
            if self.fail_implement.load(Ordering::SeqCst) {
                return Err(CirrusError::ElementFailure {
                    provider: self.provider.to_string(),
                    operation: "implement".to_string(),
                    reason: "device unreachable".to_string(),
                });
            }
            self.implemented.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self, _network: &Network, _offering: &NetworkOffering) -> CirrusResult<()> {
            if self.fail_shutdown.load(Ordering::SeqCst) {
                return Err(CirrusError::ElementFailure {
                    provider: self.provider.to_string(),
                    operation: "shutdown".to_string(),
                    reason: "device unreachable".to_string(),
                });
            }
            self.shut_down.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _file: NamedTempFile,
        orchestrator: NetworkOrchestrator,
        router: Arc<FakeElement>,
        balancer: Arc<FakeElement>,
    }

    fn fixture() -> Fixture {
        let file = NamedTempFile::new().unwrap();
        let db = Database::create(file.path()).unwrap();
        init_database_tables(&db).unwrap();
        let store = NetworkStore::new(TransactionExecutor::new(Arc::new(db)));

        let offerings = OfferingCatalog::new();
        offerings
            .register(
                NetworkOffering::new(OfferingId(1), "isolated", GuestType::Isolated)
                    .with_service(services::DHCP, providers::VIRTUAL_ROUTER)
                    .with_service(services::SOURCE_NAT, providers::VIRTUAL_ROUTER)
                    .with_service(services::LB, providers::NETSCALER),
            )
            .unwrap();
        offerings
            .register(
                NetworkOffering::new(OfferingId(2), "impossible", GuestType::Isolated)
                    .with_service(services::VPN, providers::F5_BIG_IP),
            )
            .unwrap();
        offerings
            .register(
                NetworkOffering::new(OfferingId(3), "no element", GuestType::Isolated)
                    .with_service(services::LB, providers::F5_BIG_IP),
            )
            .unwrap();
        offerings
            .register(
                NetworkOffering::new(OfferingId(4), "unknown provider", GuestType::Isolated)
                    .with_service(services::DHCP, "NoSuchProvider"),
            )
            .unwrap();

        let mut orchestrator = NetworkOrchestrator::new(
            Arc::new(CapabilityRegistry::standard().unwrap()),
            Arc::new(offerings),
            store,
        );
        let router = FakeElement::new(providers::VIRTUAL_ROUTER);
        let balancer = FakeElement::new(providers::NETSCALER);
        orchestrator.register_element(router.clone()).unwrap();
        orchestrator.register_element(balancer.clone()).unwrap();

        Fixture {
            _file: file,
            orchestrator,
            router,
            balancer,
        }
    }

    fn allocate(fixture: &Fixture, offering: u64) -> Network {
        fixture
            .orchestrator
            .store()
            .allocate(NewNetwork::guest("net", "acct", OfferingId(offering)))
            .unwrap()
    }

    #[test]
    fn element_registration_rules() {
        let mut f = fixture();
        assert!(matches!(
            f.orchestrator
                .register_element(FakeElement::new(providers::VIRTUAL_ROUTER)),
            Err(CirrusError::DuplicateDefinition { .. })
        ));
        assert!(matches!(
            f.orchestrator.register_element(FakeElement::new("NoSuchProvider")),
            Err(CirrusError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn implement_then_shutdown() {
        let f = fixture();
        let network = allocate(&f, 1);

        let implemented = f.orchestrator.implement_network(network.id).await.unwrap();
        assert_eq!(implemented.state, NetworkState::Implemented);
        assert_eq!(f.router.implemented.load(Ordering::SeqCst), 1);
        assert_eq!(f.balancer.implemented.load(Ordering::SeqCst), 1);

        // Already implemented networks are left alone
        f.orchestrator.implement_network(network.id).await.unwrap();
        assert_eq!(f.router.implemented.load(Ordering::SeqCst), 1);

        let allocated = f.orchestrator.shutdown_network(network.id).await.unwrap();
        assert_eq!(allocated.state, NetworkState::Allocated);
        assert_eq!(f.router.shut_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_offering_fails_before_transition() {
        let f = fixture();
        let network = allocate(&f, 2);

        let err = f.orchestrator.implement_network(network.id).await.unwrap_err();
        assert!(matches!(err, CirrusError::UnsupportedServiceCombination { .. }));
        assert_eq!(
            f.orchestrator.store().get(network.id).unwrap().state,
            NetworkState::Allocated
        );
    }

    #[tokio::test]
    async fn unsatisfiable_providers_are_unsupported_combinations() {
        let f = fixture();

        for (offering, expected) in [(3, providers::F5_BIG_IP), (4, "NoSuchProvider")] {
            let network = allocate(&f, offering);
            match f.orchestrator.implement_network(network.id).await {
                Err(CirrusError::UnsupportedServiceCombination { provider, services }) => {
                    assert_eq!(provider, expected);
                    assert_eq!(services.len(), 1);
                }
                other => panic!("unexpected result for offering {offering}: {other:?}"),
            }
            assert_eq!(
                f.orchestrator.store().get(network.id).unwrap().state,
                NetworkState::Allocated
            );
        }
        assert_eq!(f.router.implemented.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn element_failure_rolls_back_to_allocated() {
        let f = fixture();
        let network = allocate(&f, 1);
        f.balancer.fail_implement.store(true, Ordering::SeqCst);

        let err = f.orchestrator.implement_network(network.id).await.unwrap_err();
        assert!(matches!(err, CirrusError::ElementFailure { .. }));
        assert_eq!(
            f.orchestrator.store().get(network.id).unwrap().state,
            NetworkState::Allocated
        );
        assert_eq!(f.router.shut_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_shutdown_returns_to_implemented() {
        let f = fixture();
        let network = allocate(&f, 1);
        f.orchestrator.implement_network(network.id).await.unwrap();

        f.router.fail_shutdown.store(true, Ordering::SeqCst);
        assert!(f.orchestrator.shutdown_network(network.id).await.is_err());
        assert_eq!(
            f.orchestrator.store().get(network.id).unwrap().state,
            NetworkState::Implemented
        );
    }

    #[tokio::test]
    async fn destroy_shuts_down_first() {
        let f = fixture();
        let network = allocate(&f, 1);
        f.orchestrator.implement_network(network.id).await.unwrap();

        let destroyed = f.orchestrator.destroy_network(network.id).await.unwrap();
        assert_eq!(destroyed.state, NetworkState::Destroy);
        assert_eq!(f.balancer.shut_down.load(Ordering::SeqCst), 1);
    }
}
