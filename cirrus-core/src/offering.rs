//! Network offerings: which provider supplies each service of a network

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::CapabilityRegistry;
use crate::error::{CirrusError, CirrusResult};
use crate::network::GuestType;
use crate::types::OfferingId;

/// A template networks are created from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOffering {
    pub id: OfferingId,
    pub name: String,
    pub guest_type: GuestType,
    /// service name -> provider name
    pub services: BTreeMap<String, String>,
}

impl NetworkOffering {
    pub fn new(id: OfferingId, name: impl Into<String>, guest_type: GuestType) -> Self {
        Self {
            id,
            name: name.into(),
            guest_type,
            services: BTreeMap::new(),
        }
    }

    pub fn with_service(mut self, service: &str, provider: &str) -> Self {
        self.services.insert(service.to_string(), provider.to_string());
        self
    }

    /// Requested services grouped by the provider that must supply them
    pub fn services_by_provider(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (service, provider) in &self.services {
            grouped
                .entry(provider.as_str())
                .or_default()
                .push(service.as_str());
        }
        grouped
    }

    /// Check every provider can jointly supply what the offering asks of it
    pub fn verify(&self, registry: &CapabilityRegistry) -> CirrusResult<()> {
        for (provider, services) in self.services_by_provider() {
            registry.check_provider_supports(provider, services.as_slice())?;
        }
        Ok(())
    }
}

/// Offerings known to the orchestrator
#[derive(Debug, Default)]
pub struct OfferingCatalog {
    offerings: DashMap<OfferingId, NetworkOffering>,
}

impl OfferingCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an offering; identical re-registration is a no-op
    pub fn register(&self, offering: NetworkOffering) -> CirrusResult<()> {
        match self.offerings.entry(offering.id) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if *existing.get() != offering {
                    return Err(CirrusError::DuplicateDefinition {
                        kind: "offering".to_string(),
                        name: offering.id.to_string(),
                    });
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!("Registered offering {} ({})", offering.name, offering.id);
                slot.insert(offering);
            }
        }
        Ok(())
    }

    pub fn get(&self, id: OfferingId) -> CirrusResult<NetworkOffering> {
        self.offerings
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CirrusError::NotFound {
                resource: format!("offering {}", id),
            })
    }

    pub fn list(&self) -> Vec<NetworkOffering> {
        let mut offerings: Vec<_> = self.offerings.iter().map(|e| e.value().clone()).collect();
        offerings.sort_by_key(|o| o.id);
        offerings
    }
}
