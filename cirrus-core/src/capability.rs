//! Catalog of network services, providers and capabilities
//!
//! The catalog is assembled once at start-up through a
//! [`CapabilityRegistryBuilder`] and frozen into an immutable
//! [`CapabilityRegistry`] that is shared by reference (usually behind an
//! `Arc`). Nothing mutates it afterwards, so concurrent readers need no
//! synchronization.
//!
//! A provider supports a service when it lists the service and holds a
//! non-empty value for every capability that service declares. Support is
//! all-or-nothing: one missing capability value rejects the service.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::CatalogConfig;
use crate::error::{CirrusError, CirrusResult};

/// Well-known service names
pub mod services {
    pub const VPN: &str = "Vpn";
    pub const DHCP: &str = "Dhcp";
    pub const DNS: &str = "Dns";
    pub const GATEWAY: &str = "Gateway";
    pub const FIREWALL: &str = "Firewall";
    pub const LB: &str = "Lb";
    pub const USER_DATA: &str = "UserData";
    pub const SOURCE_NAT: &str = "SourceNat";
    pub const STATIC_NAT: &str = "StaticNat";
    pub const PORT_FORWARDING: &str = "PortForwarding";
    pub const SECURITY_GROUP: &str = "SecurityGroup";
    pub const NETWORK_ACL: &str = "NetworkACL";
    pub const CONNECTIVITY: &str = "Connectivity";
}

/// Well-known capability names
pub mod capabilities {
    pub const SUPPORTED_PROTOCOLS: &str = "SupportedProtocols";
    pub const SUPPORTED_LB_ALGORITHMS: &str = "SupportedLBAlgorithms";
    pub const SUPPORTED_LB_ISOLATION: &str = "SupportedLBIsolation";
    pub const SUPPORTED_STICKINESS_METHODS: &str = "SupportedStickinessMethods";
    pub const SUPPORTED_SOURCE_NAT_TYPES: &str = "SupportedSourceNatTypes";
    pub const SUPPORTED_VPN_PROTOCOLS: &str = "SupportedVpnProtocols";
    pub const SUPPORTED_TRAFFIC_DIRECTION: &str = "SupportedTrafficDirection";
    pub const TRAFFIC_STATISTICS: &str = "TrafficStatistics";
    pub const MULTIPLE_IPS: &str = "MultipleIps";
    pub const ELASTIC_IP: &str = "ElasticIp";
    pub const REDUNDANT_ROUTER: &str = "RedundantRouter";
    pub const DNS_SUFFIX_MODIFICATION: &str = "AllowDnsSuffixModification";
    pub const STRETCHED_L2_SUBNET: &str = "StretchedL2Subnet";
}

/// Well-known provider names
pub mod providers {
    pub const VIRTUAL_ROUTER: &str = "VirtualRouter";
    pub const VPC_VIRTUAL_ROUTER: &str = "VpcVirtualRouter";
    pub const INTERNAL_LB_VM: &str = "InternalLbVm";
    pub const NICIRA_NVP: &str = "NiciraNvp";
    pub const SECURITY_GROUP_PROVIDER: &str = "SecurityGroupProvider";
    pub const NETSCALER: &str = "Netscaler";
    pub const F5_BIG_IP: &str = "F5BigIp";
    pub const JUNIPER_SRX: &str = "JuniperSRX";
}

/// A named network function and the capability keys meaningful for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl ServiceDefinition {
    pub fn new(name: &str, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// A named implementation of services, with its capability values per service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDefinition {
    pub name: String,
    /// External appliance integration rather than a built-in element
    #[serde(default)]
    pub external: bool,
    /// service name -> capability name -> string-encoded value
    #[serde(default)]
    pub services: BTreeMap<String, BTreeMap<String, String>>,
}

impl ProviderDefinition {
    pub fn new(name: &str, external: bool) -> Self {
        Self {
            name: name.to_string(),
            external,
            services: BTreeMap::new(),
        }
    }

    /// Declare a supported service together with its capability values
    pub fn with_service(mut self, service: &str, values: &[(&str, &str)]) -> Self {
        self.services.insert(
            service.to_string(),
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }
}

/// Collects catalog entries before the registry is frozen
#[derive(Debug, Default)]
pub struct CapabilityRegistryBuilder {
    services: BTreeMap<String, ServiceDefinition>,
    providers: BTreeMap<String, ProviderDefinition>,
}

impl CapabilityRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service; identical re-registration is a no-op
    pub fn register_service(&mut self, service: ServiceDefinition) -> CirrusResult<&mut Self> {
        match self.services.get(&service.name) {
            Some(existing) if *existing == service => {
                debug!("Service {} already registered", service.name);
            }
            Some(_) => {
                return Err(CirrusError::DuplicateDefinition {
                    kind: "service".to_string(),
                    name: service.name,
                })
            }
            None => {
                self.services.insert(service.name.clone(), service);
            }
        }
        Ok(self)
    }

    /// Register a provider; identical re-registration is a no-op
    pub fn register_provider(&mut self, provider: ProviderDefinition) -> CirrusResult<&mut Self> {
        match self.providers.get(&provider.name) {
            Some(existing) if *existing == provider => {
                debug!("Provider {} already registered", provider.name);
            }
            Some(_) => {
                return Err(CirrusError::DuplicateDefinition {
                    kind: "provider".to_string(),
                    name: provider.name,
                })
            }
            None => {
                self.providers.insert(provider.name.clone(), provider);
            }
        }
        Ok(self)
    }

    /// Register every entry of a configuration catalog section
    pub fn register_config(&mut self, catalog: &CatalogConfig) -> CirrusResult<&mut Self> {
        for service in &catalog.services {
            self.register_service(service.clone())?;
        }
        for provider in &catalog.providers {
            self.register_provider(provider.clone())?;
        }
        Ok(self)
    }

    /// Freeze the catalog
    ///
    /// Every provider must only reference registered services and only
    /// assign capabilities those services declare.
    pub fn build(self) -> CirrusResult<CapabilityRegistry> {
        for provider in self.providers.values() {
            for (service_name, values) in &provider.services {
                let service = self.services.get(service_name).ok_or_else(|| {
                    CirrusError::InvalidInput {
                        field: format!("provider {}", provider.name),
                        message: format!("unknown service '{}'", service_name),
                    }
                })?;
                if let Some(unknown) = values.keys().find(|k| !service.capabilities.contains(*k)) {
                    return Err(CirrusError::InvalidInput {
                        field: format!("provider {}", provider.name),
                        message: format!(
                            "capability '{}' is not declared by service '{}'",
                            unknown, service_name
                        ),
                    });
                }
            }
        }

        debug!(
            "Capability catalog frozen with {} services and {} providers",
            self.services.len(),
            self.providers.len()
        );

        Ok(CapabilityRegistry {
            services: self.services,
            providers: self.providers,
        })
    }
}

/// Immutable catalog consulted by the orchestrator
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    services: BTreeMap<String, ServiceDefinition>,
    providers: BTreeMap<String, ProviderDefinition>,
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::new()
    }

    /// The built-in catalog
    pub fn standard() -> CirrusResult<Self> {
        standard_builder()?.build()
    }

    /// The built-in catalog extended with the configured entries
    pub fn from_config(catalog: &CatalogConfig) -> CirrusResult<Self> {
        let mut builder = standard_builder()?;
        builder.register_config(catalog)?;
        builder.build()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDefinition> {
        self.services.values()
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderDefinition> {
        self.providers.values()
    }

    /// Look a provider up by name
    pub fn resolve_provider(&self, name: &str) -> CirrusResult<&ProviderDefinition> {
        self.providers.get(name).ok_or_else(|| CirrusError::NotFound {
            resource: format!("provider {}", name),
        })
    }

    /// Whether `capability` is a key the service declares
    pub fn service_supports_capability(&self, service: &str, capability: &str) -> bool {
        self.services
            .get(service)
            .map(|s| s.capabilities.contains(capability))
            .unwrap_or(false)
    }

    /// Value a provider registered for one capability of one service
    pub fn capability_value(&self, provider: &str, service: &str, capability: &str) -> Option<&str> {
        self.providers
            .get(provider)?
            .services
            .get(service)?
            .get(capability)
            .map(String::as_str)
    }

    /// Whether the provider supports every requested service completely
    pub fn provider_supports_services<S: AsRef<str>>(&self, provider: &str, services: &[S]) -> bool {
        matches!(self.unsupported_services(provider, services), Some(missing) if missing.is_empty())
    }

    /// Like [`provider_supports_services`](Self::provider_supports_services)
    /// but reports which services fail
    ///
    /// A provider missing from the catalog supports none of the services.
    pub fn check_provider_supports<S: AsRef<str>>(
        &self,
        provider: &str,
        services: &[S],
    ) -> CirrusResult<()> {
        let missing = match self.unsupported_services(provider, services) {
            Some(missing) if missing.is_empty() => return Ok(()),
            Some(missing) => missing,
            None => services.iter().map(|s| s.as_ref().to_string()).collect::<Vec<String>>(),
        };
        Err(CirrusError::UnsupportedServiceCombination {
            provider: provider.to_string(),
            services: missing,
        })
    }

    /// `None` when the provider is not in the catalog
    fn unsupported_services<S: AsRef<str>>(&self, provider: &str, services: &[S]) -> Option<Vec<String>> {
        let provider = self.providers.get(provider)?;
        let mut missing = Vec::new();
        for service in services {
            let name: &str = service.as_ref();
            if !self.fully_supports(provider, name) {
                missing.push(name.to_string());
            }
        }
        Some(missing)
    }

    fn fully_supports(&self, provider: &ProviderDefinition, service: &str) -> bool {
        let (Some(definition), Some(values)) =
            (self.services.get(service), provider.services.get(service))
        else {
            return false;
        };

        definition.capabilities.iter().all(|capability| {
            values
                .get(capability)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false)
        })
    }

    /// Providers that fully support the given service
    pub fn providers_for_service(&self, service: &str) -> Vec<&ProviderDefinition> {
        self.providers
            .values()
            .filter(|p| self.fully_supports(p, service))
            .collect()
    }

    /// Services the provider fully supports
    pub fn services_of_provider(&self, provider: &str) -> CirrusResult<Vec<&str>> {
        let provider = self.resolve_provider(provider)?;
        Ok(provider
            .services
            .keys()
            .map(String::as_str)
            .filter(|s| self.fully_supports(provider, s))
            .collect())
    }
}

fn standard_builder() -> CirrusResult<CapabilityRegistryBuilder> {
    use capabilities::*;
    use services::*;

    let mut builder = CapabilityRegistryBuilder::new();

    builder
        .register_service(ServiceDefinition::new(VPN, &[SUPPORTED_VPN_PROTOCOLS]))?
        .register_service(ServiceDefinition::new(DHCP, &[]))?
        .register_service(ServiceDefinition::new(DNS, &[DNS_SUFFIX_MODIFICATION]))?
        .register_service(ServiceDefinition::new(GATEWAY, &[REDUNDANT_ROUTER]))?
        .register_service(ServiceDefinition::new(
            FIREWALL,
            &[SUPPORTED_PROTOCOLS, SUPPORTED_TRAFFIC_DIRECTION, MULTIPLE_IPS, TRAFFIC_STATISTICS],
        ))?
        .register_service(ServiceDefinition::new(
            LB,
            &[
                SUPPORTED_LB_ALGORITHMS,
                SUPPORTED_LB_ISOLATION,
                SUPPORTED_PROTOCOLS,
                SUPPORTED_STICKINESS_METHODS,
            ],
        ))?
        .register_service(ServiceDefinition::new(USER_DATA, &[]))?
        .register_service(ServiceDefinition::new(SOURCE_NAT, &[SUPPORTED_SOURCE_NAT_TYPES]))?
        .register_service(ServiceDefinition::new(STATIC_NAT, &[ELASTIC_IP]))?
        .register_service(ServiceDefinition::new(PORT_FORWARDING, &[SUPPORTED_PROTOCOLS]))?
        .register_service(ServiceDefinition::new(SECURITY_GROUP, &[]))?
        .register_service(ServiceDefinition::new(NETWORK_ACL, &[SUPPORTED_PROTOCOLS]))?
        .register_service(ServiceDefinition::new(CONNECTIVITY, &[STRETCHED_L2_SUBNET]))?;

    let lb_values: &[(&str, &str)] = &[
        (SUPPORTED_LB_ALGORITHMS, "roundrobin,leastconn,source"),
        (SUPPORTED_LB_ISOLATION, "dedicated"),
        (SUPPORTED_PROTOCOLS, "tcp,udp,tcp-proxy"),
        (SUPPORTED_STICKINESS_METHODS, "LbCookie,AppCookie,SourceBased"),
    ];

    builder
        .register_provider(
            ProviderDefinition::new(providers::VIRTUAL_ROUTER, false)
                .with_service(VPN, &[(SUPPORTED_VPN_PROTOCOLS, "pptp,l2tp,ipsec")])
                .with_service(DHCP, &[])
                .with_service(DNS, &[(DNS_SUFFIX_MODIFICATION, "true")])
                .with_service(GATEWAY, &[(REDUNDANT_ROUTER, "true")])
                .with_service(
                    FIREWALL,
                    &[
                        (SUPPORTED_PROTOCOLS, "tcp,udp,icmp"),
                        (SUPPORTED_TRAFFIC_DIRECTION, "ingress,egress"),
                        (MULTIPLE_IPS, "true"),
                        (TRAFFIC_STATISTICS, "per public ip"),
                    ],
                )
                .with_service(LB, lb_values)
                .with_service(USER_DATA, &[])
                .with_service(SOURCE_NAT, &[(SUPPORTED_SOURCE_NAT_TYPES, "peraccount")])
                .with_service(STATIC_NAT, &[(ELASTIC_IP, "false")])
                .with_service(PORT_FORWARDING, &[(SUPPORTED_PROTOCOLS, "tcp,udp")]),
        )?
        .register_provider(
            ProviderDefinition::new(providers::VPC_VIRTUAL_ROUTER, false)
                .with_service(VPN, &[(SUPPORTED_VPN_PROTOCOLS, "ipsec")])
                .with_service(DHCP, &[])
                .with_service(DNS, &[(DNS_SUFFIX_MODIFICATION, "true")])
                .with_service(GATEWAY, &[(REDUNDANT_ROUTER, "true")])
                .with_service(LB, lb_values)
                .with_service(USER_DATA, &[])
                .with_service(SOURCE_NAT, &[(SUPPORTED_SOURCE_NAT_TYPES, "peraccount")])
                .with_service(STATIC_NAT, &[(ELASTIC_IP, "false")])
                .with_service(PORT_FORWARDING, &[(SUPPORTED_PROTOCOLS, "tcp,udp")])
                .with_service(NETWORK_ACL, &[(SUPPORTED_PROTOCOLS, "tcp,udp,icmp")]),
        )?
        .register_provider(
            ProviderDefinition::new(providers::INTERNAL_LB_VM, false).with_service(LB, lb_values),
        )?
        .register_provider(
            ProviderDefinition::new(providers::SECURITY_GROUP_PROVIDER, false)
                .with_service(SECURITY_GROUP, &[]),
        )?
        .register_provider(
            ProviderDefinition::new(providers::NICIRA_NVP, true)
                .with_service(CONNECTIVITY, &[(STRETCHED_L2_SUBNET, "true")]),
        )?
        .register_provider(
            ProviderDefinition::new(providers::NETSCALER, true)
                .with_service(LB, lb_values)
                .with_service(STATIC_NAT, &[(ELASTIC_IP, "true")]),
        )?
        .register_provider(
            ProviderDefinition::new(providers::F5_BIG_IP, true).with_service(LB, lb_values),
        )?
        .register_provider(
            ProviderDefinition::new(providers::JUNIPER_SRX, true)
                .with_service(
                    FIREWALL,
                    &[
                        (SUPPORTED_PROTOCOLS, "tcp,udp,icmp"),
                        (SUPPORTED_TRAFFIC_DIRECTION, "ingress,egress"),
                        (MULTIPLE_IPS, "true"),
                        (TRAFFIC_STATISTICS, "per public ip"),
                    ],
                )
                .with_service(GATEWAY, &[(REDUNDANT_ROUTER, "false")])
                .with_service(SOURCE_NAT, &[(SUPPORTED_SOURCE_NAT_TYPES, "peraccount")])
                .with_service(STATIC_NAT, &[(ELASTIC_IP, "false")])
                .with_service(PORT_FORWARDING, &[(SUPPORTED_PROTOCOLS, "tcp,udp")]),
        )?;

    Ok(builder)
}
