//! Persistent network records
//!
//! [`NetworkStore`] is the only writer of [`Network::state`]. Every change is
//! a compare-and-swap inside one write transaction: the caller passes the
//! snapshot it acted on, and the write is refused with
//! `ConcurrentStateConflict` if the stored state has moved since.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CirrusError, CirrusResult};
use crate::network_state::{NetworkEvent, NetworkState};
use crate::storage::{decode, encode, TransactionExecutor, NETWORK_TABLE};
use crate::types::{NetworkId, OfferingId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastDomainType {
    Native,
    Vlan,
    Vswitch,
    Vnet,
    Undecided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrafficType {
    Public,
    Guest,
    Storage,
    Management,
    Control,
    Vpn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestType {
    Shared,
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclType {
    Account,
    Domain,
}

/// A logical network owned by an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub name: String,
    pub account: String,
    pub broadcast_domain: BroadcastDomainType,
    pub traffic_type: TrafficType,
    pub guest_type: GuestType,
    pub cidr: Option<IpNet>,
    pub reserved_cidr: Option<IpNet>,
    pub gateway: Option<IpAddr>,
    pub offering_id: OfferingId,
    pub acl_type: AclType,
    pub state: NetworkState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Request to allocate a network
#[derive(Debug, Clone)]
pub struct NewNetwork {
    pub name: String,
    pub account: String,
    pub broadcast_domain: BroadcastDomainType,
    pub traffic_type: TrafficType,
    pub guest_type: GuestType,
    pub cidr: Option<IpNet>,
    pub reserved_cidr: Option<IpNet>,
    pub gateway: Option<IpAddr>,
    pub offering_id: OfferingId,
    pub acl_type: AclType,
}

impl NewNetwork {
    /// An isolated guest network with no addressing yet
    pub fn guest(name: impl Into<String>, account: impl Into<String>, offering_id: OfferingId) -> Self {
        Self {
            name: name.into(),
            account: account.into(),
            broadcast_domain: BroadcastDomainType::Vlan,
            traffic_type: TrafficType::Guest,
            guest_type: GuestType::Isolated,
            cidr: None,
            reserved_cidr: None,
            gateway: None,
            offering_id,
            acl_type: AclType::Account,
        }
    }

    pub fn with_addressing(mut self, cidr: IpNet, gateway: IpAddr) -> Self {
        self.cidr = Some(cidr);
        self.gateway = Some(gateway);
        self
    }

    pub fn with_reserved_cidr(mut self, reserved: IpNet) -> Self {
        self.reserved_cidr = Some(reserved);
        self
    }

    fn validate(&self) -> CirrusResult<()> {
        if self.name.trim().is_empty() {
            return Err(CirrusError::InvalidInput {
                field: "name".to_string(),
                message: "network name cannot be empty".to_string(),
            });
        }

        match (self.cidr, self.gateway) {
            (None, Some(gateway)) => {
                return Err(CirrusError::InvalidInput {
                    field: "gateway".to_string(),
                    message: format!("gateway {} given without a CIDR", gateway),
                })
            }
            (Some(cidr), Some(gateway)) if !cidr.contains(&gateway) => {
                return Err(CirrusError::InvalidInput {
                    field: "gateway".to_string(),
                    message: format!("gateway {} is outside {}", gateway, cidr),
                })
            }
            _ => {}
        }

        if let Some(reserved) = self.reserved_cidr {
            match self.cidr {
                Some(cidr) if cidr.contains(&reserved) => {}
                Some(cidr) => {
                    return Err(CirrusError::InvalidInput {
                        field: "reserved_cidr".to_string(),
                        message: format!("{} is not inside {}", reserved, cidr),
                    })
                }
                None => {
                    return Err(CirrusError::InvalidInput {
                        field: "reserved_cidr".to_string(),
                        message: "reserved range given without a CIDR".to_string(),
                    })
                }
            }
        }

        Ok(())
    }
}

/// Observer notified around every persisted state change
///
/// `pre_transition` runs before the compare-and-swap; `post_transition`
/// runs after it with the outcome. Network-element collaborators hook in
/// here. An out-of-band destroy is reported with `event == None`.
pub trait StateListener: Send + Sync {
    fn pre_transition(&self, network: &Network, event: NetworkEvent, target: NetworkState) {
        let _ = (network, event, target);
    }

    fn post_transition(
        &self,
        network: &Network,
        from: NetworkState,
        event: Option<NetworkEvent>,
        succeeded: bool,
    );
}

/// Network table access with compare-and-swap state updates
#[derive(Clone)]
pub struct NetworkStore {
    executor: TransactionExecutor,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl NetworkStore {
    pub fn new(executor: TransactionExecutor) -> Self {
        Self {
            executor,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Create a network in `Allocated`
    pub fn allocate(&self, request: NewNetwork) -> CirrusResult<Network> {
        self.insert(request, NetworkState::Allocated)
    }

    /// Create an administrator pre-provisioned network in `Setup`
    pub fn allocate_preconfigured(&self, request: NewNetwork) -> CirrusResult<Network> {
        self.insert(request, NetworkState::Setup)
    }

    fn insert(&self, request: NewNetwork, state: NetworkState) -> CirrusResult<Network> {
        request.validate()?;

        let now = Utc::now();
        let network = Network {
            id: NetworkId::new(),
            name: request.name,
            account: request.account,
            broadcast_domain: request.broadcast_domain,
            traffic_type: request.traffic_type,
            guest_type: request.guest_type,
            cidr: request.cidr,
            reserved_cidr: request.reserved_cidr,
            gateway: request.gateway,
            offering_id: request.offering_id,
            acl_type: request.acl_type,
            state,
            created: now,
            updated: now,
        };

        let key = network.id.to_string();
        let bytes = encode(&network, "network")?;
        self.executor.write("allocate network", |txn| {
            let mut table = txn.open_table(NETWORK_TABLE)?;
            table.insert(key.as_str(), bytes.as_slice())?;
            Ok(())
        })?;

        info!("Allocated network {} ({}) in {}", network.name, network.id, state);
        Ok(network)
    }

    pub fn find(&self, id: NetworkId) -> CirrusResult<Option<Network>> {
        let key = id.to_string();
        self.executor.read("find network", |txn| {
            let table = txn.open_table(NETWORK_TABLE)?;
            let value = table.get(key.as_str())?;
            value.map(|v| decode(v.value(), "network")).transpose()
        })
    }

    pub fn get(&self, id: NetworkId) -> CirrusResult<Network> {
        self.find(id)?.ok_or_else(|| CirrusError::NotFound {
            resource: format!("network {}", id),
        })
    }

    pub fn list(&self) -> CirrusResult<Vec<Network>> {
        self.executor.read("list networks", |txn| {
            let table = txn.open_table(NETWORK_TABLE)?;
            let mut networks = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                networks.push(decode::<Network>(value.value(), "network")?);
            }
            networks.sort_by_key(|n| n.created);
            Ok(networks)
        })
    }

    pub fn list_by_state(&self, state: NetworkState) -> CirrusResult<Vec<Network>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|n| n.state == state)
            .collect())
    }

    /// Apply `event` to the network the caller last observed
    ///
    /// Returns the updated record. The table lookup happens before any
    /// storage access, so an invalid event never touches the row.
    pub fn transition(&self, network: &Network, event: NetworkEvent) -> CirrusResult<Network> {
        let target = network.state.transition(event)?;

        for listener in &self.listeners {
            listener.pre_transition(network, event, target);
        }

        let result = self.compare_and_set(network, target, "network transition");

        let notified = result.as_ref().unwrap_or(network);
        for listener in &self.listeners {
            listener.post_transition(notified, network.state, Some(event), result.is_ok());
        }

        match &result {
            Ok(updated) => debug!(
                "Network {} moved {} -> {} on {:?}",
                updated.id, network.state, updated.state, event
            ),
            Err(e) => warn!("Network {} transition on {:?} failed: {}", network.id, event, e),
        }
        result
    }

    /// Retire a network that holds no resources
    ///
    /// Only `Allocated` and `Setup` networks can be retired; everything
    /// else must be shut down through the event table first.
    pub fn mark_destroyed(&self, network: &Network) -> CirrusResult<Network> {
        if !network.state.can_mark_destroyed() {
            return Err(CirrusError::InvalidStateTransition {
                from: network.state,
                action: "MarkDestroyed".to_string(),
            });
        }

        let result = self.compare_and_set(network, NetworkState::Destroy, "mark network destroyed");

        let notified = result.as_ref().unwrap_or(network);
        for listener in &self.listeners {
            listener.post_transition(notified, network.state, None, result.is_ok());
        }

        if let Ok(destroyed) = &result {
            info!("Network {} marked for reclamation", destroyed.id);
        }
        result
    }

    /// Physically remove every network in `Destroy`
    pub fn reclaim_destroyed(&self) -> CirrusResult<usize> {
        let reclaimed = self.executor.write("reclaim destroyed networks", |txn| {
            let mut table = txn.open_table(NETWORK_TABLE)?;

            let mut doomed = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let network: Network = decode(value.value(), "network")?;
                if network.state == NetworkState::Destroy {
                    doomed.push(key.value().to_string());
                }
            }

            for key in &doomed {
                table.remove(key.as_str())?;
            }
            Ok(doomed.len())
        })?;

        if reclaimed > 0 {
            info!("Reclaimed {} destroyed networks", reclaimed);
        }
        Ok(reclaimed)
    }

    fn compare_and_set(
        &self,
        expected: &Network,
        target: NetworkState,
        operation: &str,
    ) -> CirrusResult<Network> {
        let key = expected.id.to_string();

        self.executor.write(operation, |txn| {
            crate::fail_point!(
                crate::failpoints::names::NETWORK_TRANSITION,
                CirrusError::StorageContention {
                    operation: operation.to_string(),
                }
            );

            let mut table = txn.open_table(NETWORK_TABLE)?;

            let mut stored: Network = {
                let value = table.get(key.as_str())?.ok_or_else(|| CirrusError::NotFound {
                    resource: format!("network {}", expected.id),
                })?;
                decode(value.value(), "network")?
            };

            if stored.state != expected.state {
                return Err(CirrusError::ConcurrentStateConflict {
                    network: expected.id.to_string(),
                    expected: expected.state,
                    actual: stored.state,
                });
            }

            stored.state = target;
            stored.updated = Utc::now();

            let bytes = encode(&stored, "network")?;
            table.insert(key.as_str(), bytes.as_slice())?;
            Ok(stored)
        })
    }
}
