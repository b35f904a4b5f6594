//! Network lifecycle states and the transition table
//!
//! The table is a pure function of `(state, event)`; persistence is layered
//! on top by [`NetworkStore`](crate::network::NetworkStore), which applies a
//! transition only if the stored state still equals the source state.
//!
//! `Destroy` is not reachable through any event. It is an out-of-band
//! terminal marker set by an administrative destroy.

use serde::{Deserialize, Serialize};

use crate::error::{CirrusError, CirrusResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkState {
    /// Allocated in the database but holding no resources
    Allocated,
    /// Pre-provisioned by an administrator; never implemented by the orchestrator
    Setup,
    /// Network elements are being configured
    Implementing,
    /// Network elements are configured and the network is usable
    Implemented,
    /// Network elements are being torn down
    Shutdown,
    /// Retired; waiting to be reclaimed
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkEvent {
    ImplementNetwork,
    DestroyNetwork,
    OperationSucceeded,
    OperationFailed,
}

impl NetworkState {
    pub const ALL: [NetworkState; 6] = [
        NetworkState::Allocated,
        NetworkState::Setup,
        NetworkState::Implementing,
        NetworkState::Implemented,
        NetworkState::Shutdown,
        NetworkState::Destroy,
    ];

    /// Target state for `event`, if the table has an entry for it
    pub fn next(self, event: NetworkEvent) -> Option<NetworkState> {
        use NetworkEvent::*;
        use NetworkState::*;

        match (self, event) {
            (Allocated, ImplementNetwork) => Some(Implementing),
            (Implementing, OperationSucceeded) => Some(Implemented),
            (Implementing, OperationFailed) => Some(Shutdown),
            (Implemented, DestroyNetwork) => Some(Shutdown),
            (Shutdown, OperationSucceeded) => Some(Allocated),
            (Shutdown, OperationFailed) => Some(Implemented),
            _ => None,
        }
    }

    /// Apply `event`, failing with `InvalidStateTransition` when no entry matches
    pub fn transition(self, event: NetworkEvent) -> CirrusResult<NetworkState> {
        self.next(event)
            .ok_or_else(|| CirrusError::InvalidStateTransition {
                from: self,
                action: format!("{:?}", event),
            })
    }

    /// Events accepted in this state
    pub fn accepted_events(self) -> Vec<NetworkEvent> {
        NetworkEvent::ALL
            .into_iter()
            .filter(|e| self.next(*e).is_some())
            .collect()
    }

    /// Whether an administrator may retire a network in this state
    pub fn can_mark_destroyed(self) -> bool {
        matches!(self, NetworkState::Allocated | NetworkState::Setup)
    }
}

impl NetworkEvent {
    pub const ALL: [NetworkEvent; 4] = [
        NetworkEvent::ImplementNetwork,
        NetworkEvent::DestroyNetwork,
        NetworkEvent::OperationSucceeded,
        NetworkEvent::OperationFailed,
    ];
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for NetworkState {
    type Err = CirrusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NetworkState::ALL
            .into_iter()
            .find(|state| state.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| CirrusError::InvalidInput {
                field: "state".to_string(),
                message: format!("unknown network state '{}'", s),
            })
    }
}
