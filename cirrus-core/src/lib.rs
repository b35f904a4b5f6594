pub mod error;
pub mod types;
pub mod failpoints;
pub mod patterns;
pub mod config;
pub mod storage;
pub mod capability;
pub mod network_state;
pub mod network;
pub mod offering;
pub mod orchestrator;
pub mod ruleset_log;
pub mod work_queue;
pub mod security_group;
pub mod convergence;
pub mod sync;

pub use capability::CapabilityRegistry;
pub use config::CirrusConfig;
pub use error::{CirrusError, CirrusResult};
pub use network_state::{NetworkEvent, NetworkState};
