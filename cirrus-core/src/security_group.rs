//! Security-group rules and rule-set signatures
//!
//! A [`RuleSet`] is kept in canonical order, so two sets with the same rules
//! always hash to the same [`RuleSignature`] regardless of how they were
//! assembled. The signature of an empty set is the empty string, which is
//! also what an agent that never received rules reports.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CirrusError, CirrusResult};
use crate::types::VmId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

/// Where allowed traffic comes from (ingress) or goes to (egress)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RuleTarget {
    Cidr(IpNet),
    /// Members of another security group
    Group(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub direction: Direction,
    pub protocol: Protocol,
    /// Inclusive port range; `None` for protocols without ports
    pub ports: Option<(u16, u16)>,
    pub target: RuleTarget,
}

impl SecurityGroupRule {
    pub fn new(
        direction: Direction,
        protocol: Protocol,
        ports: Option<(u16, u16)>,
        target: RuleTarget,
    ) -> CirrusResult<Self> {
        match (protocol, ports) {
            (Protocol::Tcp | Protocol::Udp, Some((start, end))) if start > end => {
                return Err(CirrusError::InvalidInput {
                    field: "ports".to_string(),
                    message: format!("start port {} is above end port {}", start, end),
                })
            }
            (Protocol::Tcp | Protocol::Udp, None) => {
                return Err(CirrusError::InvalidInput {
                    field: "ports".to_string(),
                    message: format!("{:?} rules need a port range", protocol),
                })
            }
            (Protocol::Icmp | Protocol::All, Some(_)) => {
                return Err(CirrusError::InvalidInput {
                    field: "ports".to_string(),
                    message: format!("{:?} rules take no port range", protocol),
                })
            }
            _ => {}
        }

        if let RuleTarget::Group(name) = &target {
            if name.trim().is_empty() {
                return Err(CirrusError::InvalidInput {
                    field: "target".to_string(),
                    message: "source group name cannot be empty".to_string(),
                });
            }
        }

        Ok(Self {
            direction,
            protocol,
            ports,
            target,
        })
    }

    pub fn ingress_tcp(port: u16, cidr: IpNet) -> CirrusResult<Self> {
        Self::new(
            Direction::Ingress,
            Protocol::Tcp,
            Some((port, port)),
            RuleTarget::Cidr(cidr),
        )
    }
}

impl fmt::Display for SecurityGroupRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        };
        let protocol = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "all",
        };
        write!(f, "{} {}", direction, protocol)?;
        if let Some((start, end)) = self.ports {
            write!(f, " {}-{}", start, end)?;
        }
        match &self.target {
            RuleTarget::Cidr(cidr) => write!(f, " cidr:{}", cidr),
            RuleTarget::Group(group) => write!(f, " group:{}", group),
        }
    }
}

/// Content fingerprint of a rule set
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleSignature(String);

impl RuleSignature {
    /// Signature of an agent with no rules
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RuleSignature {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RuleSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rules applying to one VM, in canonical order without duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<SecurityGroupRule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<SecurityGroupRule>) -> Self {
        rules.sort();
        rules.dedup();
        Self { rules }
    }

    pub fn rules(&self) -> &[SecurityGroupRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Hex SHA-256 over one canonical line per rule
    pub fn signature(&self) -> RuleSignature {
        if self.rules.is_empty() {
            return RuleSignature::empty();
        }

        let mut hasher = Sha256::new();
        for rule in &self.rules {
            hasher.update(rule.to_string().as_bytes());
            hasher.update(b"\n");
        }
        RuleSignature(hex::encode(hasher.finalize()))
    }
}

impl FromIterator<SecurityGroupRule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = SecurityGroupRule>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Authoritative source of each VM's effective rules
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn rules_for_vm(&self, vm: VmId) -> CirrusResult<RuleSet>;
}

/// Policy held in memory; VMs without an entry have no rules
#[derive(Debug, Default)]
pub struct InMemoryPolicy {
    rules: DashMap<VmId, RuleSet>,
}

impl InMemoryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rules(&self, vm: VmId, rules: RuleSet) {
        self.rules.insert(vm, rules);
    }

    pub fn clear(&self, vm: VmId) {
        self.rules.remove(&vm);
    }
}

#[async_trait]
impl PolicySource for InMemoryPolicy {
    async fn rules_for_vm(&self, vm: VmId) -> CirrusResult<RuleSet> {
        Ok(self
            .rules
            .get(&vm)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ssh() -> SecurityGroupRule {
        SecurityGroupRule::ingress_tcp(22, "10.0.0.0/8".parse().unwrap()).unwrap()
    }

    fn ping() -> SecurityGroupRule {
        SecurityGroupRule::new(
            Direction::Ingress,
            Protocol::Icmp,
            None,
            RuleTarget::Group("web".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn empty_set_has_empty_signature() {
        assert_eq!(RuleSet::default().signature(), RuleSignature::empty());
        assert!(RuleSet::default().signature().is_empty());
    }

    #[test]
    fn signature_ignores_order_and_duplicates() {
        let a = RuleSet::new(vec![ssh(), ping()]);
        let b = RuleSet::new(vec![ping(), ssh(), ssh()]);

        assert_eq!(a, b);
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature().as_str().len(), 64);
    }

    #[test]
    fn signature_changes_with_content() {
        let a = RuleSet::new(vec![ssh()]);
        let b = RuleSet::new(vec![ssh(), ping()]);
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn rule_validation() {
        let cidr = RuleTarget::Cidr("0.0.0.0/0".parse().unwrap());
        assert!(SecurityGroupRule::new(Direction::Egress, Protocol::Tcp, Some((90, 80)), cidr.clone()).is_err());
        assert!(SecurityGroupRule::new(Direction::Egress, Protocol::Udp, None, cidr.clone()).is_err());
        assert!(SecurityGroupRule::new(Direction::Egress, Protocol::Icmp, Some((0, 0)), cidr.clone()).is_err());
        assert!(SecurityGroupRule::new(Direction::Egress, Protocol::All, None, cidr).is_ok());
        assert!(SecurityGroupRule::new(
            Direction::Ingress,
            Protocol::All,
            None,
            RuleTarget::Group(" ".to_string())
        )
        .is_err());
    }

    #[test]
    fn canonical_line_format() {
        assert_eq!(ssh().to_string(), "ingress tcp 22-22 cidr:10.0.0.0/8");
        assert_eq!(ping().to_string(), "ingress icmp group:web");
    }

    #[tokio::test]
    async fn in_memory_policy() {
        let policy = InMemoryPolicy::new();
        assert!(policy.rules_for_vm(VmId(1)).await.unwrap().is_empty());

        policy.set_rules(VmId(1), RuleSet::new(vec![ssh()]));
        assert_eq!(policy.rules_for_vm(VmId(1)).await.unwrap().len(), 1);

        policy.clear(VmId(1));
        assert!(policy.rules_for_vm(VmId(1)).await.unwrap().is_empty());
    }
}
