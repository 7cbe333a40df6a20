//! Pinhole manager configuration

use crate::allocator::AllocationPolicy;
use pinhole_proto::DEFAULT_LABEL_CAPACITY;
use serde::{Deserialize, Serialize};

/// Settings applied to every pinhole a manager creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Anchor holding this manager's rules
    pub anchor: String,
    /// Log packets matching created rules
    pub log_packets: bool,
    /// Queue to assign matching packets to
    pub queue: Option<String>,
    /// Tag to put on matching packets
    pub tag: Option<String>,
    /// Byte capacity of a rule label in the store
    pub label_capacity: usize,
    pub allocation_policy: AllocationPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            anchor: "miniupnpd".to_string(),
            log_packets: false,
            queue: None,
            tag: None,
            label_capacity: DEFAULT_LABEL_CAPACITY,
            allocation_policy: AllocationPolicy::Heuristic,
        }
    }
}

impl ManagerConfig {
    pub fn with_anchor(mut self, anchor: impl Into<String>) -> Self {
        self.anchor = anchor.into();
        self
    }

    pub fn with_allocation_policy(mut self, policy: AllocationPolicy) -> Self {
        self.allocation_policy = policy;
        self
    }
}
