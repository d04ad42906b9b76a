//! Partition assignment for incoming events

use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

// Fixed seeds keep key placement identical across restarts of the same build.
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionPolicy {
    /// Rotate through partitions regardless of content.
    RoundRobin,
    /// Hash the event key; keyless events rotate.
    #[default]
    KeyHash,
}

impl FromStr for PartitionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(PartitionPolicy::RoundRobin),
            "key-hash" | "key_hash" | "keyhash" | "hash" => Ok(PartitionPolicy::KeyHash),
            other => Err(format!("unknown partition policy: {}", other)),
        }
    }
}

impl std::fmt::Display for PartitionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionPolicy::RoundRobin => write!(f, "round-robin"),
            PartitionPolicy::KeyHash => write!(f, "key-hash"),
        }
    }
}

#[derive(Debug)]
pub struct Router {
    policy: PartitionPolicy,
    partitions: usize,
    next: AtomicUsize,
    hasher: ahash::RandomState,
}

impl Router {
    pub fn new(policy: PartitionPolicy, partitions: usize) -> Self {
        Self {
            policy,
            partitions: partitions.max(1),
            next: AtomicUsize::new(0),
            hasher: ahash::RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]),
        }
    }

    pub fn policy(&self) -> PartitionPolicy {
        self.policy
    }

    pub fn route(&self, event: &Event) -> usize {
        match (self.policy, event.key.as_deref()) {
            (PartitionPolicy::KeyHash, Some(key)) => {
                (self.hasher.hash_one(key) % self.partitions as u64) as usize
            }
            _ => self.next.fetch_add(1, Ordering::Relaxed) % self.partitions,
        }
    }
}
