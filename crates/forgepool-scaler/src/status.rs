//! Pool status snapshot published for the operational API.

use serde::Serialize;

use forgepool_state::{Instance, InstanceState};

/// Read-only view of the pool, refreshed after every reconcile cycle and
/// handed to the API over a `tokio::sync::watch` channel.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Instances counting toward capacity (provisioning + registering + active).
    pub current_size: u32,
    /// Target size from the last successful demand read.
    pub desired_size: u32,
    pub min_size: u32,
    pub max_size: u32,
    /// Pending jobs at the last successful demand read.
    pub pending_jobs: u64,
    /// Busy agents at the last successful demand read.
    pub busy_agents: u32,
    pub provisioning: u32,
    pub registering: u32,
    pub active: u32,
    pub draining: u32,
    pub terminating: u32,
    pub terminated: u32,
    /// Unix timestamp of the last completed cycle.
    pub updated_at: u64,
}

impl PoolStatus {
    /// Recount the per-state gauges from the store's records.
    pub fn recount(&mut self, instances: &[Instance]) {
        let count =
            |state: InstanceState| instances.iter().filter(|i| i.state == state).count() as u32;
        self.provisioning = count(InstanceState::Provisioning);
        self.registering = count(InstanceState::Registering);
        self.active = count(InstanceState::Active);
        self.draining = count(InstanceState::Draining);
        self.terminating = count(InstanceState::Terminating);
        self.terminated = count(InstanceState::Terminated);
        self.current_size = self.provisioning + self.registering + self.active;
    }

    /// Per-state gauge values, labeled with the serialized state names.
    pub fn state_counts(&self) -> [(&'static str, u32); 6] {
        [
            ("provisioning", self.provisioning),
            ("registering", self.registering),
            ("active", self.active),
            ("draining", self.draining),
            ("terminating", self.terminating),
            ("terminated", self.terminated),
        ]
    }
}
