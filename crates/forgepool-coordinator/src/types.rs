//! Demand-side types read from the CI coordinator.

use serde::{Deserialize, Serialize};

/// One registered agent as reported by the coordinator.
///
/// Agents register under the id of the instance they run on, so
/// `agent_id` doubles as the instance id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentInfo {
    pub agent_id: String,
    pub busy: bool,
}

/// Point-in-time read of coordinator demand. Never persisted; recomputed
/// every reconcile cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DemandSnapshot {
    pub pending_jobs: u64,
    pub agents: Vec<AgentInfo>,
}

impl DemandSnapshot {
    /// Number of agents currently running a job.
    pub fn busy_agents(&self) -> u32 {
        self.agents.iter().filter(|a| a.busy).count() as u32
    }

    /// Whether an agent with this id is registered.
    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.agents.iter().any(|a| a.agent_id == agent_id)
    }

    /// Whether an agent with this id is running a job. Unregistered
    /// agents count as idle.
    pub fn is_busy(&self, agent_id: &str) -> bool {
        self.agents
            .iter()
            .any(|a| a.agent_id == agent_id && a.busy)
    }
}
