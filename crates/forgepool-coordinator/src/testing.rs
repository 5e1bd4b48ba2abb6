//! Programmable coordinator double for reconciliation tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::{AgentInfo, DemandSnapshot};
use crate::{Coordinator, CoordinatorError, CoordinatorResult};

#[derive(Default)]
struct Inner {
    snapshot: DemandSnapshot,
    unavailable: bool,
    drained: Vec<String>,
}

/// In-memory [`Coordinator`] whose demand is set explicitly by tests.
#[derive(Default)]
pub struct StaticCoordinator {
    inner: Mutex<Inner>,
}

impl StaticCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the demand snapshot returned to callers.
    pub fn set_demand(&self, pending_jobs: u64, agents: Vec<AgentInfo>) {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshot = DemandSnapshot {
            pending_jobs,
            agents,
        };
    }

    /// Register an agent in the reported agent list.
    pub fn add_agent(&self, agent_id: &str, busy: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshot.agents.push(AgentInfo {
            agent_id: agent_id.to_string(),
            busy,
        });
    }

    /// Make every read fail until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    /// Agent ids drained so far, in call order.
    pub fn drained(&self) -> Vec<String> {
        self.inner.lock().unwrap().drained.clone()
    }
}

#[async_trait]
impl Coordinator for StaticCoordinator {
    async fn pending_jobs(&self) -> CoordinatorResult<u64> {
        let inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(CoordinatorError::Unavailable("forced outage".to_string()));
        }
        Ok(inner.snapshot.pending_jobs)
    }

    async fn active_agents(&self) -> CoordinatorResult<Vec<AgentInfo>> {
        let inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(CoordinatorError::Unavailable("forced outage".to_string()));
        }
        Ok(inner.snapshot.agents.clone())
    }

    async fn drain_agent(&self, agent_id: &str) -> CoordinatorResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(CoordinatorError::Unavailable("forced outage".to_string()));
        }
        inner.drained.push(agent_id.to_string());
        Ok(())
    }
}
