//! forgepool-coordinator — CI coordinator seam for Forgepool.
//!
//! The pool reads job demand from the coordinator and tells it when an
//! agent should stop taking work. Both go through the [`Coordinator`]
//! trait so the reconcile loop can be tested against the
//! [`StaticCoordinator`] double.
//!
//! Any read failure collapses into [`CoordinatorError::Unavailable`]: the
//! loop must interpret it as "skip scaling this cycle", never as "the
//! queue is empty".

pub mod http;
pub mod testing;
pub mod types;

pub use http::HttpCoordinator;
pub use testing::StaticCoordinator;
pub use types::{AgentInfo, DemandSnapshot};

use async_trait::async_trait;
use thiserror::Error;

/// Result type alias for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors returned by the coordinator seam.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The coordinator could not be read or did not answer in time.
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),
}

/// The CI coordinator the pool serves.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Number of jobs waiting for an agent.
    async fn pending_jobs(&self) -> CoordinatorResult<u64>;

    /// Currently registered agents and whether they are running a job.
    async fn active_agents(&self) -> CoordinatorResult<Vec<AgentInfo>>;

    /// Tell the coordinator to stop assigning jobs to an agent.
    ///
    /// Draining an agent the coordinator does not know is a no-op.
    async fn drain_agent(&self, agent_id: &str) -> CoordinatorResult<()>;

    /// Combined demand read for one reconcile cycle.
    async fn snapshot(&self) -> CoordinatorResult<DemandSnapshot> {
        let pending_jobs = self.pending_jobs().await?;
        let agents = self.active_agents().await?;
        Ok(DemandSnapshot {
            pending_jobs,
            agents,
        })
    }
}
