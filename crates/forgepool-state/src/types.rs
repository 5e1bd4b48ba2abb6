//! Domain types for the Forgepool instance store.
//!
//! An [`Instance`] is the pool's durable record of one compute instance it
//! owns. All types are serializable to/from JSON for storage in redb.

use serde::{Deserialize, Serialize};

/// Unique identifier for a pool-owned instance.
///
/// Generated by the pool at launch time (`agent-<uuid>`) and passed to the
/// provider as the instance name, so a failed launch keeps a stable identity
/// across retries.
pub type InstanceId = String;

/// Lifecycle state of a pool-owned instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Launch issued; the provider has not reported the instance running yet.
    Provisioning,
    /// Provider reports the instance running; the agent has not registered
    /// with the coordinator yet.
    Registering,
    /// The agent is registered and eligible for work.
    Active,
    /// Selected for removal; no new jobs, waiting for in-flight work.
    Draining,
    /// Terminate issued (or pending) against the provider.
    Terminating,
    /// Provider confirmed termination; the record is about to be deleted.
    Terminated,
}

impl InstanceState {
    /// Whether this state counts toward pool capacity when sizing the pool.
    pub fn is_capacity(self) -> bool {
        matches!(
            self,
            InstanceState::Provisioning | InstanceState::Registering | InstanceState::Active
        )
    }

    /// Stable lowercase label, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Registering => "registering",
            InstanceState::Active => "active",
            InstanceState::Draining => "draining",
            InstanceState::Terminating => "terminating",
            InstanceState::Terminated => "terminated",
        }
    }

    /// All lifecycle states, in lifecycle order.
    pub fn all() -> [InstanceState; 6] {
        [
            InstanceState::Provisioning,
            InstanceState::Registering,
            InstanceState::Active,
            InstanceState::Draining,
            InstanceState::Terminating,
            InstanceState::Terminated,
        ]
    }
}

/// Durable record of a single pool-owned instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub state: InstanceState,
    /// Unix timestamp (seconds) when the launch was decided.
    pub created_at: u64,
    /// Unix timestamp of the last transition or provider confirmation.
    pub last_seen_at: u64,
    /// Credential the agent uses to register with the coordinator.
    /// Issued at launch, never reused across instances.
    pub agent_token: String,
    /// Consecutive provider-call failures for this instance.
    pub failure_count: u32,
    /// Optimistic-lock counter, bumped on every store write.
    pub version: u64,
}

impl Instance {
    /// Build a fresh record for a launch decision.
    pub fn new(id: impl Into<InstanceId>, agent_token: impl Into<String>, now: u64) -> Self {
        Self {
            id: id.into(),
            state: InstanceState::Provisioning,
            created_at: now,
            last_seen_at: now,
            agent_token: agent_token.into(),
            failure_count: 0,
            version: 0,
        }
    }
}
