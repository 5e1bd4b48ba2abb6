//! Wire types for the provider seam.

use serde::{Deserialize, Serialize};

/// Static launch parameters shared by every instance in the pool.
///
/// Filled from configuration once at startup; per-instance fields (name,
/// agent token) are stamped in by [`LaunchTemplate::to_spec`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchTemplate {
    pub instance_type: String,
    pub region: String,
    pub subnet_id: String,
    pub security_group: String,
    /// Tag identifying pool-owned instances to `list_tagged`.
    pub pool_tag: String,
}

impl LaunchTemplate {
    /// Build the launch spec for one instance.
    ///
    /// The agent token travels in the user-data payload; the agent image
    /// reads it at boot to register with the coordinator.
    pub fn to_spec(&self, name: &str, agent_token: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            instance_type: self.instance_type.clone(),
            region: self.region.clone(),
            subnet_id: self.subnet_id.clone(),
            security_group: self.security_group.clone(),
            pool_tag: self.pool_tag.clone(),
            user_data: format!("FORGEPOOL_AGENT_TOKEN={agent_token}\n"),
        }
    }
}

/// Full specification for a single instance launch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchSpec {
    /// Pool-assigned instance name; the provider must use it as the
    /// instance identifier so retries stay idempotent.
    pub name: String,
    pub instance_type: String,
    pub region: String,
    pub subnet_id: String,
    pub security_group: String,
    pub pool_tag: String,
    /// Boot payload (cloud-init style) carrying the agent token.
    pub user_data: String,
}

/// Provider-reported lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Pending,
    Running,
    Stopping,
    Terminated,
}

/// One provider-reported instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderInstance {
    pub id: String,
    pub state: ProviderState,
    /// Agent endpoint (`ip:port`) once the instance is reachable.
    pub address: Option<String>,
    /// Unix timestamp (seconds) the provider launched the instance.
    pub launched_at: u64,
}
