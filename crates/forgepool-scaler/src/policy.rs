//! Scale policy — maps a demand snapshot to a target pool size.

use forgepool_coordinator::DemandSnapshot;

/// Pool sizing policy, immutable for the life of the process.
///
/// The target is `busy_agents + ceil(pending_jobs / jobs_per_agent)`,
/// clamped to `[min_size, max_size]`: every busy agent keeps its
/// instance, and queued work is covered at the configured packing ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePolicy {
    pub min_size: u32,
    pub max_size: u32,
    /// Queued jobs one fresh agent is expected to absorb.
    pub jobs_per_agent: u32,
}

impl ScalePolicy {
    /// Compute the target pool size for a demand snapshot.
    pub fn desired_size(&self, demand: &DemandSnapshot) -> u32 {
        let jobs_per_agent = u64::from(self.jobs_per_agent.max(1));
        let needed =
            u64::from(demand.busy_agents()) + demand.pending_jobs.div_ceil(jobs_per_agent);
        needed
            .min(u64::from(self.max_size))
            .max(u64::from(self.min_size)) as u32
    }
}
