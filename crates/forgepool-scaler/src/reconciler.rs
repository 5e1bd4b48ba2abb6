//! Reconciler — the observe-diff-act loop that sizes the pool.
//!
//! Each cycle reads a demand snapshot from the coordinator and the live
//! instance list from the provider, walks every store record through its
//! lifecycle, launches up to the target size, drains down to it, and
//! publishes a [`PoolStatus`] for the API.
//!
//! Failure semantics: a failed launch or terminate is retried on later
//! cycles with exponential per-instance backoff; after
//! `ReconcilerConfig::max_failures` consecutive failures the instance is
//! abandoned with an alert. A failed demand read skips the cycle's scale
//! decisions but never shrinks the pool; a failed provider list aborts
//! the cycle and the loop retries on the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use forgepool_coordinator::{Coordinator, DemandSnapshot};
use forgepool_provider::{LaunchTemplate, Provider, ProviderError, ProviderInstance, ProviderState};
use forgepool_state::{Instance, InstanceState, InstanceStore};

use crate::epoch_secs;
use crate::policy::ScalePolicy;
use crate::status::PoolStatus;

/// Tuning knobs for the reconcile loop.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub policy: ScalePolicy,
    pub template: LaunchTemplate,
    /// Consecutive provider-call failures before an instance is abandoned.
    pub max_failures: u32,
    /// Backoff after the first failure; doubles per consecutive failure.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Compare-and-set retries within a single cycle.
    pub cas_retries: u32,
}

impl ReconcilerConfig {
    pub fn new(policy: ScalePolicy, template: LaunchTemplate) -> Self {
        Self {
            policy,
            template,
            max_failures: 5,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(900),
            cas_retries: 3,
        }
    }
}

/// What one reconcile cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub launched: u32,
    pub drained: u32,
    pub terminated: u32,
    pub abandoned: u32,
    /// True when the demand read failed and scale decisions were skipped.
    pub scaling_skipped: bool,
}

/// The pool's single logical owner: computes the target size and converges
/// the store and the provider toward it.
pub struct Reconciler {
    store: InstanceStore,
    provider: Arc<dyn Provider>,
    coordinator: Arc<dyn Coordinator>,
    config: ReconcilerConfig,
    status_tx: watch::Sender<PoolStatus>,
}

impl Reconciler {
    /// Create a reconciler and the status receiver the API reads from.
    pub fn new(
        store: InstanceStore,
        provider: Arc<dyn Provider>,
        coordinator: Arc<dyn Coordinator>,
        config: ReconcilerConfig,
    ) -> (Self, watch::Receiver<PoolStatus>) {
        let initial = PoolStatus {
            min_size: config.policy.min_size,
            max_size: config.policy.max_size,
            ..PoolStatus::default()
        };
        let (status_tx, status_rx) = watch::channel(initial);
        (
            Self {
                store,
                provider,
                coordinator,
                config,
                status_tx,
            },
            status_rx,
        )
    }

    /// Run the reconcile loop until shutdown.
    ///
    /// The ticker skips missed ticks, so a cycle that outlives the
    /// interval delays the next cycle instead of queueing a burst.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "reconcile loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile().await {
                        Ok(report) => {
                            debug!(?report, "reconcile cycle finished");
                        }
                        Err(e) => {
                            error!(error = %e, "reconcile cycle failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconcile loop shutting down");
                    break;
                }
            }
        }
    }

    /// Run one reconcile cycle against the wall clock.
    pub async fn reconcile(&self) -> anyhow::Result<CycleReport> {
        self.reconcile_at(epoch_secs()).await
    }

    /// Run one reconcile cycle with an explicit clock (used by tests).
    pub async fn reconcile_at(&self, now: u64) -> anyhow::Result<CycleReport> {
        let mut report = CycleReport::default();

        let demand = match self.coordinator.snapshot().await {
            Ok(demand) => Some(demand),
            Err(e) => {
                warn!(error = %e, "demand read failed, skipping scale decisions this cycle");
                report.scaling_skipped = true;
                None
            }
        };

        let provider_view: HashMap<String, ProviderInstance> = self
            .provider
            .list_tagged(&self.config.template.pool_tag)
            .await
            .map_err(|e| anyhow::anyhow!("provider list failed: {e}"))?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();

        self.sync_pass(now, &provider_view, demand.as_ref())?;
        self.retry_pass(now, &provider_view, &mut report).await?;
        if let Some(demand) = &demand {
            self.scale_pass(now, demand, &mut report).await?;
            self.drain_pass(now, demand)?;
        }
        self.terminate_pass(now, &mut report).await?;
        self.publish_status(now, demand.as_ref())?;

        Ok(report)
    }

    // ── Cycle passes ───────────────────────────────────────────────

    /// Walk records forward from provider and coordinator observations.
    fn sync_pass(
        &self,
        now: u64,
        provider_view: &HashMap<String, ProviderInstance>,
        demand: Option<&DemandSnapshot>,
    ) -> anyhow::Result<()> {
        for inst in self.store.list_all()? {
            if inst.state == InstanceState::Terminated {
                // Leftover from a crash between the Terminated write and
                // the delete.
                match self.store.delete(&inst.id) {
                    Ok(()) | Err(forgepool_state::StateError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            // A terminated provider entry no longer backs the record; the
            // reaper owns that case.
            let remote = provider_view
                .get(&inst.id)
                .filter(|r| r.state != ProviderState::Terminated);
            let Some(remote) = remote else { continue };

            if inst.state == InstanceState::Provisioning && remote.state == ProviderState::Running
            {
                if self
                    .transition(
                        &inst.id,
                        &[InstanceState::Provisioning],
                        InstanceState::Registering,
                        now,
                    )?
                    .is_some()
                {
                    info!(id = %inst.id, "instance running, awaiting agent registration");
                }
                continue;
            }

            if inst.state == InstanceState::Registering
                && demand.is_some_and(|d| d.is_registered(&inst.id))
            {
                if self
                    .transition(
                        &inst.id,
                        &[InstanceState::Registering],
                        InstanceState::Active,
                        now,
                    )?
                    .is_some()
                {
                    info!(id = %inst.id, "agent registered, instance active");
                }
                continue;
            }

            // Provider confirms the record; refresh the liveness stamp.
            // Records with failures keep their timestamp: the failed-attempt
            // time anchors the backoff window.
            if inst.failure_count == 0 {
                match self.store.touch(&inst.id, now) {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Re-issue launches whose earlier attempts failed, once their backoff
    /// window has elapsed.
    async fn retry_pass(
        &self,
        now: u64,
        provider_view: &HashMap<String, ProviderInstance>,
        report: &mut CycleReport,
    ) -> anyhow::Result<()> {
        let pending = self.store.list_where(|i| {
            i.state == InstanceState::Provisioning && i.failure_count > 0
        })?;

        for inst in pending {
            if provider_view.contains_key(&inst.id) {
                // The launch landed after all; the sync pass will move it on.
                continue;
            }
            if inst.failure_count >= self.config.max_failures
                || !self.backoff_elapsed(&inst, now)
            {
                continue;
            }
            let spec = self.config.template.to_spec(&inst.id, &inst.agent_token);
            match self.provider.launch(&spec).await {
                Ok(_) => {
                    info!(id = %inst.id, attempt = inst.failure_count + 1, "launch retry issued");
                    report.launched += 1;
                }
                Err(e) => self.handle_launch_failure(&inst.id, &e, now, report)?,
            }
        }
        Ok(())
    }

    /// Launch up to the target size, or pick idle instances to drain.
    async fn scale_pass(
        &self,
        now: u64,
        demand: &DemandSnapshot,
        report: &mut CycleReport,
    ) -> anyhow::Result<()> {
        let desired = self.config.policy.desired_size(demand);
        let capacity = self.store.list_where(|i| i.state.is_capacity())?;
        let current = capacity.len() as u32;

        if current < desired {
            let shortfall = desired - current;
            info!(current, desired, shortfall, "scaling up");
            for _ in 0..shortfall {
                self.launch_one(now, report).await?;
            }
        } else if current > desired {
            let surplus = (current - desired) as usize;
            // Idle instances only; oldest first.
            let mut candidates: Vec<&Instance> = capacity
                .iter()
                .filter(|i| i.state == InstanceState::Active && !demand.is_busy(&i.id))
                .collect();
            candidates.sort_by_key(|i| i.created_at);

            if !candidates.is_empty() {
                info!(current, desired, surplus, "scaling down");
            }
            for inst in candidates.into_iter().take(surplus) {
                if self
                    .transition(&inst.id, &[InstanceState::Active], InstanceState::Draining, now)?
                    .is_some()
                {
                    if let Err(e) = self.coordinator.drain_agent(&inst.id).await {
                        warn!(id = %inst.id, error = %e, "drain signal failed, agent retires once idle");
                    }
                    info!(id = %inst.id, "instance draining");
                    report.drained += 1;
                }
            }
        }
        Ok(())
    }

    /// Move drained instances to termination once their agent is idle.
    fn drain_pass(&self, now: u64, demand: &DemandSnapshot) -> anyhow::Result<()> {
        for inst in self.store.list_where(|i| i.state == InstanceState::Draining)? {
            if demand.is_busy(&inst.id) {
                continue;
            }
            if self
                .transition(
                    &inst.id,
                    &[InstanceState::Draining],
                    InstanceState::Terminating,
                    now,
                )?
                .is_some()
            {
                info!(id = %inst.id, "drained instance ready for termination");
            }
        }
        Ok(())
    }

    /// Terminate instances marked for removal and drop their records.
    async fn terminate_pass(&self, now: u64, report: &mut CycleReport) -> anyhow::Result<()> {
        for inst in self.store.list_where(|i| i.state == InstanceState::Terminating)? {
            if inst.failure_count >= self.config.max_failures {
                // Abandoned; the reaper reclaims the resource and record.
                continue;
            }
            if inst.failure_count > 0 && !self.backoff_elapsed(&inst, now) {
                continue;
            }
            match self.provider.terminate(&inst.id).await {
                Ok(()) => self.finish_termination(&inst.id, now, report)?,
                Err(e) if e.is_not_found() => {
                    debug!(id = %inst.id, "instance already gone from provider");
                    self.finish_termination(&inst.id, now, report)?;
                }
                Err(e) => self.handle_terminate_failure(&inst.id, &e, now)?,
            }
        }
        Ok(())
    }

    /// Refresh the published pool status after a cycle.
    fn publish_status(&self, now: u64, demand: Option<&DemandSnapshot>) -> anyhow::Result<()> {
        let instances = self.store.list_all()?;
        let desired = demand.map(|d| self.config.policy.desired_size(d));
        self.status_tx.send_modify(|status| {
            status.recount(&instances);
            if let Some(demand) = demand {
                status.pending_jobs = demand.pending_jobs;
                status.busy_agents = demand.busy_agents();
            }
            if let Some(desired) = desired {
                status.desired_size = desired;
            }
            status.updated_at = now;
        });
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Decide a launch, record it write-ahead, and issue it.
    async fn launch_one(&self, now: u64, report: &mut CycleReport) -> anyhow::Result<()> {
        let id = format!("agent-{}", uuid::Uuid::new_v4().simple());
        let agent_token = uuid::Uuid::new_v4().to_string();
        let record = Instance::new(id.clone(), agent_token, now);
        // Write-ahead: a failed launch keeps a stable identity to retry under.
        self.store.put(&record)?;

        let spec = self.config.template.to_spec(&id, &record.agent_token);
        match self.provider.launch(&spec).await {
            Ok(_) => {
                info!(%id, "instance launch issued");
                report.launched += 1;
            }
            Err(e) => self.handle_launch_failure(&id, &e, now, report)?,
        }
        Ok(())
    }

    fn handle_launch_failure(
        &self,
        id: &str,
        err: &ProviderError,
        now: u64,
        report: &mut CycleReport,
    ) -> anyhow::Result<()> {
        if !err.is_transient() {
            error!(%id, error = %err, "permanent provider error, abandoning launch");
            self.transition(id, &[InstanceState::Provisioning], InstanceState::Terminating, now)?;
            report.abandoned += 1;
            return Ok(());
        }
        let failures = match self.store.bump_failure(id, now) {
            Ok(n) => n,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if failures >= self.config.max_failures {
            error!(%id, failures, "launch retry budget exhausted, abandoning instance");
            self.transition(id, &[InstanceState::Provisioning], InstanceState::Terminating, now)?;
            report.abandoned += 1;
        } else {
            warn!(%id, error = %err, failures, "launch failed, will retry with backoff");
        }
        Ok(())
    }

    fn handle_terminate_failure(
        &self,
        id: &str,
        err: &ProviderError,
        now: u64,
    ) -> anyhow::Result<()> {
        let failures = match self.store.bump_failure(id, now) {
            Ok(n) => n,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if failures >= self.config.max_failures {
            error!(%id, failures, error = %err, "terminate retry budget exhausted, reaper will reclaim");
        } else {
            warn!(%id, error = %err, failures, "terminate failed, will retry with backoff");
        }
        Ok(())
    }

    fn finish_termination(
        &self,
        id: &str,
        now: u64,
        report: &mut CycleReport,
    ) -> anyhow::Result<()> {
        self.transition(id, &[InstanceState::Terminating], InstanceState::Terminated, now)?;
        match self.store.delete(id) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        info!(%id, "instance terminated and removed from the pool");
        report.terminated += 1;
        Ok(())
    }

    /// Bounded compare-and-set transition. A lost race or vanished record
    /// is left for the next cycle, never an error.
    fn transition(
        &self,
        id: &str,
        from: &[InstanceState],
        to: InstanceState,
        now: u64,
    ) -> anyhow::Result<Option<Instance>> {
        match self
            .store
            .transition(id, from, to, now, self.config.cas_retries)
        {
            Ok(result) => {
                if result.is_none() {
                    debug!(%id, to = to.as_str(), "transition skipped, state moved concurrently");
                }
                Ok(result)
            }
            Err(e) if e.is_not_found() => {
                debug!(%id, "transition skipped, record gone");
                Ok(None)
            }
            Err(e) if e.is_conflict() => {
                warn!(%id, error = %e, "transition lost the version race, leaving for next cycle");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn backoff_for(&self, failure_count: u32) -> Duration {
        let exp = failure_count.saturating_sub(1).min(16);
        let factor = 2u32.saturating_pow(exp);
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_max)
    }

    fn backoff_elapsed(&self, inst: &Instance, now: u64) -> bool {
        now >= inst
            .last_seen_at
            .saturating_add(self.backoff_for(inst.failure_count).as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgepool_coordinator::{AgentInfo, StaticCoordinator};
    use forgepool_provider::MemoryProvider;

    const T0: u64 = 1_000_000;

    fn template() -> LaunchTemplate {
        LaunchTemplate {
            instance_type: "t2.medium".to_string(),
            region: "eu-central-1".to_string(),
            subnet_id: "subnet-1".to_string(),
            security_group: "sg-1".to_string(),
            pool_tag: "forgepool".to_string(),
        }
    }

    fn policy(min: u32, max: u32) -> ScalePolicy {
        ScalePolicy {
            min_size: min,
            max_size: max,
            jobs_per_agent: 1,
        }
    }

    #[allow(clippy::type_complexity)]
    fn setup(
        policy: ScalePolicy,
    ) -> (
        Reconciler,
        watch::Receiver<PoolStatus>,
        Arc<MemoryProvider>,
        Arc<StaticCoordinator>,
        InstanceStore,
    ) {
        let store = InstanceStore::open_in_memory().unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let coordinator = Arc::new(StaticCoordinator::new());
        let config = ReconcilerConfig::new(policy, template());
        let (reconciler, status_rx) = Reconciler::new(
            store.clone(),
            provider.clone() as Arc<dyn Provider>,
            coordinator.clone() as Arc<dyn Coordinator>,
            config,
        );
        (reconciler, status_rx, provider, coordinator, store)
    }

    fn put_instance(store: &InstanceStore, id: &str, state: InstanceState, created_at: u64) {
        let mut inst = Instance::new(id, format!("token-{id}"), created_at);
        inst.state = state;
        store.put(&inst).unwrap();
    }

    // ── Scale-up ───────────────────────────────────────────────────

    #[tokio::test]
    async fn scales_up_to_cover_queue() {
        let (reconciler, _, provider, coordinator, store) = setup(policy(1, 4));
        // One active instance, its agent busy; three jobs queued.
        put_instance(&store, "agent-0", InstanceState::Active, T0 - 100);
        coordinator.set_demand(
            3,
            vec![AgentInfo {
                agent_id: "agent-0".to_string(),
                busy: true,
            }],
        );

        let report = reconciler.reconcile_at(T0).await.unwrap();

        // desired = clamp(1 + 3, 1, 4) = 4 → launch 3 more.
        assert_eq!(report.launched, 3);
        assert_eq!(provider.launch_attempts(), 3);
        let provisioning = store
            .list_where(|i| i.state == InstanceState::Provisioning)
            .unwrap();
        assert_eq!(provisioning.len(), 3);
    }

    #[tokio::test]
    async fn empty_pool_fills_to_min() {
        let (reconciler, _, provider, coordinator, _) = setup(policy(1, 4));
        coordinator.set_demand(0, vec![]);

        let report = reconciler.reconcile_at(T0).await.unwrap();

        assert_eq!(report.launched, 1);
        assert_eq!(provider.launch_attempts(), 1);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_without_demand_change() {
        let (reconciler, _, provider, coordinator, _) = setup(policy(1, 4));
        coordinator.set_demand(0, vec![]);

        reconciler.reconcile_at(T0).await.unwrap();
        let second = reconciler.reconcile_at(T0 + 30).await.unwrap();

        // No additional launches or terminates.
        assert_eq!(second, CycleReport::default());
        assert_eq!(provider.launch_attempts(), 1);
        assert_eq!(provider.terminate_attempts(), 0);
    }

    #[tokio::test]
    async fn fresh_tokens_per_launch() {
        let (reconciler, _, _, coordinator, store) = setup(policy(2, 4));
        coordinator.set_demand(0, vec![]);

        reconciler.reconcile_at(T0).await.unwrap();

        let instances = store.list_all().unwrap();
        assert_eq!(instances.len(), 2);
        assert_ne!(instances[0].agent_token, instances[1].agent_token);
    }

    // ── Lifecycle promotion ────────────────────────────────────────

    #[tokio::test]
    async fn provisioning_becomes_registering_when_running() {
        let (reconciler, _, provider, coordinator, store) = setup(policy(1, 4));
        coordinator.set_demand(0, vec![]);

        reconciler.reconcile_at(T0).await.unwrap();
        let id = store.list_all().unwrap()[0].id.clone();

        provider.set_running(&id);
        reconciler.reconcile_at(T0 + 30).await.unwrap();

        assert_eq!(store.get(&id).unwrap().state, InstanceState::Registering);
    }

    #[tokio::test]
    async fn registering_becomes_active_when_agent_appears() {
        let (reconciler, _, provider, coordinator, store) = setup(policy(1, 4));
        coordinator.set_demand(0, vec![]);

        reconciler.reconcile_at(T0).await.unwrap();
        let id = store.list_all().unwrap()[0].id.clone();
        provider.set_running(&id);
        reconciler.reconcile_at(T0 + 30).await.unwrap();

        coordinator.add_agent(&id, false);
        reconciler.reconcile_at(T0 + 60).await.unwrap();

        assert_eq!(store.get(&id).unwrap().state, InstanceState::Active);
    }

    // ── Scale-down ─────────────────────────────────────────────────

    #[tokio::test]
    async fn drains_oldest_idle_instances_first() {
        let (reconciler, _, _, coordinator, store) = setup(policy(1, 4));
        for (i, created_at) in [100u64, 200, 300, 400].iter().enumerate() {
            let id = format!("agent-{i}");
            put_instance(&store, &id, InstanceState::Active, *created_at);
            coordinator.add_agent(&id, false);
        }

        let report = reconciler.reconcile_at(T0).await.unwrap();

        // desired = 1 → the three oldest drain, the newest survives.
        assert_eq!(report.drained, 3);
        assert_eq!(
            coordinator.drained(),
            vec![
                "agent-0".to_string(),
                "agent-1".to_string(),
                "agent-2".to_string()
            ]
        );
        assert_eq!(
            store.get("agent-3").unwrap().state,
            InstanceState::Active
        );
    }

    #[tokio::test]
    async fn busy_instances_are_not_drained() {
        let (reconciler, _, _, coordinator, store) = setup(policy(1, 4));
        put_instance(&store, "agent-0", InstanceState::Active, 100);
        put_instance(&store, "agent-1", InstanceState::Active, 200);
        coordinator.add_agent("agent-0", true);
        coordinator.add_agent("agent-1", false);

        let report = reconciler.reconcile_at(T0).await.unwrap();

        // desired = 1 (one busy agent); only the idle one is retired.
        assert_eq!(report.drained, 1);
        assert_eq!(store.get("agent-0").unwrap().state, InstanceState::Active);
        assert!(store.get("agent-1").is_err());
        assert_eq!(coordinator.drained(), vec!["agent-1".to_string()]);
    }

    #[tokio::test]
    async fn draining_waits_for_busy_agent() {
        let (reconciler, _, provider, coordinator, store) = setup(policy(0, 4));
        put_instance(&store, "agent-0", InstanceState::Draining, 100);
        coordinator.add_agent("agent-0", true);

        reconciler.reconcile_at(T0).await.unwrap();
        assert_eq!(store.get("agent-0").unwrap().state, InstanceState::Draining);
        assert_eq!(provider.terminate_attempts(), 0);

        // Job finished; the agent drops to idle and the instance goes.
        coordinator.set_demand(0, vec![]);
        let report = reconciler.reconcile_at(T0 + 30).await.unwrap();

        assert_eq!(report.terminated, 1);
        assert!(store.get("agent-0").is_err());
    }

    // ── Demand outage ──────────────────────────────────────────────

    #[tokio::test]
    async fn demand_outage_keeps_pool_untouched() {
        let (reconciler, _, provider, coordinator, store) = setup(policy(1, 4));
        put_instance(&store, "agent-0", InstanceState::Active, 100);
        put_instance(&store, "agent-1", InstanceState::Active, 200);
        coordinator.set_unavailable(true);

        let report = reconciler.reconcile_at(T0).await.unwrap();

        assert!(report.scaling_skipped);
        assert_eq!(provider.launch_attempts(), 0);
        assert_eq!(provider.terminate_attempts(), 0);
        assert_eq!(store.get("agent-0").unwrap().state, InstanceState::Active);
        assert_eq!(store.get("agent-1").unwrap().state, InstanceState::Active);
    }

    #[tokio::test]
    async fn provider_list_failure_aborts_cycle() {
        let (reconciler, _, provider, coordinator, store) = setup(policy(1, 4));
        coordinator.set_demand(0, vec![]);
        provider.fail_next_list(ProviderError::Transient("throttled".to_string()));

        assert!(reconciler.reconcile_at(T0).await.is_err());
        assert!(store.list_all().unwrap().is_empty());

        // Next cycle proceeds normally.
        let report = reconciler.reconcile_at(T0 + 30).await.unwrap();
        assert_eq!(report.launched, 1);
    }

    // ── Launch failures ────────────────────────────────────────────

    #[tokio::test]
    async fn transient_launch_failures_back_off_then_abandon() {
        let (reconciler, _, provider, coordinator, store) = setup(policy(1, 1));
        coordinator.set_demand(0, vec![]);
        for _ in 0..5 {
            provider.fail_next_launch(ProviderError::Transient("throttled".to_string()));
        }

        // Attempt 1 fails at T0.
        reconciler.reconcile_at(T0).await.unwrap();
        let id = store.list_all().unwrap()[0].id.clone();
        assert_eq!(store.get(&id).unwrap().failure_count, 1);

        // Within the 30s backoff window nothing is retried.
        reconciler.reconcile_at(T0 + 10).await.unwrap();
        assert_eq!(provider.launch_attempts_for(&id), 1);

        // Backoff doubles per failure: retries land at +30, +90, +210, +450.
        for at in [T0 + 30, T0 + 90, T0 + 210] {
            reconciler.reconcile_at(at).await.unwrap();
        }
        assert_eq!(provider.launch_attempts_for(&id), 4);

        // Fifth consecutive failure abandons the id and replaces capacity.
        let report = reconciler.reconcile_at(T0 + 450).await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(provider.launch_attempts_for(&id), 5);
        // The abandoned record was never launched, so termination is a
        // no-op and the record is gone.
        assert!(store.get(&id).is_err());
        // A replacement with a fresh id was launched in the same cycle.
        assert_eq!(report.launched, 1);

        // Later cycles never touch the abandoned id again.
        reconciler.reconcile_at(T0 + 900).await.unwrap();
        assert_eq!(provider.launch_attempts_for(&id), 5);
    }

    #[tokio::test]
    async fn permanent_launch_failure_abandons_immediately() {
        let (reconciler, _, provider, coordinator, store) = setup(policy(1, 1));
        coordinator.set_demand(0, vec![]);
        provider.fail_next_launch(ProviderError::Permanent("quota exceeded".to_string()));

        let report = reconciler.reconcile_at(T0).await.unwrap();

        assert_eq!(report.abandoned, 1);
        assert_eq!(report.launched, 0);
        // Abandoned, never launched → record cleaned up in the same cycle.
        assert!(store.list_all().unwrap().is_empty());

        // Replacement arrives on the next cycle.
        let report = reconciler.reconcile_at(T0 + 30).await.unwrap();
        assert_eq!(report.launched, 1);
    }

    // ── Terminate failures ─────────────────────────────────────────

    #[tokio::test]
    async fn transient_terminate_failure_retries_next_cycle() {
        let (reconciler, _, provider, coordinator, store) = setup(policy(0, 4));
        coordinator.set_demand(0, vec![]);
        put_instance(&store, "agent-0", InstanceState::Terminating, 100);
        provider.insert_orphan("agent-0", "forgepool");
        provider.fail_next_terminate(ProviderError::Transient("throttled".to_string()));

        reconciler.reconcile_at(T0).await.unwrap();
        assert_eq!(store.get("agent-0").unwrap().failure_count, 1);

        // After the backoff window the terminate goes through.
        let report = reconciler.reconcile_at(T0 + 30).await.unwrap();
        assert_eq!(report.terminated, 1);
        assert!(store.get("agent-0").is_err());
        assert_eq!(provider.terminated_ids(), vec!["agent-0".to_string()]);
    }

    // ── Housekeeping ───────────────────────────────────────────────

    #[tokio::test]
    async fn terminated_leftover_is_deleted() {
        let (reconciler, _, _, coordinator, store) = setup(policy(0, 4));
        coordinator.set_demand(0, vec![]);
        put_instance(&store, "agent-0", InstanceState::Terminated, 100);

        reconciler.reconcile_at(T0).await.unwrap();

        assert!(store.list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_is_published_after_each_cycle() {
        let (reconciler, status_rx, _, coordinator, store) = setup(policy(1, 4));
        put_instance(&store, "agent-0", InstanceState::Active, 100);
        coordinator.set_demand(
            2,
            vec![AgentInfo {
                agent_id: "agent-0".to_string(),
                busy: true,
            }],
        );

        reconciler.reconcile_at(T0).await.unwrap();

        let status = status_rx.borrow().clone();
        assert_eq!(status.desired_size, 3);
        assert_eq!(status.pending_jobs, 2);
        assert_eq!(status.busy_agents, 1);
        assert_eq!(status.active, 1);
        assert_eq!(status.provisioning, 2);
        assert_eq!(status.current_size, 3);
        assert_eq!(status.min_size, 1);
        assert_eq!(status.max_size, 4);
        assert_eq!(status.updated_at, T0);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let (reconciler, _, _, coordinator, _) = setup(policy(0, 4));
        coordinator.set_demand(0, vec![]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            reconciler
                .run(Duration::from_millis(10), shutdown_rx)
                .await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
