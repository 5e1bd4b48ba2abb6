//! Reaper — bidirectional drift sweep between store and provider.
//!
//! The reconcile loop assumes its view of the world is mostly right; the
//! reaper handles the rest. After a crash mid-cycle, a manual termination
//! in the cloud console, or an abandoned retry budget, store and provider
//! can disagree. The reaper runs on a slower interval and heals both
//! directions:
//!
//! - a record the provider no longer backs is dropped once it has been
//!   unconfirmed for the grace window;
//! - a pool-tagged provider resource with no record is terminated and
//!   logged as an anomaly;
//! - a termination the reconciler gave up on is reissued at reaper
//!   cadence until the resource is gone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use forgepool_provider::{Provider, ProviderInstance, ProviderState};
use forgepool_state::{InstanceState, InstanceStore, StateError};

use crate::epoch_secs;

/// What one reap sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Store records dropped because the provider no longer backs them.
    pub removed_records: u32,
    /// Provider resources terminated because no record claims them.
    pub terminated_orphans: u32,
    /// Stuck terminations reissued against the provider.
    pub reissued_terminations: u32,
}

/// Periodic drift sweep over the store and the provider.
pub struct Reaper {
    store: InstanceStore,
    provider: Arc<dyn Provider>,
    pool_tag: String,
    /// How long a record may stay unconfirmed before it is dropped.
    grace: Duration,
    enabled: bool,
}

impl Reaper {
    pub fn new(
        store: InstanceStore,
        provider: Arc<dyn Provider>,
        pool_tag: impl Into<String>,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            pool_tag: pool_tag.into(),
            grace,
            enabled: true,
        }
    }

    /// Enable or disable sweeping (a disabled sweep is a logged no-op).
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Run the reap loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = interval.as_secs(),
            enabled = self.enabled,
            "reaper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if report != ReapReport::default() => {
                            info!(?report, "reap sweep healed drift");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "reap sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("reaper shutting down");
                    break;
                }
            }
        }
    }

    /// Run one sweep against the wall clock.
    pub async fn sweep(&self) -> anyhow::Result<ReapReport> {
        self.sweep_at(epoch_secs()).await
    }

    /// Run one sweep with an explicit clock (used by tests).
    pub async fn sweep_at(&self, now: u64) -> anyhow::Result<ReapReport> {
        let mut report = ReapReport::default();
        if !self.enabled {
            debug!("reaper disabled, skipping sweep");
            return Ok(report);
        }

        // Terminated provider entries are history, not live resources.
        let live: HashMap<String, ProviderInstance> = self
            .provider
            .list_tagged(&self.pool_tag)
            .await
            .map_err(|e| anyhow::anyhow!("provider list failed: {e}"))?
            .into_iter()
            .filter(|i| i.state != ProviderState::Terminated)
            .map(|i| (i.id.clone(), i))
            .collect();

        let records = self.store.list_all()?;

        // Store-side: records the provider no longer backs.
        for inst in &records {
            if live.contains_key(&inst.id) {
                continue;
            }
            if now < inst.last_seen_at.saturating_add(self.grace.as_secs()) {
                continue;
            }
            warn!(
                id = %inst.id,
                state = inst.state.as_str(),
                "instance vanished from provider, dropping record"
            );
            match self.store.delete(&inst.id) {
                Ok(()) => report.removed_records += 1,
                Err(StateError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let known: HashSet<&str> = records.iter().map(|i| i.id.as_str()).collect();

        // Provider-side: pool-tagged resources the store never heard of.
        for id in live.keys() {
            if known.contains(id.as_str()) {
                continue;
            }
            warn!(%id, "pool-tagged instance missing from store, terminating orphan");
            match self.provider.terminate(id).await {
                Ok(()) => report.terminated_orphans += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(%id, error = %e, "orphan terminate failed, will retry next sweep");
                }
            }
        }

        // Terminations the reconcile loop gave up on.
        for inst in &records {
            if inst.state != InstanceState::Terminating || !live.contains_key(&inst.id) {
                continue;
            }
            if now < inst.last_seen_at.saturating_add(self.grace.as_secs()) {
                continue;
            }
            warn!(id = %inst.id, "termination stuck, reissuing terminate");
            let gone = match self.provider.terminate(&inst.id).await {
                Ok(()) => true,
                Err(e) if e.is_not_found() => true,
                Err(e) => {
                    warn!(id = %inst.id, error = %e, "reissued terminate failed, will retry next sweep");
                    false
                }
            };
            if gone {
                match self.store.delete(&inst.id) {
                    Ok(()) => report.reissued_terminations += 1,
                    Err(StateError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgepool_provider::MemoryProvider;
    use forgepool_state::Instance;

    const T0: u64 = 1_000_000;
    const GRACE: Duration = Duration::from_secs(600);

    fn setup() -> (Reaper, Arc<MemoryProvider>, InstanceStore) {
        let store = InstanceStore::open_in_memory().unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let reaper = Reaper::new(
            store.clone(),
            provider.clone() as Arc<dyn Provider>,
            "forgepool",
            GRACE,
        );
        (reaper, provider, store)
    }

    fn put_instance(store: &InstanceStore, id: &str, state: InstanceState, seen_at: u64) {
        let mut inst = Instance::new(id, format!("token-{id}"), seen_at);
        inst.state = state;
        store.put(&inst).unwrap();
    }

    #[tokio::test]
    async fn vanished_record_dropped_after_grace() {
        let (reaper, _, store) = setup();
        put_instance(&store, "agent-0", InstanceState::Active, T0);

        let report = reaper.sweep_at(T0 + GRACE.as_secs() + 1).await.unwrap();

        assert_eq!(report.removed_records, 1);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_record_kept_within_grace() {
        let (reaper, _, store) = setup();
        put_instance(&store, "agent-0", InstanceState::Provisioning, T0);

        let report = reaper.sweep_at(T0 + 10).await.unwrap();

        assert_eq!(report, ReapReport::default());
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn orphan_is_terminated_and_logged() {
        let (reaper, provider, _) = setup();
        provider.insert_orphan("stray", "forgepool");

        let report = reaper.sweep_at(T0).await.unwrap();

        assert_eq!(report.terminated_orphans, 1);
        assert_eq!(provider.terminated_ids(), vec!["stray".to_string()]);

        // Already-terminated entries are history, not orphans.
        let second = reaper.sweep_at(T0 + 60).await.unwrap();
        assert_eq!(second, ReapReport::default());
    }

    #[tokio::test]
    async fn other_pools_are_not_touched() {
        let (reaper, provider, _) = setup();
        provider.insert_orphan("stray", "someone-elses-pool");

        let report = reaper.sweep_at(T0).await.unwrap();

        assert_eq!(report.terminated_orphans, 0);
        assert!(provider.terminated_ids().is_empty());
    }

    #[tokio::test]
    async fn backed_record_is_left_alone() {
        let (reaper, provider, store) = setup();
        provider.insert_orphan("agent-0", "forgepool");
        put_instance(&store, "agent-0", InstanceState::Active, T0 - 10_000);

        // Old last_seen, but the provider still backs it.
        let report = reaper.sweep_at(T0).await.unwrap();

        assert_eq!(report, ReapReport::default());
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stuck_termination_is_reissued() {
        let (reaper, provider, store) = setup();
        provider.insert_orphan("agent-0", "forgepool");
        put_instance(&store, "agent-0", InstanceState::Terminating, T0);

        let report = reaper.sweep_at(T0 + GRACE.as_secs() + 1).await.unwrap();

        assert_eq!(report.reissued_terminations, 1);
        assert_eq!(provider.terminated_ids(), vec!["agent-0".to_string()]);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_reaper_sweeps_nothing() {
        let (reaper, provider, store) = setup();
        let reaper = reaper.with_enabled(false);
        put_instance(&store, "agent-0", InstanceState::Active, T0);
        provider.insert_orphan("stray", "forgepool");

        let report = reaper.sweep_at(T0 + GRACE.as_secs() * 10).await.unwrap();

        assert_eq!(report, ReapReport::default());
        assert_eq!(store.list_all().unwrap().len(), 1);
        assert!(provider.terminated_ids().is_empty());
    }
}
