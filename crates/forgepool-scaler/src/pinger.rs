//! Pinger — liveness probe for instances stuck registering.
//!
//! A launched instance normally registers its agent within minutes. One
//! that sits in Registering past the grace period has probably failed in
//! a way the provider can't see (bad image, crashed agent, network
//! partition). The pinger probes its agent endpoint and, when the probe
//! fails, drains the instance so the reconcile loop replaces the
//! capacity instead of waiting forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use forgepool_provider::Provider;
use forgepool_state::{InstanceState, InstanceStore};

use crate::epoch_secs;
use crate::probe::http_probe;

/// What one ping sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingReport {
    /// Instances past grace that were probed.
    pub probed: u32,
    /// Instances drained because their probe failed.
    pub drained: u32,
}

/// Periodic liveness check over Registering instances.
pub struct Pinger {
    store: InstanceStore,
    provider: Arc<dyn Provider>,
    /// How long an instance may stay in Registering before it is probed.
    grace: Duration,
    probe_timeout: Duration,
    probe_path: String,
    enabled: bool,
}

impl Pinger {
    pub fn new(store: InstanceStore, provider: Arc<dyn Provider>, grace: Duration) -> Self {
        Self {
            store,
            provider,
            grace,
            probe_timeout: Duration::from_secs(5),
            probe_path: "/healthz".to_string(),
            enabled: true,
        }
    }

    /// Enable or disable probing (a disabled sweep is a logged no-op).
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Run the ping loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = interval.as_secs(),
            enabled = self.enabled,
            "pinger started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if report.drained > 0 => {
                            info!(?report, "ping sweep drained dead launches");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "ping sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("pinger shutting down");
                    break;
                }
            }
        }
    }

    /// Run one sweep against the wall clock.
    pub async fn sweep(&self) -> anyhow::Result<PingReport> {
        self.sweep_at(epoch_secs()).await
    }

    /// Run one sweep with an explicit clock (used by tests).
    pub async fn sweep_at(&self, now: u64) -> anyhow::Result<PingReport> {
        let mut report = PingReport::default();
        if !self.enabled {
            debug!("pinger disabled, skipping sweep");
            return Ok(report);
        }

        let registering = self
            .store
            .list_where(|i| i.state == InstanceState::Registering)?;

        for inst in registering {
            if now < inst.created_at.saturating_add(self.grace.as_secs()) {
                continue;
            }

            let address = match self.provider.describe(&inst.id).await {
                Ok(remote) => remote.address,
                Err(e) if e.is_not_found() => {
                    // Vanished; the reaper owns that case.
                    debug!(id = %inst.id, "instance gone from provider, skipping probe");
                    continue;
                }
                Err(e) => {
                    warn!(id = %inst.id, error = %e, "describe failed, skipping probe");
                    continue;
                }
            };

            report.probed += 1;
            let alive = match address {
                Some(addr) => http_probe(&addr, &self.probe_path, self.probe_timeout).await,
                // Running this long without an address counts as dead.
                None => false,
            };

            if alive {
                debug!(id = %inst.id, "agent endpoint alive, still waiting for registration");
                continue;
            }

            warn!(
                id = %inst.id,
                age_secs = now.saturating_sub(inst.created_at),
                "agent never registered and probe failed, draining instance"
            );
            match self.store.transition(
                &inst.id,
                &[InstanceState::Registering],
                InstanceState::Draining,
                now,
                3,
            ) {
                Ok(Some(_)) => report.drained += 1,
                Ok(None) => {}
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    debug!(id = %inst.id, error = %e, "drain transition lost, leaving for next sweep");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }
}
