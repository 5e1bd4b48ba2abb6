//! In-memory provider — deterministic double for tests and dev runs.
//!
//! Instances live in a mutex-guarded map. Tests drive provider-side state
//! explicitly (`set_running`, `insert_orphan`, `remove`) and can inject
//! failures ahead of the next calls to exercise the retry paths.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ProviderError, ProviderResult};
use crate::types::{LaunchSpec, ProviderInstance, ProviderState};
use crate::Provider;

#[derive(Default)]
struct Inner {
    /// id → (instance, pool tag).
    instances: HashMap<String, (ProviderInstance, String)>,
    /// Forced failures for upcoming launch calls, consumed front-first.
    launch_failures: Vec<ProviderError>,
    /// Forced failures for upcoming terminate calls.
    terminate_failures: Vec<ProviderError>,
    /// Forced failures for upcoming list calls.
    list_failures: Vec<ProviderError>,
    /// Every launch attempt, successful or not, in call order.
    launch_attempts: Vec<String>,
    /// Every terminate attempt, successful or not, in call order.
    terminate_attempts: Vec<String>,
    /// Logical clock for `launched_at`.
    clock: u64,
}

/// In-memory [`Provider`] implementation.
#[derive(Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next launch call(s).
    pub fn fail_next_launch(&self, err: ProviderError) {
        self.inner.lock().unwrap().launch_failures.push(err);
    }

    /// Queue a failure for the next terminate call(s).
    pub fn fail_next_terminate(&self, err: ProviderError) {
        self.inner.lock().unwrap().terminate_failures.push(err);
    }

    /// Queue a failure for the next list call(s).
    pub fn fail_next_list(&self, err: ProviderError) {
        self.inner.lock().unwrap().list_failures.push(err);
    }

    /// Mark an instance running and give it an agent address.
    pub fn set_running(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((instance, _)) = inner.instances.get_mut(id) {
            instance.state = ProviderState::Running;
            if instance.address.is_none() {
                instance.address = Some(format!("10.0.0.{}:9631", instance.launched_at));
            }
        }
    }

    /// Override an instance's agent address (e.g. a live test listener).
    pub fn set_address(&self, id: &str, address: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((instance, _)) = inner.instances.get_mut(id) {
            instance.address = Some(address.to_string());
        }
    }

    /// Plant a pool-tagged instance the store knows nothing about.
    pub fn insert_orphan(&self, id: &str, pool_tag: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let instance = ProviderInstance {
            id: id.to_string(),
            state: ProviderState::Running,
            address: None,
            launched_at: inner.clock,
        };
        inner
            .instances
            .insert(id.to_string(), (instance, pool_tag.to_string()));
    }

    /// Drop an instance entirely, as if the provider garbage-collected it.
    pub fn remove(&self, id: &str) {
        self.inner.lock().unwrap().instances.remove(id);
    }

    /// Number of launch calls seen, failed attempts included.
    pub fn launch_attempts(&self) -> usize {
        self.inner.lock().unwrap().launch_attempts.len()
    }

    /// Launch attempts for one instance id.
    pub fn launch_attempts_for(&self, id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .launch_attempts
            .iter()
            .filter(|n| n.as_str() == id)
            .count()
    }

    /// Number of terminate calls seen, failed attempts included.
    pub fn terminate_attempts(&self) -> usize {
        self.inner.lock().unwrap().terminate_attempts.len()
    }

    /// Ids the provider currently reports as terminated.
    pub fn terminated_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .instances
            .values()
            .filter(|(i, _)| i.state == ProviderState::Terminated)
            .map(|(i, _)| i.id.clone())
            .collect()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn launch(&self, spec: &LaunchSpec) -> ProviderResult<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.launch_attempts.push(spec.name.clone());
        if !inner.launch_failures.is_empty() {
            return Err(inner.launch_failures.remove(0));
        }
        inner.clock += 1;
        let clock = inner.clock;
        // Relaunching an existing name is a no-op.
        inner
            .instances
            .entry(spec.name.clone())
            .or_insert_with(|| {
                (
                    ProviderInstance {
                        id: spec.name.clone(),
                        state: ProviderState::Pending,
                        address: None,
                        launched_at: clock,
                    },
                    spec.pool_tag.clone(),
                )
            });
        Ok(spec.name.clone())
    }

    async fn terminate(&self, id: &str) -> ProviderResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.terminate_attempts.push(id.to_string());
        if !inner.terminate_failures.is_empty() {
            return Err(inner.terminate_failures.remove(0));
        }
        match inner.instances.get_mut(id) {
            Some((instance, _)) => {
                instance.state = ProviderState::Terminated;
                Ok(())
            }
            None => Err(ProviderError::NotFound(id.to_string())),
        }
    }

    async fn list_tagged(&self, pool_tag: &str) -> ProviderResult<Vec<ProviderInstance>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.list_failures.is_empty() {
            return Err(inner.list_failures.remove(0));
        }
        Ok(inner
            .instances
            .values()
            .filter(|(_, tag)| tag == pool_tag)
            .map(|(i, _)| i.clone())
            .collect())
    }

    async fn describe(&self, id: &str) -> ProviderResult<ProviderInstance> {
        let inner = self.inner.lock().unwrap();
        inner
            .instances
            .get(id)
            .map(|(i, _)| i.clone())
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }
}
