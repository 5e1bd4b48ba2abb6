//! InstanceStore — redb-backed persistence for pool-owned instances.
//!
//! Provides typed CRUD over instance records plus the compare-and-set
//! primitive every state transition goes through. Records are
//! JSON-serialized into redb's `&[u8]` value column. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! redb serializes write transactions, so each read-check-write below is
//! atomic; the `version` counter turns cross-transaction races into
//! [`StateError::Conflict`] instead of lost updates.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::INSTANCES;
use crate::types::{Instance, InstanceState};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe instance store backed by redb.
#[derive(Clone)]
pub struct InstanceStore {
    db: Arc<Database>,
}

impl InstanceStore {
    /// Open (or create) a persistent instance store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "instance store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory instance store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory instance store opened");
        Ok(store)
    }

    /// Create the instances table if it doesn't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or overwrite an instance record as given.
    ///
    /// Blind write: the record's `version` is stored verbatim. Use
    /// [`cas_state`](Self::cas_state) for state transitions on records
    /// other tasks may also be updating.
    pub fn put(&self, instance: &Instance) -> StateResult<()> {
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(instance.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %instance.id, state = instance.state.as_str(), "instance stored");
        Ok(())
    }

    /// Get an instance by id. Fails with [`StateError::NotFound`] on a miss.
    pub fn get(&self, id: &str) -> StateResult<Instance> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Err(StateError::NotFound(id.to_string())),
        }
    }

    /// Find the instance holding a given agent token, if any.
    pub fn find_by_token(&self, agent_token: &str) -> StateResult<Option<Instance>> {
        Ok(self
            .list_where(|i| i.agent_token == agent_token)?
            .into_iter()
            .next())
    }

    /// List all instance records.
    pub fn list_all(&self) -> StateResult<Vec<Instance>> {
        self.list_where(|_| true)
    }

    /// List instance records matching a predicate.
    pub fn list_where(&self, pred: impl Fn(&Instance) -> bool) -> StateResult<Vec<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let instance: Instance =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if pred(&instance) {
                results.push(instance);
            }
        }
        Ok(results)
    }

    /// Delete an instance record. Fails with [`StateError::NotFound`] on a
    /// miss so callers can treat "already gone" explicitly.
    pub fn delete(&self, id: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            debug!(%id, "instance deleted");
            Ok(())
        } else {
            Err(StateError::NotFound(id.to_string()))
        }
    }

    /// Compare-and-set the state of an instance.
    ///
    /// Succeeds only when the stored `version` still equals
    /// `expected_version`; otherwise fails with [`StateError::Conflict`].
    /// On success the record's `last_seen_at` is set to `now`, the
    /// `failure_count` is reset (a transition marks provider progress), and
    /// the version is bumped. Returns the updated record.
    pub fn cas_state(
        &self,
        id: &str,
        expected_version: u64,
        new_state: InstanceState,
        now: u64,
    ) -> StateResult<Instance> {
        self.update(id, |instance| {
            if instance.version != expected_version {
                return Err(StateError::Conflict {
                    id: id.to_string(),
                    expected: expected_version,
                    actual: instance.version,
                });
            }
            instance.state = new_state;
            instance.last_seen_at = now;
            instance.failure_count = 0;
            Ok(())
        })
    }

    /// Transition an instance from one of `allowed_from` to `to`, retrying
    /// compare-and-set conflicts up to `max_retries` times.
    ///
    /// Returns `Ok(Some(updated))` on success and `Ok(None)` when a
    /// concurrent task already moved the instance out of every eligible
    /// state (a detected race, not an error). A conflict on the final
    /// attempt is surfaced to the caller.
    pub fn transition(
        &self,
        id: &str,
        allowed_from: &[InstanceState],
        to: InstanceState,
        now: u64,
        max_retries: u32,
    ) -> StateResult<Option<Instance>> {
        let mut attempts = 0;
        loop {
            let current = self.get(id)?;
            if !allowed_from.contains(&current.state) {
                return Ok(None);
            }
            match self.cas_state(id, current.version, to, now) {
                Ok(updated) => return Ok(Some(updated)),
                Err(e) if e.is_conflict() && attempts < max_retries => {
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refresh an instance's `last_seen_at` after a provider confirmation.
    ///
    /// Bumps the version so a concurrent compare-and-set observes the write.
    pub fn touch(&self, id: &str, now: u64) -> StateResult<Instance> {
        self.update(id, |instance| {
            instance.last_seen_at = now;
            Ok(())
        })
    }

    /// Record one more consecutive provider-call failure for an instance.
    ///
    /// Sets `last_seen_at` to `now` (the failed attempt timestamp the
    /// backoff window is measured from) and returns the new count.
    pub fn bump_failure(&self, id: &str, now: u64) -> StateResult<u32> {
        let updated = self.update(id, |instance| {
            instance.failure_count += 1;
            instance.last_seen_at = now;
            Ok(())
        })?;
        Ok(updated.failure_count)
    }

    /// Read-modify-write a record inside a single write transaction,
    /// bumping its version.
    fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Instance) -> StateResult<()>,
    ) -> StateResult<Instance> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut instance: Instance = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(id.to_string())),
            };
            mutate(&mut instance)?;
            instance.version += 1;
            let value = serde_json::to_vec(&instance).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            updated = instance;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }
}
