//! StateStore: redb-backed service pool.
//!
//! Services and per-role metric snapshots are stored as JSON in `&[u8]`
//! value columns. Read-modify-write helpers run inside a single redb write
//! transaction; redb serializes writers, so two producers racing on the same
//! role see each other's result rather than overwriting it.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::policy::ElasticityPolicy;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(ROLE_METRICS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or replace a service document and return it as stored.
    ///
    /// A role whose state differs from the stored copy goes through
    /// [`Role::set_state`] inside the same write transaction, so a role
    /// pushed into SCALING starts with empty evaluation windows.
    pub fn put_service(&self, service: &Service) -> StateResult<Service> {
        let key = service.table_key();
        let mut service = service.clone();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let stored = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            if let Some(bytes) = stored {
                let stored: Service =
                    serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                for role in &mut service.roles {
                    let Some(previous) = stored.role(&role.name).map(|r| r.state) else {
                        continue;
                    };
                    if previous != role.state {
                        let next = role.state;
                        role.state = previous;
                        role.set_state(next);
                    }
                }
            }
            let value = serde_json::to_vec(&service).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service_id = service.id, "service stored");
        Ok(service)
    }

    pub fn get_service(&self, id: ServiceId) -> StateResult<Option<Service>> {
        let key = service_key(id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let service: Service =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(service))
            }
            None => Ok(None),
        }
    }

    /// List the whole pool in id order.
    pub fn list_services(&self) -> StateResult<Vec<Service>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let service: Service =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(service);
        }
        Ok(results)
    }

    /// Remove a service and its metric snapshots. Returns true if it existed.
    pub fn delete_service(&self, id: ServiceId) -> StateResult<bool> {
        let key = service_key(id);
        let prefix = format!("{id}/");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();

            let mut metrics = txn.open_table(ROLE_METRICS).map_err(map_err!(Table))?;
            let stale: Vec<String> = metrics
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for k in &stale {
                metrics.remove(k.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service_id = id, existed, "service deleted");
        Ok(existed)
    }

    /// Apply `f` to a stored service and write the result back, all inside
    /// one write transaction. Nothing is written when `f` fails.
    pub fn update_service<T>(
        &self,
        id: ServiceId,
        f: impl FnOnce(&mut Service) -> StateResult<T>,
    ) -> StateResult<T> {
        let key = service_key(id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let current = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            match current {
                None => Err(StateError::NotFound(format!("service {id}"))),
                Some(bytes) => {
                    let mut service: Service =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    let result = f(&mut service);
                    if result.is_ok() {
                        let value = serde_json::to_vec(&service).map_err(map_err!(Serialize))?;
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    result
                }
            }
        };
        match outcome {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    /// Compare-and-set a role's state. Moves the role to `to` only if its
    /// current state is in `allowed_from`; returns whether it moved.
    pub fn transition_role(
        &self,
        service_id: ServiceId,
        role: &str,
        allowed_from: &[RoleState],
        to: RoleState,
    ) -> StateResult<bool> {
        self.update_service(service_id, |service| {
            let r = service
                .role_mut(role)
                .ok_or_else(|| StateError::NotFound(role_key(service_id, role)))?;
            if !allowed_from.contains(&r.state) {
                debug!(service_id, role, state = %r.state, %to, "role transition refused");
                return Ok(false);
            }
            r.set_state(to);
            Ok(true)
        })
    }

    /// Write back the evaluator-owned fields of a role's policies. Policies
    /// are matched by position and expression; a policy whose expression no
    /// longer matches is left alone.
    ///
    /// Samples are only kept while the stored role is still RUNNING. A role
    /// that left RUNNING after the snapshot was taken (into SCALING, which
    /// clears the windows, or anywhere else) keeps its stored history.
    /// Returns whether anything was written.
    pub fn record_policy_evaluations(
        &self,
        service_id: ServiceId,
        role: &str,
        policies: &[ElasticityPolicy],
    ) -> StateResult<bool> {
        self.update_service(service_id, |service| {
            let r = service
                .role_mut(role)
                .ok_or_else(|| StateError::NotFound(role_key(service_id, role)))?;
            if r.state != RoleState::Running {
                debug!(service_id, role, state = %r.state, "stale evaluation discarded");
                return Ok(false);
            }
            for (stored, evaluated) in r.elasticity_policies.iter_mut().zip(policies) {
                if stored.expression == evaluated.expression {
                    stored.true_evals = evaluated.true_evals.clone();
                    stored.last_eval = evaluated.last_eval;
                }
            }
            Ok(true)
        })
    }

    // ── Role metrics ───────────────────────────────────────────────

    /// Replace the latest metric snapshot of a role.
    pub fn put_role_metrics(&self, metrics: &RoleMetrics) -> StateResult<()> {
        let key = metrics.table_key();
        let value = serde_json::to_vec(metrics).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLE_METRICS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn latest_role_metrics(
        &self,
        service_id: ServiceId,
        role: &str,
    ) -> StateResult<Option<RoleMetrics>> {
        let key = role_key(service_id, role);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLE_METRICS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let metrics: RoleMetrics =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(metrics))
            }
            None => Ok(None),
        }
    }
}
