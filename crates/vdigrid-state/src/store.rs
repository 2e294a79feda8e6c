//! StateStore — redb-backed record persistence for vdigrid.
//!
//! Provides typed CRUD operations over applications and instances. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Get/list/save access to application and instance records.
///
/// Every `put_*` is committed before it returns, so a write is visible to
/// the next read.
pub trait RecordStore: Send + Sync {
    fn put_application(&self, app: &Application) -> StateResult<()>;
    fn get_application(&self, id: &str) -> StateResult<Option<Application>>;
    fn list_applications(&self) -> StateResult<Vec<Application>>;
    fn delete_application(&self, id: &str) -> StateResult<bool>;

    fn put_instance(&self, instance: &Instance) -> StateResult<()>;
    fn get_instance(
        &self,
        application_id: &str,
        instance_id: &str,
    ) -> StateResult<Option<Instance>>;
    fn list_instances_for_application(&self, application_id: &str) -> StateResult<Vec<Instance>>;
    fn delete_instance(&self, application_id: &str, instance_id: &str) -> StateResult<bool>;

    /// Delete terminated instances last updated before `cutoff`.
    ///
    /// Returns how many records were removed.
    fn prune_terminated(&self, application_id: &str, cutoff: u64) -> StateResult<usize> {
        let mut removed = 0;
        for inst in self.list_instances_for_application(application_id)? {
            if inst.state == InstanceState::Terminated
                && inst.updated_at < cutoff
                && self.delete_instance(application_id, &inst.instance_id)?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Thread-safe record store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => {
                StateError::Locked(path.display().to_string())
            }
            other => StateError::Open(other.to_string()),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
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

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_raw(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove_raw(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

impl RecordStore for StateStore {
    // ── Applications ───────────────────────────────────────────────

    fn put_application(&self, app: &Application) -> StateResult<()> {
        Application::validate_id(&app.id)?;
        let key = app.table_key();
        let value = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
        self.put_raw(APPLICATIONS, &key, &value)?;
        debug!(%key, next_run_at = app.next_run_at, "application stored");
        Ok(())
    }

    fn get_application(&self, id: &str) -> StateResult<Option<Application>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let app: Application =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(app))
            }
            None => Ok(None),
        }
    }

    fn list_applications(&self) -> StateResult<Vec<Application>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let app: Application =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(app);
        }
        Ok(results)
    }

    fn delete_application(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove_raw(APPLICATIONS, id)?;
        debug!(%id, existed, "application deleted");
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        let key = instance.table_key();
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        self.put_raw(INSTANCES, &key, &value)?;
        debug!(%key, state = ?instance.state, "instance stored");
        Ok(())
    }

    fn get_instance(
        &self,
        application_id: &str,
        instance_id: &str,
    ) -> StateResult<Option<Instance>> {
        let key = format!("{application_id}:{instance_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let instance: Instance =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    fn list_instances_for_application(&self, application_id: &str) -> StateResult<Vec<Instance>> {
        let prefix = format!("{application_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let instance: Instance =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            // Keys are only a hint; the record names its owner.
            if instance.application_id == application_id {
                results.push(instance);
            }
        }
        Ok(results)
    }

    fn delete_instance(&self, application_id: &str, instance_id: &str) -> StateResult<bool> {
        self.remove_raw(INSTANCES, &format!("{application_id}:{instance_id}"))
    }
}
