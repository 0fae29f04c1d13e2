//! The shared database: module registry and published catalog.

use crate::connection::{ConnInner, Connection};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use stratadb_catalog::TableSchema;
use stratadb_exec::FuncRegistry;
use stratadb_store::{EphemeralModule, IntrospectionModule, JsonEachModule, MemoryModule};
use stratadb_value::SqlValue;
use stratadb_vtab::{EngineError, Module, Result};

pub(crate) type TableKey = (String, String);

/// One published table: its schema and the connect options it was
/// created with, replayed on every per-connection `connect`.
#[derive(Clone)]
pub(crate) struct CatalogEntry {
    pub schema: Arc<TableSchema>,
    pub options: BTreeMap<String, SqlValue>,
}

pub(crate) struct DbInner {
    pub modules: Mutex<IndexMap<String, Arc<dyn Module>>>,
    pub catalog: RwLock<HashMap<TableKey, CatalogEntry>>,
    pub registry: Arc<FuncRegistry>,
}

impl DbInner {
    pub fn module(&self, name: &str) -> Result<Arc<dyn Module>> {
        self.modules
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("no such module: {name}")))
    }
}

/// A database instance: in-process, in-memory, shared by any number of
/// connections.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(FuncRegistry::with_builtins()))
    }

    /// Build a database around a caller-supplied function registry.
    pub fn with_registry(registry: Arc<FuncRegistry>) -> Self {
        let inner = Arc::new(DbInner {
            modules: Mutex::new(IndexMap::new()),
            catalog: RwLock::new(HashMap::new()),
            registry,
        });

        {
            let mut modules = inner.modules.lock();
            modules.insert("memory".to_owned(), Arc::new(MemoryModule::new()) as Arc<dyn Module>);
            modules.insert("ephemeral".to_owned(), Arc::new(EphemeralModule::new()));
            modules.insert("json_each".to_owned(), Arc::new(JsonEachModule::new()));

            // The introspection views read the catalog through a weak
            // reference so the module does not keep the database alive.
            let weak: Weak<DbInner> = Arc::downgrade(&inner);
            let provider = Arc::new(move || {
                weak.upgrade()
                    .map(|db| {
                        db.catalog.read().values().map(|e| e.schema.clone()).collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            });
            modules.insert("introspection".to_owned(), Arc::new(IntrospectionModule::new(provider)));
        }

        // Publish the introspection views themselves.
        {
            let mut catalog = inner.catalog.write();
            for schema in IntrospectionModule::table_schemas("main") {
                let schema = Arc::new(schema.module("introspection"));
                catalog.insert(
                    (schema.schema_name.clone(), schema.name.clone()),
                    CatalogEntry { schema, options: BTreeMap::new() },
                );
            }
        }

        Database { inner }
    }

    /// Install a virtual-table implementation under `name`. Modules may
    /// back any number of tables; `connect` runs per table.
    pub fn register_module(&self, name: impl Into<String>, module: Arc<dyn Module>) {
        self.inner.modules.lock().insert(name.into(), module);
    }

    /// Open a new connection with its own transaction state.
    pub fn connect(&self) -> Connection {
        Connection::new(ConnInner::new(self.inner.clone()))
    }

    /// Schemas currently published, for tooling.
    pub fn published_tables(&self) -> Vec<Arc<TableSchema>> {
        self.inner.catalog.read().values().map(|e| e.schema.clone()).collect()
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}
