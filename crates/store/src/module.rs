//! The builtin table modules.
//!
//! [`MemoryModule`] backs ordinary tables: one shared [`TableShared`] per
//! table name, one [`MemoryTable`] handle per connection.
//! [`EphemeralModule`] reuses the same machinery with a private base per
//! handle and no registry, for scratch tables and sorter spill targets.

use crate::table::{MemoryTable, TableShared};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use stratadb_vtab::{ConnectArgs, EngineError, Module, Result, VirtualTable};

#[derive(Default)]
pub struct MemoryModule {
    tables: Mutex<HashMap<(String, String), Arc<TableShared>>>,
}

impl MemoryModule {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Module for MemoryModule {
    async fn connect(&self, args: ConnectArgs) -> Result<Arc<dyn VirtualTable>> {
        let key = (args.schema.schema_name.clone(), args.schema.name.clone());
        let mut tables = self.tables.lock();
        let shared = if args.create {
            if tables.contains_key(&key) {
                return Err(EngineError::constraint(format!(
                    "table `{}` already exists",
                    args.schema.name
                )));
            }
            args.schema.validate()?;
            let shared = TableShared::new(args.schema.clone());
            tables.insert(key, shared.clone());
            shared
        } else {
            tables
                .get(&key)
                .cloned()
                .ok_or_else(|| EngineError::not_found(format!("table `{}`", args.schema.name)))?
        };
        Ok(Arc::new(MemoryTable::new(shared)))
    }

    async fn destroy(&self, schema_name: &str, table_name: &str) -> Result<()> {
        let key = (schema_name.to_owned(), table_name.to_owned());
        self.tables
            .lock()
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_found(format!("table `{table_name}`")))
    }
}

/// Scratch tables: every `connect` gets a private base layer, invisible
/// to every other handle. `destroy` is a no-op because nothing outlives
/// the handle.
#[derive(Default)]
pub struct EphemeralModule;

impl EphemeralModule {
    pub fn new() -> Self {
        EphemeralModule
    }
}

#[async_trait]
impl Module for EphemeralModule {
    async fn connect(&self, args: ConnectArgs) -> Result<Arc<dyn VirtualTable>> {
        args.schema.validate()?;
        let shared = TableShared::new(args.schema.clone());
        Ok(Arc::new(MemoryTable::new(shared)))
    }
}
