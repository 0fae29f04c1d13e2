//! A connection: per-connection table handles, catalog overlay and
//! transaction state.

use crate::database::{CatalogEntry, DbInner, TableKey};
use crate::statement::Statement;
use crate::txn::TxnState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use stratadb_catalog::TableSchema;
use stratadb_exec::{emit, EngineDb};
use stratadb_plan::{PlanNode, TableRef};
use stratadb_value::SqlValue;
use stratadb_vtab::{ConnectArgs, EngineError, Module, Result, VirtualTable};

/// A connection-local catalog change not yet committed: a created table
/// or a staged drop. Other connections keep seeing the published state
/// until commit.
enum OverlayEntry {
    Created(CatalogEntry),
    Dropped(CatalogEntry),
}

pub(crate) struct ConnInner {
    pub db: Arc<DbInner>,
    handles: Mutex<HashMap<TableKey, Arc<dyn VirtualTable>>>,
    overlay: Mutex<HashMap<TableKey, OverlayEntry>>,
    pub txn: Mutex<TxnState>,
}

impl ConnInner {
    pub fn new(db: Arc<DbInner>) -> Arc<Self> {
        Arc::new(ConnInner {
            db,
            handles: Mutex::new(HashMap::new()),
            overlay: Mutex::new(HashMap::new()),
            txn: Mutex::new(TxnState::default()),
        })
    }

    fn lookup_entry(&self, key: &TableKey) -> Result<CatalogEntry> {
        if let Some(overlaid) = self.overlay.lock().get(key) {
            return match overlaid {
                OverlayEntry::Created(entry) => Ok(entry.clone()),
                OverlayEntry::Dropped(_) => {
                    Err(EngineError::not_found(format!("table `{}`", key.1)))
                }
            };
        }
        self.db
            .catalog
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("table `{}`", key.1)))
    }

    /// The per-connection handle for a table, connecting on first use.
    pub fn handle(&self, key: &TableKey) -> Result<Arc<dyn VirtualTable>> {
        if let Some(handle) = self.handles.lock().get(key) {
            return Ok(handle.clone());
        }
        let entry = self.lookup_entry(key)?;
        let module = self.db.module(&entry.schema.module)?;
        // Table connects are synchronous in every builtin module; the
        // protocol being async is for the benefit of remote-ish modules,
        // which connect under a statement's own task instead.
        let handle = futures::executor::block_on(module.connect(ConnectArgs {
            schema: entry.schema.clone(),
            create: false,
            options: entry.options.clone(),
        }))?;
        self.handles.lock().insert(key.clone(), handle.clone());
        Ok(handle)
    }

    fn forget_handle(&self, key: &TableKey) {
        if let Some(handle) = self.handles.lock().remove(key) {
            handle.disconnect();
        }
    }

    /// Publish this connection's staged catalog changes. Called at
    /// commit time with the participant fan-out already done.
    pub async fn publish_overlay(&self) -> Result<()> {
        let staged: Vec<(TableKey, OverlayEntry)> = self.overlay.lock().drain().collect();
        for (key, entry) in staged {
            match entry {
                OverlayEntry::Created(entry) => {
                    self.db.catalog.write().insert(key, entry);
                }
                OverlayEntry::Dropped(entry) => {
                    self.db.catalog.write().remove(&key);
                    self.forget_handle(&key);
                    self.db.module(&entry.schema.module)?.destroy(&key.0, &key.1).await?;
                }
            }
        }
        Ok(())
    }

    /// Discard this connection's staged catalog changes, tearing down
    /// shared state of tables created inside the abandoned transaction.
    pub async fn discard_overlay(&self) -> Result<()> {
        let staged: Vec<(TableKey, OverlayEntry)> = self.overlay.lock().drain().collect();
        for (key, entry) in staged {
            if let OverlayEntry::Created(entry) = entry {
                self.forget_handle(&key);
                self.db.module(&entry.schema.module)?.destroy(&key.0, &key.1).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EngineDb for ConnInner {
    fn resolve_table(&self, table: &TableRef) -> Result<Arc<dyn VirtualTable>> {
        self.handle(&(table.schema_name.clone(), table.name.clone()))
    }

    #[tracing::instrument(skip_all, fields(table = %schema.name))]
    async fn create_table(
        &self,
        schema: TableSchema,
        options: BTreeMap<String, SqlValue>,
    ) -> Result<()> {
        schema.validate()?;
        let key: TableKey = (schema.schema_name.clone(), schema.name.clone());
        if self.lookup_entry(&key).is_ok() {
            return Err(EngineError::constraint(format!("table `{}` already exists", key.1)));
        }
        let module = self.db.module(&schema.module)?;
        let schema = Arc::new(schema);
        let handle = module
            .connect(ConnectArgs { schema: schema.clone(), create: true, options: options.clone() })
            .await?;
        self.handles.lock().insert(key.clone(), handle);

        let entry = CatalogEntry { schema, options };
        let in_txn = self.txn.lock().explicit;
        if in_txn {
            self.overlay.lock().insert(key, OverlayEntry::Created(entry));
        } else {
            self.db.catalog.write().insert(key, entry);
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(table = %table.name))]
    async fn drop_table(&self, table: &TableRef) -> Result<()> {
        let key: TableKey = (table.schema_name.clone(), table.name.clone());
        let entry = self.lookup_entry(&key)?;
        let created_here = matches!(self.overlay.lock().get(&key), Some(OverlayEntry::Created(_)));
        let in_txn = self.txn.lock().explicit;
        if created_here {
            // Dropping a table created in this transaction undoes it.
            self.overlay.lock().remove(&key);
            self.forget_handle(&key);
            self.db.module(&entry.schema.module)?.destroy(&key.0, &key.1).await?;
        } else if in_txn {
            self.overlay.lock().insert(key, OverlayEntry::Dropped(entry));
        } else {
            self.db.catalog.write().remove(&key);
            self.forget_handle(&key);
            self.db.module(&entry.schema.module)?.destroy(&key.0, &key.1).await?;
        }
        Ok(())
    }
}

/// One connection to a [`crate::Database`].
///
/// A connection owns its mutable state (parameters, transaction stack);
/// distinct connections may run statements concurrently against the
/// same database.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    pub(crate) fn new(inner: Arc<ConnInner>) -> Self {
        Connection { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnInner> {
        &self.inner
    }

    /// Lower a finished plan into an executable statement.
    pub fn prepare(&self, plan: &PlanNode) -> Result<Statement> {
        let graph = emit(plan, self.inner.as_ref(), &self.inner.db.registry)?;
        Ok(Statement::new(self.inner.clone(), Arc::new(graph)))
    }

    /// Begin an explicit transaction.
    pub async fn begin(&self) -> Result<()> {
        let mut txn = self.inner.txn.lock();
        if txn.explicit {
            return Err(EngineError::misuse("transaction already open"));
        }
        txn.explicit = true;
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        let outcome = crate::txn::commit_participants(&self.inner).await;
        if outcome.is_ok() {
            self.inner.publish_overlay().await?;
        }
        self.inner.txn.lock().explicit = false;
        outcome
    }

    pub async fn rollback(&self) -> Result<()> {
        let outcome = crate::txn::rollback_participants(&self.inner).await;
        self.inner.discard_overlay().await?;
        self.inner.txn.lock().explicit = false;
        outcome
    }

    /// Open a savepoint, returning its index for `release`/
    /// `rollback_to`.
    pub async fn savepoint(&self) -> Result<usize> {
        crate::txn::open_savepoint(&self.inner).await
    }

    pub async fn release(&self, index: usize) -> Result<()> {
        crate::txn::release_savepoint(&self.inner, index).await
    }

    pub async fn rollback_to(&self, index: usize) -> Result<()> {
        crate::txn::rollback_savepoint(&self.inner, index).await
    }

    /// Whether an explicit transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.inner.txn.lock().explicit
    }

    /// Register an ad-hoc module on the shared database through this
    /// connection.
    pub fn register_module(&self, name: impl Into<String>, module: Arc<dyn Module>) {
        self.inner.db.modules.lock().insert(name.into(), module);
    }
}
