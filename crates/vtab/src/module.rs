use crate::error::Result;
use crate::index_info::{FilterInfo, IndexInfo};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use stratadb_catalog::{IndexSpec, SchemaChange, TableSchema};
use stratadb_value::{Row, RowIdRow, SqlValue};

/// The stream of rows a table produces for one `query` call.
pub type RowStream = BoxStream<'static, Result<RowIdRow>>;

/// How a constraint violation on write is resolved. Attached out-of-band
/// to `update` calls; `Abort` is the default everywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    Rollback,
    #[default]
    Abort,
    Fail,
    Ignore,
    Replace,
}

/// Arguments to [`Module::connect`].
#[derive(Debug, Clone)]
pub struct ConnectArgs {
    pub schema: Arc<TableSchema>,
    /// True when this connect is creating the table, false when attaching
    /// to one that already exists.
    pub create: bool,
    pub options: BTreeMap<String, SqlValue>,
}

/// One write operation. `rowid` is `None` for INSERT and present for
/// UPDATE/DELETE; `values` is `None` for DELETE.
#[derive(Debug, Clone)]
pub struct UpdateArgs {
    pub rowid: Option<i64>,
    pub values: Option<Row>,
    pub policy: ConflictPolicy,
}

impl UpdateArgs {
    pub fn insert(values: Row, policy: ConflictPolicy) -> Self {
        UpdateArgs { rowid: None, values: Some(values), policy }
    }

    pub fn update(rowid: i64, values: Row, policy: ConflictPolicy) -> Self {
        UpdateArgs { rowid: Some(rowid), values: Some(values), policy }
    }

    pub fn delete(rowid: i64) -> Self {
        UpdateArgs { rowid: Some(rowid), values: None, policy: ConflictPolicy::default() }
    }
}

/// A virtual-table implementation, registered by name on a database and
/// reusable for any number of tables. `connect` instantiates one handle
/// per (connection, table) pair; shared state, if any, lives in the
/// module.
#[async_trait]
pub trait Module: Send + Sync {
    async fn connect(&self, args: ConnectArgs) -> Result<Arc<dyn VirtualTable>>;

    /// Tear down the table's shared state. Invoked by DROP TABLE, after
    /// the handles are disconnected.
    async fn destroy(&self, schema_name: &str, table_name: &str) -> Result<()> {
        let _ = (schema_name, table_name);
        Ok(())
    }
}

/// The per-connection handle to one table.
///
/// Transactional state (layers, savepoints) is private to the handle;
/// whatever the module shares across connections becomes visible to other
/// handles only at `commit`.
///
/// Defaults: the transactional operations are no-ops, which is correct for
/// read-only sources; schema alteration and index maintenance report the
/// table as read-only.
#[async_trait]
pub trait VirtualTable: Send + Sync {
    /// The table's advertised shape. Stable between `alter_schema` calls.
    fn schema(&self) -> Arc<TableSchema>;

    /// Query-plan negotiation. Never fails; a module that cannot serve
    /// the constraints leaves a maximal cost in place.
    fn best_index(&self, info: &mut IndexInfo);

    /// Begin streaming rows for the plan chosen by `best_index`.
    async fn query(&self, filter: FilterInfo) -> Result<RowStream>;

    /// Apply one write. For INSERT returns the new rowid; for
    /// UPDATE/DELETE the affected rowid. `None` means the operation was
    /// a no-op or the row was dropped by `ConflictPolicy::Ignore`.
    async fn update(&self, args: UpdateArgs) -> Result<Option<i64>> {
        let _ = args;
        Err(crate::EngineError::read_only(format!(
            "table `{}` does not support writes",
            self.schema().name
        )))
    }

    async fn begin(&self) -> Result<()> {
        Ok(())
    }

    /// Prepare-to-commit. A failure here must leave the table unchanged.
    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    async fn savepoint(&self, index: usize) -> Result<()> {
        let _ = index;
        Ok(())
    }

    async fn release(&self, index: usize) -> Result<()> {
        let _ = index;
        Ok(())
    }

    async fn rollback_to(&self, index: usize) -> Result<()> {
        let _ = index;
        Ok(())
    }

    async fn alter_schema(&self, change: SchemaChange) -> Result<()> {
        let _ = change;
        Err(crate::EngineError::read_only(format!(
            "table `{}` does not support schema changes",
            self.schema().name
        )))
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let _ = spec;
        Err(crate::EngineError::read_only(format!(
            "table `{}` does not support index creation",
            self.schema().name
        )))
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        let _ = name;
        Err(crate::EngineError::read_only(format!(
            "table `{}` does not support index removal",
            self.schema().name
        )))
    }

    /// Release per-connection resources. Called once, last.
    fn disconnect(&self) {}
}

impl std::fmt::Debug for dyn VirtualTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualTable").field("schema", &self.schema()).finish()
    }
}
