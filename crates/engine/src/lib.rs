//! stratadb: an embeddable, in-process SQL query engine.
//!
//! The engine accepts a previously parsed and planned statement (a
//! [`PlanNode`] tree), lowers it to an instruction graph, and streams
//! rows back to the caller. Storage is pluggable through the
//! virtual-table protocol; the builtin backend is a layered MVCC
//! in-memory engine with per-connection snapshot isolation.
//!
//! ```no_run
//! # use stratadb::{Database, StepResult};
//! # use stratadb_plan::PlanNode;
//! # async fn demo(plan: PlanNode) -> stratadb::Result<()> {
//! let db = Database::new();
//! let conn = db.connect();
//! let mut stmt = conn.prepare(&plan)?;
//! while let StepResult::Row(row) = stmt.step().await? {
//!     println!("{row:?}");
//! }
//! stmt.finalize();
//! # Ok(())
//! # }
//! ```

mod connection;
mod database;
mod statement;
mod txn;

pub use connection::Connection;
pub use database::Database;
pub use statement::{Statement, StepResult};

pub use stratadb_exec::DmlSummary;
pub use stratadb_plan::plan_to_json;
pub use stratadb_value::{Collation, Row, RowIdRow, SqlValue};
pub use stratadb_vtab::{ConflictPolicy, EngineError, ErrorKind, Module, Result, VirtualTable};

/// Re-exports for plan construction and module authors.
pub mod prelude {
    pub use stratadb_catalog::{
        ColumnSchema, IndexColumn, IndexSpec, SchemaChange, TableSchema, PRIMARY_INDEX,
    };
    pub use stratadb_exec::{explain, FuncRegistry};
    pub use stratadb_plan::*;
    pub use stratadb_store::{EphemeralModule, JsonEachModule, MemoryModule};
    pub use stratadb_value::{Affinity, CoercionKind};
    pub use stratadb_vtab::{
        ConflictPolicy, ConnectArgs, ConstraintInfo, ConstraintOp, FilterInfo, IndexInfo,
        RowStream, UpdateArgs,
    };
}
