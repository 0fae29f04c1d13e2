//! Schema definitions shared by the storage engine, the virtual-table
//! protocol and the planner-facing surface.
//!
//! Published schemas are immutable; `alter` produces a fresh
//! [`TableSchema`] that replaces the old one atomically.

mod alter;
mod error;
mod schema;

pub use alter::SchemaChange;
pub use error::SchemaError;
pub use schema::{
    CheckConstraint, CheckFn, ColumnSchema, IndexColumn, IndexSpec, TableSchema, PRIMARY_INDEX,
};
