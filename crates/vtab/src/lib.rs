//! The virtual-table protocol.
//!
//! Every table-like data source (ordinary tables, ephemeral scratch
//! tables, tabular functions, the schema-introspection views) implements
//! [`VirtualTable`], and a [`Module`] manufactures per-connection handles
//! for it. The executor drives tables exclusively through this contract:
//! schema advertisement, `best_index` plan negotiation, streaming `query`,
//! transactional `update` with savepoints, and schema alteration.
//!
//! This crate also owns the engine's error surface: the closed
//! [`ErrorKind`] set and [`EngineError`] that every layer above speaks.

mod error;
mod index_info;
mod module;

pub use error::{EngineError, ErrorKind, Result};
pub use index_info::{
    ConstraintInfo, ConstraintOp, ConstraintUsage, FilterInfo, IndexInfo, OrderByInfo,
};
pub use module::{
    ConflictPolicy, ConnectArgs, Module, RowStream, UpdateArgs, VirtualTable,
};
