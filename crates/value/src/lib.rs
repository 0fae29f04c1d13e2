//! The value layer of stratadb.
//!
//! Everything that flows through the engine at runtime is a [`SqlValue`].
//! This crate owns the SQLite-flavored semantics attached to those values:
//! type affinities, collations, three-valued logic, and the arithmetic
//! rules the executor leans on (NULL propagation, overflow-to-NULL).

mod affinity;
mod arith;
mod compare;
mod error;
mod value;

pub use affinity::{Affinity, CoercionKind};
pub use arith::{add, concat, div, glob_match, like_match, mul, neg, rem, sub};
pub use compare::{and3, compare, is_truthy, not3, or3, storage_cmp, Collation};
pub use error::ValueError;
pub use value::{Numeric, Row, RowIdRow, SqlValue, TypeClass};
