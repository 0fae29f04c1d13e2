//! The logical plan tree.
//!
//! Plans arrive here already built; the AST-to-plan builder is an
//! external collaborator. This crate defines the node and expression
//! shapes the instruction emitter consumes, the attribute/descriptor
//! machinery operators use to resolve column references at runtime, and
//! the informational JSON rendering of a plan for tooling.

mod attr;
mod expr;
mod node;
mod render;

pub use attr::{AttributeId, DescriptorId, RowDescriptor};
pub use expr::{AggCall, BinaryOp, Expr, ParamRef, UnaryOp};
pub use node::{
    JoinKind, NullOrder, PlanNode, ScanConstraint, ScanOrderHint, SortKey, TableRef,
};
pub use render::plan_to_json;
