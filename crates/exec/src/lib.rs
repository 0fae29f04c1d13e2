//! Instruction emission and execution.
//!
//! A finished plan tree is lowered into a flat instruction graph
//! ([`emit`]) and driven by the executor ([`execute`]): scalar
//! instructions evaluate synchronously, relational ones stream rows, and
//! the only suspension points are calls through the virtual-table
//! protocol. Function invocation and the builtin registry live here too.

mod builtins;
mod context;
mod emit;
mod exec;
mod explain;
mod func;
mod instr;

pub use context::{EngineDb, ExecCtx, NoopTxHook, Params, TxHook};
pub use emit::emit;
pub use exec::{eval_scalar, exec_rows, execute, DmlSummary, StatementOutput};
pub use explain::explain;
pub use func::{AggregateFn, FuncRegistry, ScalarFn};
pub use instr::{Instr, InstrGraph, InstrId, ParamTable, RootKind};
