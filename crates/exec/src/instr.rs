//! The executable instruction graph.
//!
//! Instructions live in a flat arena and reference their parameters by
//! [`InstrId`]; shared sub-expressions are emitted once and referenced by
//! index. Scalar instructions evaluate to a single value, relational ones
//! to a row stream, DML ones to an affected-rows summary. Emission wires
//! everything; the variants carry only plan-time constants and resolved
//! table handles, never runtime state.

use crate::func::{AggregateFn, ScalarFn};
use std::collections::HashMap;
use std::sync::Arc;
use stratadb_catalog::{IndexSpec, SchemaChange, TableSchema};
use stratadb_plan::{BinaryOp, DescriptorId, JoinKind, RowDescriptor, TableRef, UnaryOp};
use stratadb_value::{Affinity, Collation, SqlValue};
use stratadb_vtab::{ConflictPolicy, ConstraintInfo, VirtualTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(pub u32);

impl InstrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A resolved table target: the reference for diagnostics, the handle
/// for work.
#[derive(Clone)]
pub struct TableHandle {
    pub table: TableRef,
    pub vtab: Arc<dyn VirtualTable>,
}

/// One table access, fully negotiated: `best_index` already ran at
/// emission and its answer is frozen here. The argument instructions are
/// evaluated once per execution, in `argv` order.
pub struct ScanInstr {
    pub handle: TableHandle,
    pub descriptor: RowDescriptor,
    /// Append the rowid as a trailing row slot (DML source scans).
    pub with_rowid: bool,
    pub idx_num: i32,
    pub idx_str: Option<String>,
    pub constraints: Vec<ConstraintInfo>,
    pub argv: Vec<InstrId>,
    /// The module promised the requested output order.
    pub order_consumed: bool,
}

pub struct SortKeyInstr {
    pub key: InstrId,
    pub desc: bool,
    pub nulls_first: bool,
    pub collation: Collation,
}

pub struct AggInstr {
    pub func: Arc<AggregateFn>,
    pub args: Vec<InstrId>,
}

pub enum Instr {
    // Scalar instructions: evaluate to one SqlValue.
    Literal(SqlValue),
    ColumnRef {
        descriptor: DescriptorId,
        index: usize,
    },
    Param {
        slot: usize,
    },
    Unary {
        op: UnaryOp,
        input: InstrId,
    },
    Binary {
        op: BinaryOp,
        collation: Collation,
        left: InstrId,
        right: InstrId,
    },
    Case {
        operand: Option<InstrId>,
        whens: Vec<(InstrId, InstrId)>,
        otherwise: Option<InstrId>,
    },
    Cast {
        affinity: Affinity,
        input: InstrId,
    },
    ScalarCall {
        func: Arc<ScalarFn>,
        args: Vec<InstrId>,
    },

    // Relational instructions: evaluate to a row stream.
    Scan(ScanInstr),
    Filter {
        input: InstrId,
        input_desc: DescriptorId,
        predicate: InstrId,
    },
    Project {
        input: InstrId,
        input_desc: DescriptorId,
        exprs: Vec<InstrId>,
    },
    NestedLoopJoin {
        kind: JoinKind,
        left: InstrId,
        left_desc: DescriptorId,
        right: InstrId,
        right_desc: DescriptorId,
        right_arity: usize,
        on: Option<InstrId>,
    },
    Sort {
        input: InstrId,
        input_desc: DescriptorId,
        keys: Vec<SortKeyInstr>,
        /// The input already arrives in the requested order.
        passthrough: bool,
    },
    StreamAggregate {
        input: InstrId,
        input_desc: DescriptorId,
        group_by: Vec<InstrId>,
        aggregates: Vec<AggInstr>,
    },
    Limit {
        input: InstrId,
        limit: Option<InstrId>,
        offset: Option<InstrId>,
    },
    Values {
        rows: Vec<Vec<InstrId>>,
    },

    // DML instructions: evaluate to a summary.
    Insert {
        target: TableHandle,
        source: InstrId,
        policy: ConflictPolicy,
    },
    Update {
        target: TableHandle,
        source: InstrId,
        source_desc: DescriptorId,
        rowid_index: usize,
        new_values: Vec<InstrId>,
        policy: ConflictPolicy,
    },
    Delete {
        target: TableHandle,
        source: InstrId,
        source_desc: DescriptorId,
        rowid_index: usize,
    },

    // DDL instructions.
    CreateTable {
        schema: TableSchema,
        options: Vec<(String, InstrId)>,
    },
    DropTable {
        table: TableRef,
    },
    AlterTable {
        target: TableHandle,
        change: SchemaChange,
    },
    CreateIndex {
        target: TableHandle,
        spec: IndexSpec,
    },
    DropIndex {
        target: TableHandle,
        name: String,
    },
}

/// What the root instruction produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// A row stream of the given arity.
    Rows { arity: usize },
    /// An affected-rows summary.
    Dml,
    /// A schema effect with an empty summary.
    Ddl,
}

/// Slot layout for statement parameters, assigned in first-encounter
/// order at emission. A 1-based ordinal or a distinct name maps to one
/// slot however often it is referenced.
#[derive(Debug, Clone, Default)]
pub struct ParamTable {
    ordinals: HashMap<usize, usize>,
    names: HashMap<String, usize>,
    total: usize,
}

impl ParamTable {
    pub fn total_slots(&self) -> usize {
        self.total
    }

    /// Slot for a 1-based ordinal, if the statement references it.
    pub fn ordinal_slot(&self, ordinal: usize) -> Option<usize> {
        self.ordinals.get(&ordinal).copied()
    }

    /// Slot for a name, with or without its `:`/`@`/`$` prefix.
    pub fn name_slot(&self, name: &str) -> Option<usize> {
        let bare = name.trim_start_matches([':', '@', '$']);
        self.names.get(bare).copied()
    }

    pub(crate) fn intern_ordinal(&mut self, ordinal: usize) -> usize {
        let total = &mut self.total;
        *self.ordinals.entry(ordinal).or_insert_with(|| {
            let slot = *total;
            *total += 1;
            slot
        })
    }

    pub(crate) fn intern_name(&mut self, name: &str) -> usize {
        let bare = name.trim_start_matches([':', '@', '$']).to_owned();
        let total = &mut self.total;
        *self.names.entry(bare).or_insert_with(|| {
            let slot = *total;
            *total += 1;
            slot
        })
    }
}

/// The emitted program: the arena, the root, the parameter layout and
/// the root's result shape.
pub struct InstrGraph {
    pub instrs: Vec<Instr>,
    pub root: InstrId,
    pub params: ParamTable,
    pub root_kind: RootKind,
}

impl std::fmt::Debug for InstrGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrGraph")
            .field("root", &self.root)
            .field("root_kind", &self.root_kind)
            .finish_non_exhaustive()
    }
}

impl InstrGraph {
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.index()]
    }
}
