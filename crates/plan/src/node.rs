use crate::attr::{AttributeId, RowDescriptor};
use crate::expr::{AggCall, Expr};
use serde::{Deserialize, Serialize};
use stratadb_catalog::{IndexSpec, SchemaChange, TableSchema};
use stratadb_value::Collation;
use stratadb_vtab::{ConflictPolicy, ConstraintOp};

/// A table reference by qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub schema_name: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema_name: impl Into<String>, name: impl Into<String>) -> Self {
        TableRef { schema_name: schema_name.into(), name: name.into() }
    }
}

/// A WHERE term the plan builder has normalized into something
/// `best_index` can negotiate over: table column, operator, argument
/// expression. `IsNull` carries no argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConstraint {
    pub column: usize,
    pub op: ConstraintOp,
    pub arg: Option<Expr>,
}

/// The ordering the statement wants from a scan, offered to
/// `best_index` for `order_by_consumed` negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOrderHint {
    pub column: usize,
    pub desc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
}

/// Explicit NULL placement for one sort key. Absent means the default:
/// NULLS LAST ascending, NULLS FIRST descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub expr: Expr,
    pub desc: bool,
    pub nulls: Option<NullOrder>,
    pub collation: Collation,
}

/// One node of the logical plan tree the engine executes.
///
/// Every relational node advertises its output [`RowDescriptor`]; DML
/// and DDL nodes produce a summary instead of rows.
#[derive(Debug, Clone)]
pub enum PlanNode {
    /// One table access. `constraints` and `order_hint` feed the
    /// `best_index` negotiation; what the module does not consume stays
    /// the enclosing Filter/Sort's job.
    TableScan {
        table: TableRef,
        descriptor: RowDescriptor,
        constraints: Vec<ScanConstraint>,
        order_hint: Vec<ScanOrderHint>,
        /// When set, the trailing attribute of `descriptor` is the row's
        /// rowid rather than a table column; DML plans rely on it.
        with_rowid: Option<AttributeId>,
    },
    Filter {
        input: Box<PlanNode>,
        predicate: Expr,
    },
    Project {
        input: Box<PlanNode>,
        exprs: Vec<Expr>,
        descriptor: RowDescriptor,
    },
    Join {
        kind: JoinKind,
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        on: Option<Expr>,
        descriptor: RowDescriptor,
    },
    Sort {
        input: Box<PlanNode>,
        keys: Vec<SortKey>,
    },
    /// Streaming group-by; the input must already be ordered by the
    /// grouping expressions.
    Aggregate {
        input: Box<PlanNode>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggCall>,
        descriptor: RowDescriptor,
    },
    Limit {
        input: Box<PlanNode>,
        limit: Option<Expr>,
        offset: Option<Expr>,
    },
    Values {
        rows: Vec<Vec<Expr>>,
        descriptor: RowDescriptor,
    },
    Insert {
        table: TableRef,
        /// Produces one row per insert, already in table column order.
        source: Box<PlanNode>,
        policy: ConflictPolicy,
    },
    Update {
        table: TableRef,
        /// Produces the target rows; must carry the rowid attribute.
        source: Box<PlanNode>,
        rowid_attr: AttributeId,
        /// One expression per table column, evaluated against the
        /// source row.
        new_values: Vec<Expr>,
        policy: ConflictPolicy,
    },
    Delete {
        table: TableRef,
        source: Box<PlanNode>,
        rowid_attr: AttributeId,
    },
    CreateTable {
        schema: TableSchema,
        /// Options forwarded to the module's `connect`.
        options: Vec<(String, Expr)>,
    },
    DropTable {
        table: TableRef,
    },
    AlterTable {
        table: TableRef,
        change: SchemaChange,
    },
    CreateIndex {
        table: TableRef,
        spec: IndexSpec,
    },
    DropIndex {
        table: TableRef,
        name: String,
    },
}

impl PlanNode {
    /// The output descriptor, for relational nodes.
    pub fn descriptor(&self) -> Option<&RowDescriptor> {
        match self {
            PlanNode::TableScan { descriptor, .. }
            | PlanNode::Project { descriptor, .. }
            | PlanNode::Join { descriptor, .. }
            | PlanNode::Aggregate { descriptor, .. }
            | PlanNode::Values { descriptor, .. } => Some(descriptor),
            PlanNode::Filter { input, .. }
            | PlanNode::Sort { input, .. }
            | PlanNode::Limit { input, .. } => input.descriptor(),
            _ => None,
        }
    }

    /// Immediate children, in execution order.
    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::Filter { input, .. }
            | PlanNode::Project { input, .. }
            | PlanNode::Sort { input, .. }
            | PlanNode::Aggregate { input, .. }
            | PlanNode::Limit { input, .. } => vec![input],
            PlanNode::Join { left, right, .. } => vec![left, right],
            PlanNode::Insert { source, .. }
            | PlanNode::Update { source, .. }
            | PlanNode::Delete { source, .. } => vec![source],
            _ => vec![],
        }
    }

    /// A one-line summary used by the JSON rendering and explain output.
    pub fn label(&self) -> String {
        match self {
            PlanNode::TableScan { table, constraints, .. } => {
                if constraints.is_empty() {
                    format!("scan {}", table.name)
                } else {
                    format!("scan {} [{} pushed constraints]", table.name, constraints.len())
                }
            }
            PlanNode::Filter { predicate, .. } => format!("filter {predicate}"),
            PlanNode::Project { exprs, .. } => format!("project [{} exprs]", exprs.len()),
            PlanNode::Join { kind, on, .. } => match on {
                Some(on) => format!("{kind:?} join on {on}").to_lowercase(),
                None => format!("{kind:?} join").to_lowercase(),
            },
            PlanNode::Sort { keys, .. } => format!("sort [{} keys]", keys.len()),
            PlanNode::Aggregate { group_by, aggregates, .. } => {
                format!("aggregate [{} groups, {} aggs]", group_by.len(), aggregates.len())
            }
            PlanNode::Limit { .. } => "limit".to_owned(),
            PlanNode::Values { rows, .. } => format!("values [{} rows]", rows.len()),
            PlanNode::Insert { table, .. } => format!("insert into {}", table.name),
            PlanNode::Update { table, .. } => format!("update {}", table.name),
            PlanNode::Delete { table, .. } => format!("delete from {}", table.name),
            PlanNode::CreateTable { schema, .. } => format!("create table {}", schema.name),
            PlanNode::DropTable { table } => format!("drop table {}", table.name),
            PlanNode::AlterTable { table, .. } => format!("alter table {}", table.name),
            PlanNode::CreateIndex { table, spec } => {
                format!("create index {} on {}", spec.name, table.name)
            }
            PlanNode::DropIndex { name, table } => {
                format!("drop index {} on {}", name, table.name)
            }
        }
    }

    pub fn node_type(&self) -> &'static str {
        match self {
            PlanNode::TableScan { .. } => "TableScan",
            PlanNode::Filter { .. } => "Filter",
            PlanNode::Project { .. } => "Project",
            PlanNode::Join { .. } => "Join",
            PlanNode::Sort { .. } => "Sort",
            PlanNode::Aggregate { .. } => "Aggregate",
            PlanNode::Limit { .. } => "Limit",
            PlanNode::Values { .. } => "Values",
            PlanNode::Insert { .. } => "Insert",
            PlanNode::Update { .. } => "Update",
            PlanNode::Delete { .. } => "Delete",
            PlanNode::CreateTable { .. } => "CreateTable",
            PlanNode::DropTable { .. } => "DropTable",
            PlanNode::AlterTable { .. } => "AlterTable",
            PlanNode::CreateIndex { .. } => "CreateIndex",
            PlanNode::DropIndex { .. } => "DropIndex",
        }
    }

    /// Tables this subtree touches, for the JSON rendering.
    pub fn relations(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_relations(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_relations(&self, out: &mut Vec<String>) {
        match self {
            PlanNode::TableScan { table, .. }
            | PlanNode::Insert { table, .. }
            | PlanNode::Update { table, .. }
            | PlanNode::Delete { table, .. }
            | PlanNode::DropTable { table }
            | PlanNode::AlterTable { table, .. }
            | PlanNode::CreateIndex { table, .. }
            | PlanNode::DropIndex { table, .. } => out.push(table.name.clone()),
            PlanNode::CreateTable { schema, .. } => out.push(schema.name.clone()),
            _ => {}
        }
        for child in self.children() {
            child.collect_relations(out);
        }
    }
}
