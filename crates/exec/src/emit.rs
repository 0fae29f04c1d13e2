//! Plan-to-instruction emission.
//!
//! One emitter pass walks the plan tree bottom-up, resolving table
//! handles, running `best_index` negotiations, interning parameters and
//! memoizing shared scalar sub-expressions so each is emitted once.
//! Emitters capture plan-time constants only; nothing here inspects
//! runtime state.

use crate::context::EngineDb;
use crate::func::FuncRegistry;
use crate::instr::{
    AggInstr, Instr, InstrGraph, InstrId, ParamTable, RootKind, ScanInstr, SortKeyInstr,
    TableHandle,
};
use stratadb_plan::{
    AttributeId, Expr, NullOrder, ParamRef, PlanNode, RowDescriptor, ScanConstraint, TableRef,
};
use stratadb_value::Collation;
use stratadb_vtab::{ConstraintInfo, EngineError, IndexInfo, OrderByInfo, Result};

/// Emit `plan` into an executable instruction graph.
pub fn emit(plan: &PlanNode, db: &dyn EngineDb, registry: &FuncRegistry) -> Result<InstrGraph> {
    let mut emitter = Emitter { db, registry, instrs: Vec::new(), params: ParamTable::default(), memo: Vec::new() };
    let (root, root_kind) = emitter.emit_root(plan)?;
    Ok(InstrGraph { instrs: emitter.instrs, root, params: emitter.params, root_kind })
}

/// The attribute scope active while emitting a scalar expression: the
/// descriptors of the relations whose rows will be installed when the
/// expression runs.
#[derive(Clone, Default)]
struct Scope<'p> {
    descs: Vec<&'p RowDescriptor>,
}

impl<'p> Scope<'p> {
    fn empty() -> Self {
        Scope { descs: Vec::new() }
    }

    fn of(desc: &'p RowDescriptor) -> Self {
        Scope { descs: vec![desc] }
    }

    fn with(&self, desc: &'p RowDescriptor) -> Self {
        let mut descs = self.descs.clone();
        descs.push(desc);
        Scope { descs }
    }

    fn resolve(&self, attr: AttributeId) -> Option<(stratadb_plan::DescriptorId, usize)> {
        // Innermost scope wins, mirroring frame lookup at runtime.
        self.descs
            .iter()
            .rev()
            .find_map(|d| d.index_of(attr).map(|i| (d.id, i)))
    }

    fn signature(&self) -> Vec<stratadb_plan::DescriptorId> {
        self.descs.iter().map(|d| d.id).collect()
    }
}

struct Emitter<'a> {
    db: &'a dyn EngineDb,
    registry: &'a FuncRegistry,
    instrs: Vec<Instr>,
    params: ParamTable,
    /// `(scope signature, expression, emitted id)`; shared
    /// sub-expressions resolve to the same instruction.
    memo: Vec<(Vec<stratadb_plan::DescriptorId>, Expr, InstrId)>,
}

impl<'a> Emitter<'a> {
    fn push(&mut self, instr: Instr) -> InstrId {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(instr);
        id
    }

    fn resolve(&self, table: &TableRef) -> Result<TableHandle> {
        Ok(TableHandle { table: table.clone(), vtab: self.db.resolve_table(table)? })
    }

    fn emit_root(&mut self, plan: &PlanNode) -> Result<(InstrId, RootKind)> {
        match plan {
            PlanNode::Insert { table, source, policy } => {
                let (source_id, _) = self.emit_rel(source)?;
                let target = self.resolve(table)?;
                let id = self.push(Instr::Insert { target, source: source_id, policy: *policy });
                Ok((id, RootKind::Dml))
            }
            PlanNode::Update { table, source, rowid_attr, new_values, policy } => {
                let source_desc = source
                    .descriptor()
                    .ok_or_else(|| EngineError::internal("update source has no descriptor"))?
                    .clone();
                let rowid_index = source_desc.index_of(*rowid_attr).ok_or_else(|| {
                    EngineError::internal("update source does not carry the rowid attribute")
                })?;
                let (source_id, _) = self.emit_rel(source)?;
                let scope = Scope::of(&source_desc);
                let new_values = new_values
                    .iter()
                    .map(|e| self.emit_expr(e, &scope))
                    .collect::<Result<Vec<_>>>()?;
                let target = self.resolve(table)?;
                let id = self.push(Instr::Update {
                    target,
                    source: source_id,
                    source_desc: source_desc.id,
                    rowid_index,
                    new_values,
                    policy: *policy,
                });
                Ok((id, RootKind::Dml))
            }
            PlanNode::Delete { table, source, rowid_attr } => {
                let source_desc = source
                    .descriptor()
                    .ok_or_else(|| EngineError::internal("delete source has no descriptor"))?
                    .clone();
                let rowid_index = source_desc.index_of(*rowid_attr).ok_or_else(|| {
                    EngineError::internal("delete source does not carry the rowid attribute")
                })?;
                let (source_id, _) = self.emit_rel(source)?;
                let target = self.resolve(table)?;
                let id = self.push(Instr::Delete {
                    target,
                    source: source_id,
                    source_desc: source_desc.id,
                    rowid_index,
                });
                Ok((id, RootKind::Dml))
            }
            PlanNode::CreateTable { schema, options } => {
                let scope = Scope::empty();
                let options = options
                    .iter()
                    .map(|(k, e)| Ok((k.clone(), self.emit_expr(e, &scope)?)))
                    .collect::<Result<Vec<_>>>()?;
                let id = self.push(Instr::CreateTable { schema: schema.clone(), options });
                Ok((id, RootKind::Ddl))
            }
            PlanNode::DropTable { table } => {
                let id = self.push(Instr::DropTable { table: table.clone() });
                Ok((id, RootKind::Ddl))
            }
            PlanNode::AlterTable { table, change } => {
                let target = self.resolve(table)?;
                let id = self.push(Instr::AlterTable { target, change: change.clone() });
                Ok((id, RootKind::Ddl))
            }
            PlanNode::CreateIndex { table, spec } => {
                let target = self.resolve(table)?;
                let id = self.push(Instr::CreateIndex { target, spec: spec.clone() });
                Ok((id, RootKind::Ddl))
            }
            PlanNode::DropIndex { table, name } => {
                let target = self.resolve(table)?;
                let id = self.push(Instr::DropIndex { target, name: name.clone() });
                Ok((id, RootKind::Ddl))
            }
            relational => {
                let arity = relational
                    .descriptor()
                    .map(|d| d.arity())
                    .ok_or_else(|| EngineError::internal("relational plan without a descriptor"))?;
                let (id, _) = self.emit_rel(relational)?;
                Ok((id, RootKind::Rows { arity }))
            }
        }
    }

    /// Emit a relational node. The second result reports whether the
    /// relation's rows already arrive in the order the enclosing Sort
    /// asked the scan for.
    fn emit_rel(&mut self, node: &PlanNode) -> Result<(InstrId, bool)> {
        match node {
            PlanNode::TableScan { table, descriptor, constraints, order_hint, with_rowid } => {
                self.emit_scan(table, descriptor, constraints, order_hint, *with_rowid)
            }
            PlanNode::Filter { input, predicate } => {
                let input_desc = input
                    .descriptor()
                    .ok_or_else(|| EngineError::internal("filter input has no descriptor"))?
                    .clone();
                let (input_id, ordered) = self.emit_rel(input)?;
                let predicate = self.emit_expr(predicate, &Scope::of(&input_desc))?;
                let id =
                    self.push(Instr::Filter { input: input_id, input_desc: input_desc.id, predicate });
                Ok((id, ordered))
            }
            PlanNode::Project { input, exprs, .. } => {
                let input_desc = input
                    .descriptor()
                    .ok_or_else(|| EngineError::internal("project input has no descriptor"))?
                    .clone();
                let (input_id, ordered) = self.emit_rel(input)?;
                let scope = Scope::of(&input_desc);
                let exprs = exprs
                    .iter()
                    .map(|e| self.emit_expr(e, &scope))
                    .collect::<Result<Vec<_>>>()?;
                let id =
                    self.push(Instr::Project { input: input_id, input_desc: input_desc.id, exprs });
                Ok((id, ordered))
            }
            PlanNode::Join { kind, left, right, on, .. } => {
                let left_desc = left
                    .descriptor()
                    .ok_or_else(|| EngineError::internal("join left input has no descriptor"))?
                    .clone();
                let right_desc = right
                    .descriptor()
                    .ok_or_else(|| EngineError::internal("join right input has no descriptor"))?
                    .clone();
                let (left_id, _) = self.emit_rel(left)?;
                let (right_id, _) = self.emit_rel(right)?;
                let on = on
                    .as_ref()
                    .map(|e| self.emit_expr(e, &Scope::of(&left_desc).with(&right_desc)))
                    .transpose()?;
                let id = self.push(Instr::NestedLoopJoin {
                    kind: *kind,
                    left: left_id,
                    left_desc: left_desc.id,
                    right: right_id,
                    right_desc: right_desc.id,
                    right_arity: right_desc.arity(),
                    on,
                });
                Ok((id, false))
            }
            PlanNode::Sort { input, keys } => {
                let input_desc = input
                    .descriptor()
                    .ok_or_else(|| EngineError::internal("sort input has no descriptor"))?
                    .clone();
                let (input_id, ordered) = self.emit_rel(input)?;
                let scope = Scope::of(&input_desc);
                let keys = keys
                    .iter()
                    .map(|k| {
                        Ok(SortKeyInstr {
                            key: self.emit_expr(&k.expr, &scope)?,
                            desc: k.desc,
                            nulls_first: match k.nulls {
                                Some(NullOrder::First) => true,
                                Some(NullOrder::Last) => false,
                                // Default policy: NULLS LAST ascending,
                                // NULLS FIRST descending.
                                None => k.desc,
                            },
                            collation: k.collation,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let id = self.push(Instr::Sort {
                    input: input_id,
                    input_desc: input_desc.id,
                    keys,
                    passthrough: ordered,
                });
                Ok((id, true))
            }
            PlanNode::Aggregate { input, group_by, aggregates, .. } => {
                let input_desc = input
                    .descriptor()
                    .ok_or_else(|| EngineError::internal("aggregate input has no descriptor"))?
                    .clone();
                let (input_id, _) = self.emit_rel(input)?;
                let scope = Scope::of(&input_desc);
                let group_by = group_by
                    .iter()
                    .map(|e| self.emit_expr(e, &scope))
                    .collect::<Result<Vec<_>>>()?;
                let aggregates = aggregates
                    .iter()
                    .map(|call| {
                        let func = self.registry.aggregate(&call.func)?;
                        func.check_arity(call.args.len())?;
                        let args = call
                            .args
                            .iter()
                            .map(|e| self.emit_expr(e, &scope))
                            .collect::<Result<Vec<_>>>()?;
                        Ok(AggInstr { func, args })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let id = self.push(Instr::StreamAggregate {
                    input: input_id,
                    input_desc: input_desc.id,
                    group_by,
                    aggregates,
                });
                Ok((id, false))
            }
            PlanNode::Limit { input, limit, offset } => {
                let (input_id, ordered) = self.emit_rel(input)?;
                let scope = Scope::empty();
                let limit = limit.as_ref().map(|e| self.emit_expr(e, &scope)).transpose()?;
                let offset = offset.as_ref().map(|e| self.emit_expr(e, &scope)).transpose()?;
                let id = self.push(Instr::Limit { input: input_id, limit, offset });
                Ok((id, ordered))
            }
            PlanNode::Values { rows, .. } => {
                let scope = Scope::empty();
                let rows = rows
                    .iter()
                    .map(|row| row.iter().map(|e| self.emit_expr(e, &scope)).collect())
                    .collect::<Result<Vec<Vec<_>>>>()?;
                let id = self.push(Instr::Values { rows });
                Ok((id, false))
            }
            other => Err(EngineError::internal(format!(
                "{} node is not relational",
                other.node_type()
            ))),
        }
    }

    fn emit_scan(
        &mut self,
        table: &TableRef,
        descriptor: &RowDescriptor,
        constraints: &[ScanConstraint],
        order_hint: &[stratadb_plan::ScanOrderHint],
        with_rowid: Option<AttributeId>,
    ) -> Result<(InstrId, bool)> {
        let handle = self.resolve(table)?;
        let infos: Vec<ConstraintInfo> = constraints
            .iter()
            .map(|c| ConstraintInfo { column: c.column, op: c.op, usable: true })
            .collect();
        let order_by: Vec<OrderByInfo> = order_hint
            .iter()
            .map(|h| OrderByInfo { column: h.column, desc: h.desc })
            .collect();
        let mut info = IndexInfo::new(infos.clone(), order_by, u64::MAX);
        handle.vtab.best_index(&mut info);

        // Wire consumed constraint arguments into argv positions.
        let mut argv: Vec<Option<InstrId>> = Vec::new();
        let scope = Scope::empty();
        for (k, c) in constraints.iter().enumerate() {
            let Some(pos) = info.constraint_usage[k].argv_index else { continue };
            let idx = (pos - 1) as usize;
            if argv.len() <= idx {
                argv.resize(idx + 1, None);
            }
            let arg = c.arg.as_ref().ok_or_else(|| {
                EngineError::internal("module claimed an argument for an argument-less constraint")
            })?;
            argv[idx] = Some(self.emit_expr(arg, &scope)?);
        }
        let argv = argv
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| EngineError::internal("module left a gap in argv positions"))
            })
            .collect::<Result<Vec<_>>>()?;

        let ordered = !order_hint.is_empty() && info.order_by_consumed;
        let id = self.push(Instr::Scan(ScanInstr {
            handle,
            descriptor: descriptor.clone(),
            with_rowid: with_rowid.is_some(),
            idx_num: info.idx_num,
            idx_str: info.idx_str,
            constraints: infos,
            argv,
            order_consumed: ordered,
        }));
        Ok((id, ordered))
    }

    fn emit_expr(&mut self, expr: &Expr, scope: &Scope<'_>) -> Result<InstrId> {
        let sig = scope.signature();
        if let Some((_, _, id)) =
            self.memo.iter().find(|(s, e, _)| *s == sig && e == expr)
        {
            return Ok(*id);
        }
        let id = self.emit_expr_fresh(expr, scope)?;
        self.memo.push((sig, expr.clone(), id));
        Ok(id)
    }

    fn emit_expr_fresh(&mut self, expr: &Expr, scope: &Scope<'_>) -> Result<InstrId> {
        let instr = match expr {
            Expr::Literal(v) => Instr::Literal(v.clone()),
            Expr::Column(attr) => {
                let (descriptor, index) = scope.resolve(*attr).ok_or_else(|| {
                    EngineError::internal(format!("unresolved column reference #{attr}"))
                })?;
                Instr::ColumnRef { descriptor, index }
            }
            Expr::Param(ParamRef::Ordinal(i)) => {
                if *i == 0 {
                    return Err(EngineError::range("parameter ordinals are 1-based"));
                }
                Instr::Param { slot: self.params.intern_ordinal(*i) }
            }
            Expr::Param(ParamRef::Named(name)) => {
                Instr::Param { slot: self.params.intern_name(name) }
            }
            Expr::Unary { op, expr } => {
                let input = self.emit_expr(expr, scope)?;
                Instr::Unary { op: *op, input }
            }
            Expr::Binary { op, left, right } => {
                let collation = comparison_collation(left, right);
                let left = self.emit_expr(strip_collate(left), scope)?;
                let right = self.emit_expr(strip_collate(right), scope)?;
                Instr::Binary { op: *op, collation, left, right }
            }
            Expr::Case { operand, whens, otherwise } => {
                let operand = operand.as_ref().map(|e| self.emit_expr(e, scope)).transpose()?;
                let whens = whens
                    .iter()
                    .map(|(w, t)| Ok((self.emit_expr(w, scope)?, self.emit_expr(t, scope)?)))
                    .collect::<Result<Vec<_>>>()?;
                let otherwise =
                    otherwise.as_ref().map(|e| self.emit_expr(e, scope)).transpose()?;
                Instr::Case { operand, whens, otherwise }
            }
            Expr::Cast { expr, affinity } => {
                let input = self.emit_expr(expr, scope)?;
                Instr::Cast { affinity: *affinity, input }
            }
            Expr::Collate { expr, .. } => {
                // Standalone COLLATE is transparent; it matters only to
                // the comparison that encloses it.
                return self.emit_expr(expr, scope);
            }
            Expr::Function { name, args } => {
                let func = self.registry.scalar(name)?;
                let args = args
                    .iter()
                    .map(|e| self.emit_expr(e, scope))
                    .collect::<Result<Vec<_>>>()?;
                Instr::ScalarCall { func, args }
            }
        };
        Ok(self.push(instr))
    }
}

/// The collation a comparison runs under: an explicit COLLATE on the
/// left operand wins, then one on the right, then BINARY.
fn comparison_collation(left: &Expr, right: &Expr) -> Collation {
    if let Expr::Collate { collation, .. } = left {
        *collation
    } else if let Expr::Collate { collation, .. } = right {
        *collation
    } else {
        Collation::Binary
    }
}

fn strip_collate(expr: &Expr) -> &Expr {
    match expr {
        Expr::Collate { expr, .. } => strip_collate(expr),
        other => other,
    }
}
