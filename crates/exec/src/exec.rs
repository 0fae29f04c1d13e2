//! Driving the instruction graph.
//!
//! One statement is one cooperative task: operators are authored as
//! streams that suspend only at virtual-table boundaries, while scalar
//! evaluation stays synchronous. Every operator checks the cancellation
//! flag between rows and releases its cursors and row-context frames on
//! all exit paths (guards + stream drop).

use crate::context::ExecCtx;
use crate::instr::{Instr, InstrGraph, InstrId, RootKind, ScanInstr, SortKeyInstr};
use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use stratadb_plan::{BinaryOp, JoinKind, UnaryOp};
use stratadb_value::{
    add, and3, compare, concat, div, glob_match, is_truthy, like_match, mul, neg, not3, or3, rem,
    storage_cmp, sub, Collation, Row, SqlValue,
};
use stratadb_vtab::{ConflictPolicy, EngineError, FilterInfo, Result, UpdateArgs};

/// Savepoint index reserved for per-statement rollback; user savepoints
/// always sit below it.
const STATEMENT_SAVEPOINT: usize = usize::MAX;

/// Result of one DML root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmlSummary {
    pub rows_affected: u64,
    pub last_rowid: Option<i64>,
}

/// What a statement produces when driven.
pub enum StatementOutput {
    Rows(BoxStream<'static, Result<Row>>),
    Summary(DmlSummary),
}

/// Drive the root instruction.
pub async fn execute(graph: Arc<InstrGraph>, ctx: Arc<ExecCtx>) -> Result<StatementOutput> {
    match graph.root_kind {
        RootKind::Rows { .. } => {
            let root = graph.root;
            Ok(StatementOutput::Rows(exec_rows(graph, root, ctx)))
        }
        RootKind::Dml => {
            let summary = run_dml(&graph, graph.root, &ctx).await?;
            Ok(StatementOutput::Summary(summary))
        }
        RootKind::Ddl => {
            run_ddl(&graph, graph.root, &ctx).await?;
            Ok(StatementOutput::Summary(DmlSummary::default()))
        }
    }
}

/// Synchronous scalar evaluation. Children first, then the operation;
/// CASE branches are the deliberate exception and evaluate lazily.
pub fn eval_scalar(graph: &InstrGraph, id: InstrId, ctx: &ExecCtx) -> Result<SqlValue> {
    match graph.instr(id) {
        Instr::Literal(v) => Ok(v.clone()),
        Instr::ColumnRef { descriptor, index } => {
            let row = ctx.current_row(*descriptor)?;
            row.get(*index).cloned().ok_or_else(|| {
                EngineError::range(format!("column index {index} out of range for current row"))
            })
        }
        Instr::Param { slot } => Ok(ctx.params.get(*slot)?.clone()),
        Instr::Unary { op, input } => {
            let v = eval_scalar(graph, *input, ctx)?;
            Ok(match op {
                UnaryOp::Neg => neg(&v),
                UnaryOp::Not => match not3(is_truthy(&v)) {
                    Some(b) => SqlValue::Boolean(b),
                    None => SqlValue::Null,
                },
                UnaryOp::IsNull => SqlValue::Boolean(v.is_null()),
                UnaryOp::IsNotNull => SqlValue::Boolean(!v.is_null()),
            })
        }
        Instr::Binary { op, collation, left, right } => {
            let l = eval_scalar(graph, *left, ctx)?;
            let r = eval_scalar(graph, *right, ctx)?;
            eval_binary(*op, *collation, &l, &r)
        }
        Instr::Case { operand, whens, otherwise } => {
            let operand = operand.map(|o| eval_scalar(graph, o, ctx)).transpose()?;
            for (when, then) in whens {
                let w = eval_scalar(graph, *when, ctx)?;
                let hit = match &operand {
                    Some(op) => compare(op, &w, Collation::Binary) == Some(Ordering::Equal),
                    None => is_truthy(&w) == Some(true),
                };
                if hit {
                    return eval_scalar(graph, *then, ctx);
                }
            }
            match otherwise {
                Some(e) => eval_scalar(graph, *e, ctx),
                None => Ok(SqlValue::Null),
            }
        }
        Instr::Cast { affinity, input } => {
            let v = eval_scalar(graph, *input, ctx)?;
            Ok(affinity.apply(v))
        }
        Instr::ScalarCall { func, args } => {
            let args = args
                .iter()
                .map(|a| eval_scalar(graph, *a, ctx))
                .collect::<Result<Vec<_>>>()?;
            func.invoke(&args)
        }
        _ => Err(EngineError::internal("relational instruction evaluated as a scalar")),
    }
}

fn eval_binary(op: BinaryOp, collation: Collation, l: &SqlValue, r: &SqlValue) -> Result<SqlValue> {
    let out = match op {
        BinaryOp::Add => add(l, r),
        BinaryOp::Sub => sub(l, r),
        BinaryOp::Mul => mul(l, r),
        BinaryOp::Div => div(l, r),
        BinaryOp::Rem => rem(l, r),
        BinaryOp::Concat => concat(l, r),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            match compare(l, r, collation) {
                None => SqlValue::Null,
                Some(ord) => {
                    let b = match op {
                        BinaryOp::Eq => ord == Ordering::Equal,
                        BinaryOp::Ne => ord != Ordering::Equal,
                        BinaryOp::Lt => ord == Ordering::Less,
                        BinaryOp::Le => ord != Ordering::Greater,
                        BinaryOp::Gt => ord == Ordering::Greater,
                        BinaryOp::Ge => ord != Ordering::Less,
                        _ => unreachable!(),
                    };
                    SqlValue::Boolean(b)
                }
            }
        }
        BinaryOp::And => match and3(is_truthy(l), is_truthy(r)) {
            Some(b) => SqlValue::Boolean(b),
            None => SqlValue::Null,
        },
        BinaryOp::Or => match or3(is_truthy(l), is_truthy(r)) {
            Some(b) => SqlValue::Boolean(b),
            None => SqlValue::Null,
        },
        BinaryOp::Like => match (l.as_text(), r.as_text()) {
            (Some(text), Some(pattern)) => SqlValue::Boolean(like_match(&pattern, &text, None)),
            _ => SqlValue::Null,
        },
        BinaryOp::Glob => match (l.as_text(), r.as_text()) {
            (Some(text), Some(pattern)) => SqlValue::Boolean(glob_match(&pattern, &text)),
            _ => SqlValue::Null,
        },
    };
    Ok(out)
}

fn unshare(row: Arc<Row>) -> Row {
    Arc::try_unwrap(row).unwrap_or_else(|shared| (*shared).clone())
}

/// Execute a relational instruction as a row stream.
pub fn exec_rows(
    graph: Arc<InstrGraph>,
    id: InstrId,
    ctx: Arc<ExecCtx>,
) -> BoxStream<'static, Result<Row>> {
    match graph.instr(id) {
        Instr::Scan(_) => scan_stream(graph, id, ctx),
        Instr::Filter { .. } => filter_stream(graph, id, ctx),
        Instr::Project { .. } => project_stream(graph, id, ctx),
        Instr::NestedLoopJoin { .. } => join_stream(graph, id, ctx),
        Instr::Sort { .. } => sort_stream(graph, id, ctx),
        Instr::StreamAggregate { .. } => aggregate_stream(graph, id, ctx),
        Instr::Limit { .. } => limit_stream(graph, id, ctx),
        Instr::Values { .. } => values_stream(graph, id, ctx),
        _ => {
            let err = EngineError::internal("non-relational instruction executed as a stream");
            futures::stream::once(async move { Err::<Row, _>(err) }).boxed()
        }
    }
}

fn scan_stream(
    graph: Arc<InstrGraph>,
    id: InstrId,
    ctx: Arc<ExecCtx>,
) -> BoxStream<'static, Result<Row>> {
    try_stream! {
        let Instr::Scan(scan) = graph.instr(id) else {
            unreachable!("dispatched on Scan");
        };
        let ScanInstr { handle, idx_num, idx_str, constraints, argv, with_rowid, .. } = scan;
        // The filter info is determined once per execution.
        let args = argv
            .iter()
            .map(|a| eval_scalar(&graph, *a, &ctx))
            .collect::<Result<Vec<_>>>()?;
        let filter = FilterInfo {
            idx_num: *idx_num,
            idx_str: idx_str.clone(),
            args,
            constraints: constraints.clone(),
        };
        let mut rows = handle.vtab.query(filter).await?;
        while let Some(next) = rows.next().await {
            ctx.check_cancelled()?;
            let (rowid, mut row) = next?;
            if *with_rowid {
                row.push(SqlValue::Integer(rowid));
            }
            yield row;
        }
    }
    .boxed()
}

fn filter_stream(
    graph: Arc<InstrGraph>,
    id: InstrId,
    ctx: Arc<ExecCtx>,
) -> BoxStream<'static, Result<Row>> {
    try_stream! {
        let Instr::Filter { input, input_desc, predicate } = graph.instr(id) else {
            unreachable!("dispatched on Filter");
        };
        let mut rows = exec_rows(graph.clone(), *input, ctx.clone());
        while let Some(next) = rows.next().await {
            ctx.check_cancelled()?;
            let row = Arc::new(next?);
            let keep = {
                let _frame = ctx.install_row(*input_desc, row.clone());
                let v = eval_scalar(&graph, *predicate, &ctx)?;
                // Three-valued: NULL and false both drop the row.
                is_truthy(&v) == Some(true)
            };
            if keep {
                yield unshare(row);
            }
        }
    }
    .boxed()
}

fn project_stream(
    graph: Arc<InstrGraph>,
    id: InstrId,
    ctx: Arc<ExecCtx>,
) -> BoxStream<'static, Result<Row>> {
    try_stream! {
        let Instr::Project { input, input_desc, exprs } = graph.instr(id) else {
            unreachable!("dispatched on Project");
        };
        let mut rows = exec_rows(graph.clone(), *input, ctx.clone());
        while let Some(next) = rows.next().await {
            ctx.check_cancelled()?;
            let row = Arc::new(next?);
            let out = {
                let _frame = ctx.install_row(*input_desc, row);
                exprs
                    .iter()
                    .map(|e| eval_scalar(&graph, *e, &ctx))
                    .collect::<Result<Row>>()?
            };
            yield out;
        }
    }
    .boxed()
}

fn join_stream(
    graph: Arc<InstrGraph>,
    id: InstrId,
    ctx: Arc<ExecCtx>,
) -> BoxStream<'static, Result<Row>> {
    try_stream! {
        let Instr::NestedLoopJoin { kind, left, left_desc, right, right_desc, right_arity, on } =
            graph.instr(id)
        else {
            unreachable!("dispatched on NestedLoopJoin");
        };
        let mut lrows = exec_rows(graph.clone(), *left, ctx.clone());
        while let Some(lnext) = lrows.next().await {
            ctx.check_cancelled()?;
            let lrow = Arc::new(lnext?);
            let _lframe = ctx.install_row(*left_desc, lrow.clone());
            let mut matched = false;
            // Re-iterate the right side for every left row.
            let mut rrows = exec_rows(graph.clone(), *right, ctx.clone());
            while let Some(rnext) = rrows.next().await {
                ctx.check_cancelled()?;
                let rrow = Arc::new(rnext?);
                let keep = match on {
                    None => true,
                    Some(on_id) => {
                        let _rframe = ctx.install_row(*right_desc, rrow.clone());
                        is_truthy(&eval_scalar(&graph, *on_id, &ctx)?) == Some(true)
                    }
                };
                if keep {
                    matched = true;
                    let mut out = (*lrow).clone();
                    out.extend_from_slice(&rrow);
                    yield out;
                }
            }
            if *kind == JoinKind::Left && !matched {
                let mut out = (*lrow).clone();
                out.extend(std::iter::repeat(SqlValue::Null).take(*right_arity));
                yield out;
            }
        }
    }
    .boxed()
}

/// Comparator for one sort key, honoring direction, collation and NULL
/// placement.
fn key_cmp(a: &SqlValue, b: &SqlValue, key: &SortKeyInstr) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if key.nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            if key.nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => {
            let ord = compare(a, b, key.collation).unwrap_or(Ordering::Equal);
            if key.desc {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

fn sort_stream(
    graph: Arc<InstrGraph>,
    id: InstrId,
    ctx: Arc<ExecCtx>,
) -> BoxStream<'static, Result<Row>> {
    try_stream! {
        let Instr::Sort { input, input_desc, keys, passthrough } = graph.instr(id) else {
            unreachable!("dispatched on Sort");
        };
        let mut rows = exec_rows(graph.clone(), *input, ctx.clone());
        if *passthrough {
            // The scan already negotiated this order.
            while let Some(next) = rows.next().await {
                ctx.check_cancelled()?;
                yield next?;
            }
        } else {
            let mut buffer: Vec<(Vec<SqlValue>, Row)> = Vec::new();
            while let Some(next) = rows.next().await {
                ctx.check_cancelled()?;
                let row = Arc::new(next?);
                let key_vals = {
                    let _frame = ctx.install_row(*input_desc, row.clone());
                    keys.iter()
                        .map(|k| eval_scalar(&graph, k.key, &ctx))
                        .collect::<Result<Vec<_>>>()?
                };
                buffer.push((key_vals, unshare(row)));
            }
            // Stable: ties keep input order.
            buffer.sort_by(|(ka, _), (kb, _)| {
                ka.iter()
                    .zip(kb)
                    .zip(keys.iter())
                    .map(|((a, b), k)| key_cmp(a, b, k))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
            for (_, row) in buffer {
                ctx.check_cancelled()?;
                yield row;
            }
        }
    }
    .boxed()
}

fn group_keys_equal(a: &[SqlValue], b: &[SqlValue]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| storage_cmp(x, y, Collation::Binary) == Ordering::Equal)
}

fn aggregate_stream(
    graph: Arc<InstrGraph>,
    id: InstrId,
    ctx: Arc<ExecCtx>,
) -> BoxStream<'static, Result<Row>> {
    try_stream! {
        let Instr::StreamAggregate { input, input_desc, group_by, aggregates } = graph.instr(id)
        else {
            unreachable!("dispatched on StreamAggregate");
        };
        let mut rows = exec_rows(graph.clone(), *input, ctx.clone());
        let mut current: Option<(Vec<SqlValue>, Vec<Vec<SqlValue>>)> = None;
        while let Some(next) = rows.next().await {
            ctx.check_cancelled()?;
            let row = Arc::new(next?);
            let (keys, arg_rows) = {
                let _frame = ctx.install_row(*input_desc, row);
                let keys = group_by
                    .iter()
                    .map(|e| eval_scalar(&graph, *e, &ctx))
                    .collect::<Result<Vec<_>>>()?;
                let arg_rows = aggregates
                    .iter()
                    .map(|agg| {
                        agg.args
                            .iter()
                            .map(|a| eval_scalar(&graph, *a, &ctx))
                            .collect::<Result<Vec<_>>>()
                    })
                    .collect::<Result<Vec<_>>>()?;
                (keys, arg_rows)
            };
            let boundary = match &current {
                Some((cur_keys, _)) => !group_keys_equal(cur_keys, &keys),
                None => false,
            };
            if boundary {
                let (done_keys, done_states) = current.take().expect("boundary implies a group");
                let mut out = done_keys;
                for (agg, state) in aggregates.iter().zip(done_states) {
                    out.push((agg.func.finalize)(state)?);
                }
                yield out;
            }
            let (_, states) = current.get_or_insert_with(|| {
                (keys.clone(), aggregates.iter().map(|a| (a.func.init)()).collect())
            });
            for ((agg, state), args) in aggregates.iter().zip(states.iter_mut()).zip(&arg_rows) {
                let next_state = (agg.func.step)(std::mem::take(state), args)?;
                *state = next_state;
            }
        }
        match current.take() {
            Some((keys, states)) => {
                let mut out = keys;
                for (agg, state) in aggregates.iter().zip(states) {
                    out.push((agg.func.finalize)(state)?);
                }
                yield out;
            }
            // Empty input: grouped aggregation emits nothing, ungrouped
            // emits one row of empty-set values.
            None if group_by.is_empty() => {
                let mut out = Vec::with_capacity(aggregates.len());
                for agg in aggregates {
                    out.push((agg.func.finalize)((agg.func.init)())?);
                }
                yield out;
            }
            None => {}
        }
    }
    .boxed()
}

fn limit_stream(
    graph: Arc<InstrGraph>,
    id: InstrId,
    ctx: Arc<ExecCtx>,
) -> BoxStream<'static, Result<Row>> {
    try_stream! {
        let Instr::Limit { input, limit, offset } = graph.instr(id) else {
            unreachable!("dispatched on Limit");
        };
        // A NULL or negative limit means unlimited, as does its absence.
        let limit = match limit {
            Some(e) => match eval_scalar(&graph, *e, &ctx)?.as_integer() {
                Some(n) if n >= 0 => Some(n as u64),
                _ => None,
            },
            None => None,
        };
        let offset = match offset {
            Some(e) => eval_scalar(&graph, *e, &ctx)?.as_integer().unwrap_or(0).max(0) as u64,
            None => 0,
        };
        if limit == Some(0) {
            return;
        }
        let mut rows = exec_rows(graph.clone(), *input, ctx.clone());
        let mut skipped = 0u64;
        let mut emitted = 0u64;
        while let Some(next) = rows.next().await {
            ctx.check_cancelled()?;
            let row = next?;
            if skipped < offset {
                skipped += 1;
                continue;
            }
            yield row;
            emitted += 1;
            if let Some(max) = limit {
                if emitted >= max {
                    // Dropping the source closes it early.
                    break;
                }
            }
        }
    }
    .boxed()
}

fn values_stream(
    graph: Arc<InstrGraph>,
    id: InstrId,
    ctx: Arc<ExecCtx>,
) -> BoxStream<'static, Result<Row>> {
    try_stream! {
        let Instr::Values { rows } = graph.instr(id) else {
            unreachable!("dispatched on Values");
        };
        for row in rows {
            ctx.check_cancelled()?;
            let out = row
                .iter()
                .map(|e| eval_scalar(&graph, *e, &ctx))
                .collect::<Result<Row>>()?;
            yield out;
        }
    }
    .boxed()
}

/// Run one DML root to completion, with per-statement rollback under the
/// reserved savepoint when the conflict policy calls for it.
#[tracing::instrument(skip_all)]
async fn run_dml(graph: &Arc<InstrGraph>, id: InstrId, ctx: &Arc<ExecCtx>) -> Result<DmlSummary> {
    let (target, policy) = match graph.instr(id) {
        Instr::Insert { target, policy, .. } => (target, *policy),
        Instr::Update { target, policy, .. } => (target, *policy),
        Instr::Delete { target, .. } => (target, ConflictPolicy::Abort),
        _ => return Err(EngineError::internal("non-DML instruction run as DML")),
    };
    ctx.tx.register_write(&target.table, &target.vtab).await?;
    let statement_rollback = policy != ConflictPolicy::Fail;
    if statement_rollback {
        target.vtab.savepoint(STATEMENT_SAVEPOINT).await?;
    }
    let result = run_dml_rows(graph, id, ctx).await;
    match &result {
        Ok(_) => {
            if statement_rollback {
                target.vtab.release(STATEMENT_SAVEPOINT).await?;
            }
        }
        Err(err) => {
            log::debug!("dml statement failed, unwinding: {err}");
            if statement_rollback {
                target.vtab.rollback_to(STATEMENT_SAVEPOINT).await?;
                target.vtab.release(STATEMENT_SAVEPOINT).await?;
            }
            if policy == ConflictPolicy::Rollback {
                ctx.tx.rollback_all().await?;
            }
        }
    }
    result
}

async fn run_dml_rows(
    graph: &Arc<InstrGraph>,
    id: InstrId,
    ctx: &Arc<ExecCtx>,
) -> Result<DmlSummary> {
    let mut summary = DmlSummary::default();
    match graph.instr(id) {
        Instr::Insert { target, source, policy } => {
            let mut rows = exec_rows(graph.clone(), *source, ctx.clone());
            while let Some(next) = rows.next().await {
                ctx.check_cancelled()?;
                let row = next?;
                if let Some(rowid) =
                    target.vtab.update(UpdateArgs::insert(row, *policy)).await?
                {
                    summary.rows_affected += 1;
                    summary.last_rowid = Some(rowid);
                }
            }
        }
        Instr::Update { target, source, source_desc, rowid_index, new_values, policy } => {
            let mut rows = exec_rows(graph.clone(), *source, ctx.clone());
            while let Some(next) = rows.next().await {
                ctx.check_cancelled()?;
                let row = Arc::new(next?);
                let rowid = row
                    .get(*rowid_index)
                    .and_then(|v| v.as_integer())
                    .ok_or_else(|| EngineError::internal("update source row lacks a rowid"))?;
                let new_row = {
                    let _frame = ctx.install_row(*source_desc, row.clone());
                    new_values
                        .iter()
                        .map(|e| eval_scalar(graph, *e, ctx))
                        .collect::<Result<Row>>()?
                };
                if target
                    .vtab
                    .update(UpdateArgs::update(rowid, new_row, *policy))
                    .await?
                    .is_some()
                {
                    summary.rows_affected += 1;
                }
            }
        }
        Instr::Delete { target, source, rowid_index, .. } => {
            let mut rows = exec_rows(graph.clone(), *source, ctx.clone());
            while let Some(next) = rows.next().await {
                ctx.check_cancelled()?;
                let row = next?;
                let rowid = row
                    .get(*rowid_index)
                    .and_then(|v| v.as_integer())
                    .ok_or_else(|| EngineError::internal("delete source row lacks a rowid"))?;
                if target.vtab.update(UpdateArgs::delete(rowid)).await?.is_some() {
                    summary.rows_affected += 1;
                }
            }
        }
        _ => return Err(EngineError::internal("non-DML instruction run as DML")),
    }
    Ok(summary)
}

#[tracing::instrument(skip_all)]
async fn run_ddl(graph: &Arc<InstrGraph>, id: InstrId, ctx: &Arc<ExecCtx>) -> Result<()> {
    match graph.instr(id) {
        Instr::CreateTable { schema, options } => {
            let mut opts = BTreeMap::new();
            for (name, instr) in options {
                opts.insert(name.clone(), eval_scalar(graph, *instr, ctx)?);
            }
            ctx.db.create_table(schema.clone(), opts).await
        }
        Instr::DropTable { table } => ctx.db.drop_table(table).await,
        Instr::AlterTable { target, change } => target.vtab.alter_schema(change.clone()).await,
        Instr::CreateIndex { target, spec } => target.vtab.create_index(spec.clone()).await,
        Instr::DropIndex { target, name } => target.vtab.drop_index(name).await,
        _ => Err(EngineError::internal("non-DDL instruction run as DDL")),
    }
}
