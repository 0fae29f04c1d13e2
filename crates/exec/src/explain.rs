//! The canonical "explain" rendering: the instruction program as a
//! flat, indented tree of `op(params…)` lines.

use crate::instr::{Instr, InstrGraph, InstrId};
use std::fmt::Write as _;

pub fn explain(graph: &InstrGraph) -> String {
    let mut out = String::new();
    render(graph, graph.root, 0, &mut out);
    out
}

fn line(out: &mut String, depth: usize, text: &str) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    out.push_str(text);
    out.push('\n');
}

fn render(graph: &InstrGraph, id: InstrId, depth: usize, out: &mut String) {
    let mut text = String::new();
    let children: Vec<InstrId> = match graph.instr(id) {
        Instr::Literal(v) => {
            let _ = write!(text, "literal({v})");
            vec![]
        }
        Instr::ColumnRef { descriptor, index } => {
            let _ = write!(text, "column(desc={descriptor}, idx={index})");
            vec![]
        }
        Instr::Param { slot } => {
            let _ = write!(text, "param(slot={slot})");
            vec![]
        }
        Instr::Unary { op, input } => {
            let _ = write!(text, "unary({op:?})");
            vec![*input]
        }
        Instr::Binary { op, collation, left, right } => {
            let _ = write!(text, "binary({op:?}, collate={})", collation.name());
            vec![*left, *right]
        }
        Instr::Case { operand, whens, otherwise } => {
            let _ = write!(text, "case({} arms)", whens.len());
            operand
                .iter()
                .copied()
                .chain(whens.iter().flat_map(|(w, t)| [*w, *t]))
                .chain(otherwise.iter().copied())
                .collect()
        }
        Instr::Cast { affinity, input } => {
            let _ = write!(text, "cast({affinity:?})");
            vec![*input]
        }
        Instr::ScalarCall { func, args } => {
            let _ = write!(text, "call({})", func.name);
            args.clone()
        }
        Instr::Scan(scan) => {
            let _ = write!(
                text,
                "scan({}, idx_num={}, order_consumed={}{})",
                scan.handle.table.name,
                scan.idx_num,
                scan.order_consumed,
                if scan.with_rowid { ", rowid" } else { "" },
            );
            scan.argv.clone()
        }
        Instr::Filter { input, predicate, .. } => {
            text.push_str("filter");
            vec![*predicate, *input]
        }
        Instr::Project { input, exprs, .. } => {
            let _ = write!(text, "project({} cols)", exprs.len());
            exprs.iter().copied().chain([*input]).collect()
        }
        Instr::NestedLoopJoin { kind, left, right, on, .. } => {
            let _ = write!(text, "join({kind:?})");
            on.iter().copied().chain([*left, *right]).collect()
        }
        Instr::Sort { input, keys, passthrough, .. } => {
            let _ = write!(text, "sort({} keys, passthrough={passthrough})", keys.len());
            keys.iter().map(|k| k.key).chain([*input]).collect()
        }
        Instr::StreamAggregate { input, group_by, aggregates, .. } => {
            let aggs: Vec<&str> = aggregates.iter().map(|a| a.func.name.as_str()).collect();
            let _ = write!(
                text,
                "stream_aggregate(group_by={}, aggs=[{}])",
                group_by.len(),
                aggs.join(", ")
            );
            group_by
                .iter()
                .copied()
                .chain(aggregates.iter().flat_map(|a| a.args.iter().copied()))
                .chain([*input])
                .collect()
        }
        Instr::Limit { input, limit, offset } => {
            text.push_str("limit");
            limit.iter().chain(offset.iter()).copied().chain([*input]).collect()
        }
        Instr::Values { rows } => {
            let _ = write!(text, "values({} rows)", rows.len());
            rows.iter().flatten().copied().collect()
        }
        Instr::Insert { target, source, policy } => {
            let _ = write!(text, "insert({}, policy={policy:?})", target.table.name);
            vec![*source]
        }
        Instr::Update { target, source, new_values, policy, .. } => {
            let _ = write!(text, "update({}, policy={policy:?})", target.table.name);
            new_values.iter().copied().chain([*source]).collect()
        }
        Instr::Delete { target, source, .. } => {
            let _ = write!(text, "delete({})", target.table.name);
            vec![*source]
        }
        Instr::CreateTable { schema, .. } => {
            let _ = write!(text, "create_table({})", schema.name);
            vec![]
        }
        Instr::DropTable { table } => {
            let _ = write!(text, "drop_table({})", table.name);
            vec![]
        }
        Instr::AlterTable { target, .. } => {
            let _ = write!(text, "alter_table({})", target.table.name);
            vec![]
        }
        Instr::CreateIndex { target, spec } => {
            let _ = write!(text, "create_index({}.{})", target.table.name, spec.name);
            vec![]
        }
        Instr::DropIndex { target, name } => {
            let _ = write!(text, "drop_index({}.{})", target.table.name, name);
            vec![]
        }
    };
    line(out, depth, &text);
    for child in children {
        render(graph, child, depth + 1, out);
    }
}
