//! Scan planning: the memory engine's `best_index` answer.
//!
//! The chosen plan is serialized into the opaque `idx_str`, round-tripped
//! by the executor, and rebuilt into concrete key-space bounds when
//! `query` runs with the constraint argument values.

use crate::key::IndexKey;
use serde::{Deserialize, Serialize};
use std::ops::Bound;
use stratadb_catalog::{IndexSpec, TableSchema, PRIMARY_INDEX};
use stratadb_value::SqlValue;
use stratadb_vtab::{ConstraintOp, ConstraintUsage, IndexInfo};

/// Where one leading equality key part comes from at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EqSource {
    /// `args[i]` from the filter call.
    Arg(usize),
    /// An `IS NULL` constraint; the key part is NULL, no argument.
    Null,
}

/// A range endpoint on the first non-equality column, already translated
/// into *key space*: descending index columns flip value-space `>` into a
/// key-space upper bound at plan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeEnd {
    pub arg: usize,
    pub inclusive: bool,
}

/// The concrete plan for a single table access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPlan {
    pub index: String,
    pub descending: bool,
    pub eq: Vec<EqSource>,
    pub lower: Option<RangeEnd>,
    pub upper: Option<RangeEnd>,
}

impl ScanPlan {
    pub fn full_scan() -> Self {
        ScanPlan {
            index: PRIMARY_INDEX.into(),
            descending: false,
            eq: Vec::new(),
            lower: None,
            upper: None,
        }
    }

    /// Resolve the plan against the argument values into B-tree bounds
    /// for `spec`. Returns `(lower, upper)` in key space.
    pub fn bounds(&self, spec: &IndexSpec, args: &[SqlValue]) -> (Bound<IndexKey>, Bound<IndexKey>) {
        let mut prefix: Vec<SqlValue> = Vec::with_capacity(self.eq.len() + 1);
        for eq in &self.eq {
            match eq {
                EqSource::Arg(i) => prefix.push(args.get(*i).cloned().unwrap_or(SqlValue::Null)),
                EqSource::Null => prefix.push(SqlValue::Null),
            }
        }
        let lower = match self.lower {
            Some(end) => {
                let mut p = prefix.clone();
                p.push(args.get(end.arg).cloned().unwrap_or(SqlValue::Null));
                // Pad the remaining columns toward the matching extreme so
                // inclusivity covers every rowid under the bound value.
                let key = IndexKey::bound(spec, &p, end.inclusive);
                if end.inclusive {
                    Bound::Included(key)
                } else {
                    Bound::Excluded(key)
                }
            }
            None => Bound::Included(IndexKey::bound(spec, &prefix, true)),
        };
        let upper = match self.upper {
            Some(end) => {
                let mut p = prefix.clone();
                p.push(args.get(end.arg).cloned().unwrap_or(SqlValue::Null));
                let key = IndexKey::bound(spec, &p, !end.inclusive);
                if end.inclusive {
                    Bound::Included(key)
                } else {
                    Bound::Excluded(key)
                }
            }
            None => Bound::Included(IndexKey::bound(spec, &prefix, false)),
        };
        (lower, upper)
    }
}

/// The outcome of planning one candidate index.
struct Candidate {
    plan: ScanPlan,
    usage: Vec<ConstraintUsage>,
    order_by_consumed: bool,
    cost: f64,
    rows: u64,
}

/// Compute the memory engine's `best_index` answer for `schema` and fill
/// `info`'s output fields. Infallible: with nothing usable the answer is
/// a full primary scan at full-table cost.
pub fn choose_plan(schema: &TableSchema, info: &mut IndexInfo, approx_rows: u64) {
    let mut candidates: Vec<Candidate> = Vec::new();

    if !schema.rowid_keyed() {
        candidates.push(plan_for_index(&schema.primary_index(), info, approx_rows, true));
    } else {
        // Rowid-keyed primary: only a full scan in insertion order.
        candidates.push(Candidate {
            plan: ScanPlan::full_scan(),
            usage: vec![ConstraintUsage::default(); info.constraints.len()],
            order_by_consumed: false,
            cost: approx_rows as f64,
            rows: approx_rows,
        });
    }
    for spec in &schema.indexes {
        candidates.push(plan_for_index(spec, info, approx_rows, spec.unique));
    }

    // A candidate that does not deliver the requested order leaves an
    // external sort behind; charge it for that.
    let sort_penalty = |c: &Candidate| {
        if info.order_by.is_empty() || c.order_by_consumed {
            0.0
        } else {
            let rows = c.rows.max(2) as f64;
            rows * rows.log2()
        }
    };
    let best = candidates
        .into_iter()
        .min_by(|a, b| {
            (a.cost + sort_penalty(a))
                .partial_cmp(&(b.cost + sort_penalty(b)))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("at least the primary candidate exists");

    info.constraint_usage = best.usage;
    info.order_by_consumed = best.order_by_consumed;
    info.estimated_cost = best.cost;
    info.estimated_rows = best.rows;
    info.idx_num = 1;
    info.idx_str =
        Some(serde_json::to_string(&best.plan).expect("scan plans always serialize"));
}

fn plan_for_index(spec: &IndexSpec, info: &IndexInfo, approx_rows: u64, unique: bool) -> Candidate {
    let mut usage = vec![ConstraintUsage::default(); info.constraints.len()];
    let mut eq: Vec<EqSource> = Vec::new();
    let mut next_arg = 0usize;
    let mut consumed = vec![false; info.constraints.len()];

    // Greedy equality prefix over the index columns.
    for ic in &spec.columns {
        let found = info.constraints.iter().enumerate().find(|(k, c)| {
            c.usable
                && !consumed[*k]
                && c.column == ic.column
                && matches!(c.op, ConstraintOp::Eq | ConstraintOp::IsNull)
        });
        match found {
            Some((k, c)) => {
                consumed[k] = true;
                match c.op {
                    ConstraintOp::Eq => {
                        usage[k] = ConstraintUsage { argv_index: Some(next_arg as u32 + 1), omit: true };
                        eq.push(EqSource::Arg(next_arg));
                        next_arg += 1;
                    }
                    ConstraintOp::IsNull => {
                        usage[k] = ConstraintUsage { argv_index: None, omit: true };
                        eq.push(EqSource::Null);
                    }
                    _ => unreachable!(),
                }
            }
            None => break,
        }
    }

    // One range bracket on the first unconstrained column.
    let mut lower = None;
    let mut upper = None;
    if let Some(ic) = spec.columns.get(eq.len()) {
        for (k, c) in info.constraints.iter().enumerate() {
            if !c.usable || consumed[k] || c.column != ic.column {
                continue;
            }
            // On a descending column, value-space lower bounds become
            // key-space upper bounds.
            let (slot, inclusive) = match c.op {
                ConstraintOp::Gt => (if ic.desc { &mut upper } else { &mut lower }, false),
                ConstraintOp::Ge => (if ic.desc { &mut upper } else { &mut lower }, true),
                ConstraintOp::Lt => (if ic.desc { &mut lower } else { &mut upper }, false),
                ConstraintOp::Le => (if ic.desc { &mut lower } else { &mut upper }, true),
                _ => continue,
            };
            if slot.is_none() {
                consumed[k] = true;
                usage[k] = ConstraintUsage { argv_index: Some(next_arg as u32 + 1), omit: true };
                *slot = Some(RangeEnd { arg: next_arg, inclusive });
                next_arg += 1;
            }
        }
    }

    let (order_by_consumed, descending) = order_consumption(spec, info);

    let full_eq = eq.len() == spec.columns.len() && !spec.columns.is_empty();
    let ranged = lower.is_some() || upper.is_some();
    let (cost, rows) = if full_eq && unique {
        (1.0, 1)
    } else if !eq.is_empty() || ranged {
        let selectivity = 1.0 / (1.0 + 9.0 * eq.len() as f64 + if ranged { 3.0 } else { 0.0 });
        let rows = ((approx_rows as f64) * selectivity).ceil() as u64;
        ((approx_rows as f64).log2().max(1.0) + rows as f64, rows.max(1))
    } else {
        (approx_rows as f64 + 1.0, approx_rows.max(1))
    };

    Candidate {
        plan: ScanPlan { index: spec.name.clone(), descending, eq, lower, upper },
        usage,
        order_by_consumed,
        cost,
        rows,
    }
}

/// Whether the requested ORDER BY is a prefix of this index's order,
/// forward or reversed.
fn order_consumption(spec: &IndexSpec, info: &IndexInfo) -> (bool, bool) {
    if info.order_by.is_empty() || info.order_by.len() > spec.columns.len() {
        return (false, false);
    }
    let forward = info
        .order_by
        .iter()
        .zip(&spec.columns)
        .all(|(ob, ic)| ob.column == ic.column && ob.desc == ic.desc);
    if forward {
        return (true, false);
    }
    let reversed = info
        .order_by
        .iter()
        .zip(&spec.columns)
        .all(|(ob, ic)| ob.column == ic.column && ob.desc != ic.desc);
    (reversed, reversed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stratadb_catalog::{ColumnSchema, IndexColumn};
    use stratadb_value::Collation;
    use stratadb_vtab::ConstraintInfo;

    fn schema() -> TableSchema {
        TableSchema::new("main", "t")
            .column(ColumnSchema::new("a", "INTEGER"))
            .column(ColumnSchema::new("b", "INTEGER"))
            .column(ColumnSchema::new("c", "TEXT"))
            .primary_key([(0, false), (1, false)])
            .index(IndexSpec::new(
                "t_c",
                [IndexColumn { column: 2, desc: false, collation: Collation::Binary }],
            ))
    }

    fn plan_of(info: &IndexInfo) -> ScanPlan {
        serde_json::from_str(info.idx_str.as_deref().unwrap()).unwrap()
    }

    #[test]
    fn full_pk_equality_is_a_point_lookup() {
        let mut info = IndexInfo::new(
            vec![
                ConstraintInfo { column: 0, op: ConstraintOp::Eq, usable: true },
                ConstraintInfo { column: 1, op: ConstraintOp::Eq, usable: true },
            ],
            vec![],
            u64::MAX,
        );
        choose_plan(&schema(), &mut info, 1000);
        let plan = plan_of(&info);
        assert_eq!(plan.index, PRIMARY_INDEX);
        assert_eq!(plan.eq, vec![EqSource::Arg(0), EqSource::Arg(1)]);
        assert_eq!(info.estimated_rows, 1);
        assert_eq!(info.constraint_usage[0].argv_index, Some(1));
        assert_eq!(info.constraint_usage[1].argv_index, Some(2));
        assert!(info.constraint_usage.iter().all(|u| u.omit));
    }

    #[test]
    fn range_on_secondary_index() {
        let mut info = IndexInfo::new(
            vec![
                ConstraintInfo { column: 2, op: ConstraintOp::Ge, usable: true },
                ConstraintInfo { column: 2, op: ConstraintOp::Lt, usable: true },
            ],
            vec![OrderByInfo { column: 2, desc: false }],
            u64::MAX,
        );
        choose_plan(&schema(), &mut info, 1000);
        let plan = plan_of(&info);
        assert_eq!(plan.index, "t_c");
        assert_eq!(plan.lower, Some(RangeEnd { arg: 0, inclusive: true }));
        assert_eq!(plan.upper, Some(RangeEnd { arg: 1, inclusive: false }));
        assert!(info.order_by_consumed);
        assert!(!plan.descending);
    }

    #[test]
    fn reversed_order_by_flips_the_scan() {
        let mut info = IndexInfo::new(vec![], vec![OrderByInfo { column: 2, desc: true }], u64::MAX);
        choose_plan(&schema(), &mut info, 1000);
        let plan = plan_of(&info);
        assert_eq!(plan.index, "t_c");
        assert!(plan.descending);
        assert!(info.order_by_consumed);
    }

    #[test]
    fn unusable_constraints_are_ignored() {
        let mut info = IndexInfo::new(
            vec![ConstraintInfo { column: 0, op: ConstraintOp::Eq, usable: false }],
            vec![],
            u64::MAX,
        );
        choose_plan(&schema(), &mut info, 1000);
        let plan = plan_of(&info);
        assert!(plan.eq.is_empty());
        assert_eq!(info.constraint_usage[0].argv_index, None);
    }

    use stratadb_vtab::OrderByInfo;
}
