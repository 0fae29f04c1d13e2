use serde::{Deserialize, Serialize};
use stratadb_value::SqlValue;

/// Comparison operators a constraint can carry into `best_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    IsNull,
}

/// One constraint extracted from the statement's WHERE clause: a column of
/// the table, an operator, and whether the argument is available at query
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub column: usize,
    pub op: ConstraintOp,
    pub usable: bool,
}

/// One ORDER BY term, by table column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByInfo {
    pub column: usize,
    pub desc: bool,
}

/// The module's answer for one constraint: if `argv_index` is set, the
/// executor passes the constraint's argument at that 1-based position in
/// `query`'s args; if `omit` is set, the executor need not re-evaluate the
/// predicate itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintUsage {
    pub argv_index: Option<u32>,
    pub omit: bool,
}

/// The `best_index` negotiation record. The executor fills the input
/// fields; the module fills the outputs. `best_index` never fails: a
/// module with no usable plan answers with a high cost.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    // Inputs.
    pub constraints: Vec<ConstraintInfo>,
    pub order_by: Vec<OrderByInfo>,
    /// Bitmask of table columns the statement actually reads; bit 63
    /// covers all columns past 62.
    pub used_columns: u64,

    // Outputs.
    pub constraint_usage: Vec<ConstraintUsage>,
    /// The module's plan choice, opaque to the executor.
    pub idx_num: i32,
    /// Opaque companion string to `idx_num`, round-tripped into `query`.
    pub idx_str: Option<String>,
    pub order_by_consumed: bool,
    pub estimated_cost: f64,
    pub estimated_rows: u64,
}

impl IndexInfo {
    pub fn new(
        constraints: Vec<ConstraintInfo>,
        order_by: Vec<OrderByInfo>,
        used_columns: u64,
    ) -> Self {
        let n = constraints.len();
        IndexInfo {
            constraints,
            order_by,
            used_columns,
            constraint_usage: vec![ConstraintUsage::default(); n],
            idx_num: 0,
            idx_str: None,
            order_by_consumed: false,
            estimated_cost: f64::MAX,
            estimated_rows: u64::MAX,
        }
    }
}

/// Everything `query` receives for one table access: the module's plan
/// choice echoed back, plus the constraint argument values in
/// `argv_index` order.
#[derive(Debug, Clone)]
pub struct FilterInfo {
    pub idx_num: i32,
    pub idx_str: Option<String>,
    pub args: Vec<SqlValue>,
    /// Echo of the constraints `best_index` saw, aligned with its usage
    /// answers.
    pub constraints: Vec<ConstraintInfo>,
}

impl FilterInfo {
    /// A filter that selects a full scan with no constraints.
    pub fn full_scan() -> Self {
        FilterInfo { idx_num: 0, idx_str: None, args: Vec::new(), constraints: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn usage_starts_unclaimed() {
        let info = IndexInfo::new(
            vec![ConstraintInfo { column: 0, op: ConstraintOp::Eq, usable: true }],
            vec![],
            u64::MAX,
        );
        assert_eq!(info.constraint_usage.len(), 1);
        assert_eq!(info.constraint_usage[0].argv_index, None);
        assert!(!info.order_by_consumed);
        assert_eq!(info.estimated_cost, f64::MAX);
    }
}
