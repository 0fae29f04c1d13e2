//! Minimal embedding walkthrough: create a table, load a few rows, run
//! a filtered and sorted query, and print the instruction program.
//!
//! The plan trees are built by hand here; in a full stack they come from
//! the SQL frontend.

use stratadb::prelude::*;
use stratadb::{Database, StepResult};

#[tokio::main(flavor = "current_thread")]
async fn main() -> stratadb::Result<()> {
    let db = Database::new();
    let conn = db.connect();

    // CREATE TABLE readings (sensor TEXT, value REAL), rowid-keyed.
    let schema = TableSchema::new("main", "readings")
        .column(ColumnSchema::new("sensor", "TEXT"))
        .column(ColumnSchema::new("value", "REAL"));
    conn.prepare(&PlanNode::CreateTable { schema, options: vec![] })?.run().await?;

    // INSERT INTO readings VALUES (...).
    let rows: Vec<Vec<Expr>> = [("a", 0.5), ("b", 2.25), ("a", 1.75), ("c", -0.25)]
        .into_iter()
        .map(|(s, v)| vec![Expr::literal(s), Expr::literal(v)])
        .collect();
    let insert = PlanNode::Insert {
        table: TableRef::new("main", "readings"),
        source: Box::new(PlanNode::Values {
            descriptor: RowDescriptor::new(9, [100, 101]),
            rows,
        }),
        policy: ConflictPolicy::Abort,
    };
    let summary = conn.prepare(&insert)?.run().await?;
    println!("inserted {} rows", summary.rows_affected);

    // SELECT sensor, value FROM readings WHERE value > 0 ORDER BY value DESC.
    let scan = PlanNode::TableScan {
        table: TableRef::new("main", "readings"),
        descriptor: RowDescriptor::new(1, [10, 11]),
        constraints: vec![],
        order_hint: vec![],
        with_rowid: None,
    };
    let query = PlanNode::Sort {
        input: Box::new(PlanNode::Filter {
            input: Box::new(scan),
            predicate: Expr::binary(BinaryOp::Gt, Expr::column(11), Expr::literal(0i64)),
        }),
        keys: vec![SortKey {
            expr: Expr::column(11),
            desc: true,
            nulls: None,
            collation: stratadb::Collation::Binary,
        }],
    };

    let mut stmt = conn.prepare(&query)?;
    println!("--- program ---\n{}", stmt.explain());
    while let StepResult::Row(row) = stmt.step().await? {
        println!("{} = {}", row[0], row[1]);
    }
    stmt.finalize();
    Ok(())
}
