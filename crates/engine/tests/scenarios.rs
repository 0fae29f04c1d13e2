//! Cross-component scenarios driven through the public API: plans in,
//! rows out, with real transactions underneath.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use stratadb::prelude::*;
use stratadb::{Connection, Database, ErrorKind, SqlValue, StepResult};
use stratadb_value::Row;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn int(v: i64) -> SqlValue {
    SqlValue::Integer(v)
}

fn text(v: &str) -> SqlValue {
    SqlValue::Text(v.into())
}

fn values_node(desc_id: u32, rows: Vec<Vec<SqlValue>>) -> PlanNode {
    let arity = rows.first().map_or(0, Vec::len);
    PlanNode::Values {
        rows: rows.into_iter().map(|r| r.into_iter().map(Expr::Literal).collect()).collect(),
        descriptor: RowDescriptor::new(desc_id, (0..arity as u32).map(|i| 100 + i)),
    }
}

fn insert_plan(table: &str, rows: Vec<Vec<SqlValue>>, policy: ConflictPolicy) -> PlanNode {
    PlanNode::Insert {
        table: TableRef::new("main", table),
        source: Box::new(values_node(90, rows)),
        policy,
    }
}

fn scan_plan(table: &str, arity: u32) -> PlanNode {
    PlanNode::TableScan {
        table: TableRef::new("main", table),
        descriptor: RowDescriptor::new(1, (0..arity).map(|i| 10 + i)),
        constraints: vec![],
        order_hint: vec![],
        with_rowid: None,
    }
}

async fn run(conn: &Connection, plan: &PlanNode) -> stratadb::Result<stratadb::DmlSummary> {
    let mut stmt = conn.prepare(plan)?;
    let out = stmt.run().await;
    stmt.finalize();
    out
}

async fn rows(conn: &Connection, plan: &PlanNode) -> Vec<Row> {
    let mut stmt = conn.prepare(plan).unwrap();
    let mut out = Vec::new();
    while let StepResult::Row(row) = stmt.step().await.unwrap() {
        out.push(row);
    }
    stmt.finalize();
    out
}

async fn create_t(conn: &Connection) {
    let schema = TableSchema::new("main", "t")
        .column(ColumnSchema::new("a", "INT"))
        .column(ColumnSchema::new("b", "INT"))
        .primary_key([(0, false), (1, false)]);
    run(conn, &PlanNode::CreateTable { schema, options: vec![] }).await.unwrap();
}

#[tokio::test]
async fn composite_pk_uniqueness_and_order() {
    init_logging();
    let db = Database::new();
    let conn = db.connect();
    create_t(&conn).await;

    let seed = vec![
        vec![int(1), int(1)],
        vec![int(1), int(2)],
        vec![int(2), int(1)],
    ];
    assert_eq!(run(&conn, &insert_plan("t", seed, ConflictPolicy::Abort)).await.unwrap().rows_affected, 3);

    let err = run(&conn, &insert_plan("t", vec![vec![int(1), int(1)]], ConflictPolicy::Abort))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Constraint);

    // Full scan comes back in primary-key order.
    assert_eq!(
        rows(&conn, &scan_plan("t", 2)).await,
        vec![vec![int(1), int(1)], vec![int(1), int(2)], vec![int(2), int(1)]]
    );
}

#[tokio::test]
async fn secondary_index_range_scan_with_consumed_order() {
    let db = Database::new();
    let conn = db.connect();
    let schema = TableSchema::new("main", "u")
        .column(ColumnSchema::new("x", "INT"))
        .column(ColumnSchema::new("y", "TEXT"))
        .index(IndexSpec::new(
            "u_x",
            [IndexColumn { column: 0, desc: false, collation: stratadb::Collation::Binary }],
        ));
    run(&conn, &PlanNode::CreateTable { schema, options: vec![] }).await.unwrap();
    let seed = vec![
        vec![int(1), text("a")],
        vec![int(2), text("b")],
        vec![int(3), text("c")],
        vec![int(2), text("d")],
    ];
    run(&conn, &insert_plan("u", seed, ConflictPolicy::Abort)).await.unwrap();

    // WHERE x >= 2 AND x < 3 ORDER BY x: the module consumes both the
    // range and the order, so no Sort node is needed.
    let plan = PlanNode::TableScan {
        table: TableRef::new("main", "u"),
        descriptor: RowDescriptor::new(1, [10, 11]),
        constraints: vec![
            ScanConstraint { column: 0, op: ConstraintOp::Ge, arg: Some(Expr::literal(2i64)) },
            ScanConstraint { column: 0, op: ConstraintOp::Lt, arg: Some(Expr::literal(3i64)) },
        ],
        order_hint: vec![ScanOrderHint { column: 0, desc: false }],
        with_rowid: None,
    };
    let stmt = conn.prepare(&plan).unwrap();
    assert!(stmt.explain().contains("order_consumed=true"));
    drop(stmt);

    assert_eq!(
        rows(&conn, &plan).await,
        vec![vec![int(2), text("b")], vec![int(2), text("d")]]
    );
}

#[tokio::test]
async fn savepoint_rollback_keeps_outer_insert() {
    let db = Database::new();
    let conn = db.connect();
    let schema = TableSchema::new("main", "s")
        .column(ColumnSchema::new("v", "INT"))
        .primary_key([(0, false)]);
    run(&conn, &PlanNode::CreateTable { schema, options: vec![] }).await.unwrap();

    conn.begin().await.unwrap();
    run(&conn, &insert_plan("s", vec![vec![int(1)]], ConflictPolicy::Abort)).await.unwrap();
    let sp = conn.savepoint().await.unwrap();
    run(&conn, &insert_plan("s", vec![vec![int(2)]], ConflictPolicy::Abort)).await.unwrap();
    conn.rollback_to(sp).await.unwrap();
    conn.commit().await.unwrap();

    assert_eq!(rows(&conn, &scan_plan("s", 1)).await, vec![vec![int(1)]]);
}

#[tokio::test]
async fn insert_or_replace_supersedes() {
    let db = Database::new();
    let conn = db.connect();
    let schema = TableSchema::new("main", "v")
        .column(ColumnSchema::new("k", "INT"))
        .column(ColumnSchema::new("val", "TEXT"))
        .index(
            IndexSpec::new(
                "v_k",
                [IndexColumn { column: 0, desc: false, collation: stratadb::Collation::Binary }],
            )
            .unique(),
        );
    run(&conn, &PlanNode::CreateTable { schema, options: vec![] }).await.unwrap();

    run(&conn, &insert_plan("v", vec![vec![int(1), text("a")]], ConflictPolicy::Abort))
        .await
        .unwrap();
    run(&conn, &insert_plan("v", vec![vec![int(1), text("b")]], ConflictPolicy::Replace))
        .await
        .unwrap();

    assert_eq!(rows(&conn, &scan_plan("v", 2)).await, vec![vec![int(1), text("b")]]);
}

#[tokio::test]
async fn stream_aggregate_over_sorted_scan() {
    let db = Database::new();
    let conn = db.connect();
    let schema = TableSchema::new("main", "w")
        .column(ColumnSchema::new("g", "TEXT"))
        .column(ColumnSchema::new("n", "INT"));
    run(&conn, &PlanNode::CreateTable { schema, options: vec![] }).await.unwrap();
    let seed = vec![
        vec![text("B"), int(3)],
        vec![text("A"), int(1)],
        vec![text("B"), int(4)],
        vec![text("A"), int(2)],
        vec![text("B"), SqlValue::Null],
    ];
    run(&conn, &insert_plan("w", seed, ConflictPolicy::Abort)).await.unwrap();

    let sorted = PlanNode::Sort {
        input: Box::new(scan_plan("w", 2)),
        keys: vec![SortKey {
            expr: Expr::column(10),
            desc: false,
            nulls: None,
            collation: stratadb::Collation::Binary,
        }],
    };
    let plan = PlanNode::Aggregate {
        input: Box::new(sorted),
        group_by: vec![Expr::column(10)],
        aggregates: vec![
            AggCall { func: "sum".into(), args: vec![Expr::column(11)] },
            AggCall { func: "count".into(), args: vec![Expr::column(11)] },
            AggCall { func: "avg".into(), args: vec![Expr::column(11)] },
        ],
        descriptor: RowDescriptor::new(2, [20, 21, 22, 23]),
    };
    assert_eq!(
        rows(&conn, &plan).await,
        vec![
            vec![text("A"), int(3), int(2), SqlValue::Real(1.5)],
            vec![text("B"), int(7), int(2), SqlValue::Real(3.5)],
        ]
    );
}

#[tokio::test]
async fn transaction_rollback_restores_pre_state() {
    let db = Database::new();
    let conn = db.connect();
    create_t(&conn).await;
    run(&conn, &insert_plan("t", vec![vec![int(1), int(1)]], ConflictPolicy::Abort))
        .await
        .unwrap();

    conn.begin().await.unwrap();
    run(&conn, &insert_plan("t", vec![vec![int(9), int(9)]], ConflictPolicy::Abort))
        .await
        .unwrap();
    assert_eq!(rows(&conn, &scan_plan("t", 2)).await.len(), 2);
    conn.rollback().await.unwrap();

    assert_eq!(rows(&conn, &scan_plan("t", 2)).await, vec![vec![int(1), int(1)]]);
}

#[tokio::test]
async fn commit_is_atomic_for_other_connections() {
    let db = Database::new();
    let writer = db.connect();
    let reader = db.connect();
    create_t(&writer).await;

    writer.begin().await.unwrap();
    run(&writer, &insert_plan("t", vec![vec![int(1), int(1)], vec![int(2), int(2)]], ConflictPolicy::Abort))
        .await
        .unwrap();
    // Nothing visible before commit.
    assert_eq!(rows(&reader, &scan_plan("t", 2)).await.len(), 0);
    writer.commit().await.unwrap();
    // Everything visible after.
    assert_eq!(rows(&reader, &scan_plan("t", 2)).await.len(), 2);
}

#[tokio::test]
async fn ddl_inside_transaction_is_isolated_until_commit() {
    let db = Database::new();
    let one = db.connect();
    let two = db.connect();

    one.begin().await.unwrap();
    let schema = TableSchema::new("main", "staged")
        .column(ColumnSchema::new("v", "INT"))
        .primary_key([(0, false)]);
    run(&one, &PlanNode::CreateTable { schema, options: vec![] }).await.unwrap();
    run(&one, &insert_plan("staged", vec![vec![int(1)]], ConflictPolicy::Abort)).await.unwrap();

    // The other connection cannot see the staged table.
    let err = two.prepare(&scan_plan("staged", 1)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    one.commit().await.unwrap();
    assert_eq!(rows(&two, &scan_plan("staged", 1)).await, vec![vec![int(1)]]);
}

#[tokio::test]
async fn create_table_rolls_back_with_the_transaction() {
    let db = Database::new();
    let conn = db.connect();
    conn.begin().await.unwrap();
    let schema = TableSchema::new("main", "doomed").column(ColumnSchema::new("v", "INT"));
    run(&conn, &PlanNode::CreateTable { schema, options: vec![] }).await.unwrap();
    conn.rollback().await.unwrap();

    let err = conn.prepare(&scan_plan("doomed", 1)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn introspection_views_list_the_catalog() {
    let db = Database::new();
    let conn = db.connect();
    create_t(&conn).await;

    let tables = rows(&conn, &scan_plan("strata_tables", 4)).await;
    assert!(tables.iter().any(|r| r[1] == text("t")));
    assert!(tables.iter().any(|r| r[1] == text("strata_columns")));

    // Writes are rejected with ReadOnly.
    let err = run(
        &conn,
        &insert_plan(
            "strata_tables",
            vec![vec![text("main"), text("x"), text("memory"), int(0)]],
            ConflictPolicy::Abort,
        ),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ReadOnly);
}

#[tokio::test]
async fn json_each_tabular_function() {
    let db = Database::new();
    let conn = db.connect();
    let schema = JsonEachModule::table_schema("main", "doc");
    let plan = PlanNode::CreateTable {
        schema,
        options: vec![("json".to_owned(), Expr::literal("[10, 20, 30]"))],
    };
    run(&conn, &plan).await.unwrap();

    let got = rows(&conn, &scan_plan("doc", 3)).await;
    assert_eq!(got.len(), 3);
    assert_eq!(got[1][0], int(1));
    assert_eq!(got[1][1], int(20));
    assert_eq!(got[1][2], text("integer"));
}

#[tokio::test]
async fn ephemeral_tables_are_private_per_connection() {
    let db = Database::new();
    let one = db.connect();
    let two = db.connect();
    let schema = TableSchema::new("main", "scratch")
        .column(ColumnSchema::new("v", "INT"))
        .module("ephemeral");
    run(&one, &PlanNode::CreateTable { schema, options: vec![] }).await.unwrap();
    run(&one, &insert_plan("scratch", vec![vec![int(7)]], ConflictPolicy::Abort)).await.unwrap();

    assert_eq!(rows(&one, &scan_plan("scratch", 1)).await, vec![vec![int(7)]]);
    // The second connection gets its own empty private base.
    assert_eq!(rows(&two, &scan_plan("scratch", 1)).await.len(), 0);
}

#[tokio::test]
async fn statement_lifecycle_and_misuse() {
    let db = Database::new();
    let conn = db.connect();
    create_t(&conn).await;
    run(&conn, &insert_plan("t", vec![vec![int(1), int(5)], vec![int(2), int(6)]], ConflictPolicy::Abort))
        .await
        .unwrap();

    // WHERE a = ?1.
    let plan = PlanNode::Filter {
        input: Box::new(scan_plan("t", 2)),
        predicate: Expr::binary(
            BinaryOp::Eq,
            Expr::column(10),
            Expr::Param(ParamRef::Ordinal(1)),
        ),
    };
    let mut stmt = conn.prepare(&plan).unwrap();
    stmt.bind(1, 2i64).unwrap();
    let StepResult::Row(row) = stmt.step().await.unwrap() else { panic!("expected a row") };
    assert_eq!(row, vec![int(2), int(6)]);
    assert!(matches!(stmt.step().await.unwrap(), StepResult::Done));

    // Rebind and re-run after reset.
    stmt.reset().unwrap();
    stmt.bind(1, 1i64).unwrap();
    let StepResult::Row(row) = stmt.step().await.unwrap() else { panic!("expected a row") };
    assert_eq!(row, vec![int(1), int(5)]);

    stmt.finalize();
    let err = stmt.step().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Misuse);
}

#[tokio::test]
async fn alter_table_and_drop_index_through_plans() {
    let db = Database::new();
    let conn = db.connect();
    create_t(&conn).await;
    run(&conn, &insert_plan("t", vec![vec![int(1), int(1)]], ConflictPolicy::Abort))
        .await
        .unwrap();

    let alter = PlanNode::AlterTable {
        table: TableRef::new("main", "t"),
        change: SchemaChange::AddColumn(
            ColumnSchema::new("note", "TEXT").default_value(text("-")),
        ),
    };
    run(&conn, &alter).await.unwrap();
    assert_eq!(rows(&conn, &scan_plan("t", 3)).await, vec![vec![int(1), int(1), text("-")]]);

    let create_ix = PlanNode::CreateIndex {
        table: TableRef::new("main", "t"),
        spec: IndexSpec::new(
            "t_note",
            [IndexColumn { column: 2, desc: false, collation: stratadb::Collation::Binary }],
        ),
    };
    run(&conn, &create_ix).await.unwrap();
    let drop_ix = PlanNode::DropIndex { table: TableRef::new("main", "t"), name: "t_note".into() };
    run(&conn, &drop_ix).await.unwrap();
    let err = run(&conn, &drop_ix).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn plan_json_rendering_is_informational() {
    let plan = PlanNode::Filter {
        input: Box::new(scan_plan("t", 2)),
        predicate: Expr::binary(BinaryOp::Gt, Expr::column(10), Expr::literal(0i64)),
    };
    let v = stratadb::plan_to_json(&plan);
    assert_eq!(v["nodeType"], "Filter");
    assert_eq!(v["children"][0]["nodeType"], "TableScan");
    assert_eq!(v["children"][0]["relations"][0], "t");
}

#[tokio::test]
async fn custom_module_registration() {
    use async_trait::async_trait;
    use futures::StreamExt as _;
    use stratadb_vtab::{IndexInfo, Module, RowStream, VirtualTable};

    /// A fixed two-row read-only source.
    struct Fixed;
    struct FixedTable {
        schema: Arc<TableSchema>,
    }

    #[async_trait]
    impl Module for Fixed {
        async fn connect(&self, args: ConnectArgs) -> stratadb::Result<Arc<dyn VirtualTable>> {
            Ok(Arc::new(FixedTable { schema: args.schema }))
        }
    }

    #[async_trait]
    impl VirtualTable for FixedTable {
        fn schema(&self) -> Arc<TableSchema> {
            self.schema.clone()
        }

        fn best_index(&self, info: &mut IndexInfo) {
            info.estimated_cost = 2.0;
            info.estimated_rows = 2;
        }

        async fn query(&self, _filter: FilterInfo) -> stratadb::Result<RowStream> {
            Ok(futures::stream::iter([
                Ok((1, vec![SqlValue::Integer(1)])),
                Ok((2, vec![SqlValue::Integer(2)])),
            ])
            .boxed())
        }
    }

    let db = Database::new();
    db.register_module("fixed", Arc::new(Fixed));
    let conn = db.connect();
    let schema =
        TableSchema::new("main", "fx").column(ColumnSchema::new("v", "INT")).module("fixed");
    run(&conn, &PlanNode::CreateTable { schema, options: vec![] }).await.unwrap();
    assert_eq!(rows(&conn, &scan_plan("fx", 1)).await, vec![vec![int(1)], vec![int(2)]]);
}
