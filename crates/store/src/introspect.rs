//! Read-only schema-introspection tables.
//!
//! `strata_tables`, `strata_columns` and `strata_indexes` expose the
//! catalog through the same virtual-table protocol as everything else.
//! The module is detached from the catalog itself: a provider closure
//! hands it the current schema list, so this crate needs no knowledge of
//! where schemas live.

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt as _;
use std::sync::Arc;
use stratadb_catalog::{ColumnSchema, TableSchema};
use stratadb_value::{Row, SqlValue};
use stratadb_vtab::{
    ConnectArgs, EngineError, FilterInfo, IndexInfo, Module, Result, RowStream, VirtualTable,
};

/// Supplies the schemas currently published in the catalog.
pub type SchemaProvider = Arc<dyn Fn() -> Vec<Arc<TableSchema>> + Send + Sync>;

pub struct IntrospectionModule {
    provider: SchemaProvider,
}

impl IntrospectionModule {
    pub fn new(provider: SchemaProvider) -> Self {
        IntrospectionModule { provider }
    }

    /// The three view schemas this module serves.
    pub fn table_schemas(schema_name: &str) -> Vec<TableSchema> {
        vec![
            TableSchema::new(schema_name, "strata_tables")
                .column(ColumnSchema::new("schema_name", "TEXT"))
                .column(ColumnSchema::new("table_name", "TEXT"))
                .column(ColumnSchema::new("module", "TEXT"))
                .column(ColumnSchema::new("column_count", "INTEGER"))
                .module("introspection"),
            TableSchema::new(schema_name, "strata_columns")
                .column(ColumnSchema::new("table_name", "TEXT"))
                .column(ColumnSchema::new("position", "INTEGER"))
                .column(ColumnSchema::new("column_name", "TEXT"))
                .column(ColumnSchema::new("declared_type", "TEXT"))
                .column(ColumnSchema::new("not_null", "INTEGER"))
                .column(ColumnSchema::new("collation", "TEXT"))
                .module("introspection"),
            TableSchema::new(schema_name, "strata_indexes")
                .column(ColumnSchema::new("table_name", "TEXT"))
                .column(ColumnSchema::new("index_name", "TEXT"))
                .column(ColumnSchema::new("is_unique", "INTEGER"))
                .column(ColumnSchema::new("column_count", "INTEGER"))
                .module("introspection"),
        ]
    }
}

#[async_trait]
impl Module for IntrospectionModule {
    async fn connect(&self, args: ConnectArgs) -> Result<Arc<dyn VirtualTable>> {
        let view = match args.schema.name.as_str() {
            "strata_tables" => IntrospectionView::Tables,
            "strata_columns" => IntrospectionView::Columns,
            "strata_indexes" => IntrospectionView::Indexes,
            other => {
                return Err(EngineError::not_found(format!("introspection view `{other}`")));
            }
        };
        Ok(Arc::new(IntrospectionTable {
            schema: args.schema,
            view,
            provider: self.provider.clone(),
        }))
    }
}

#[derive(Clone, Copy)]
enum IntrospectionView {
    Tables,
    Columns,
    Indexes,
}

struct IntrospectionTable {
    schema: Arc<TableSchema>,
    view: IntrospectionView,
    provider: SchemaProvider,
}

impl IntrospectionTable {
    fn rows(&self) -> Vec<Row> {
        let schemas = (self.provider)();
        match self.view {
            IntrospectionView::Tables => schemas
                .iter()
                .map(|t| {
                    vec![
                        SqlValue::Text(t.schema_name.clone()),
                        SqlValue::Text(t.name.clone()),
                        SqlValue::Text(t.module.clone()),
                        SqlValue::Integer(t.columns.len() as i64),
                    ]
                })
                .collect(),
            IntrospectionView::Columns => schemas
                .iter()
                .flat_map(|t| {
                    t.columns.iter().enumerate().map(|(i, c)| {
                        vec![
                            SqlValue::Text(t.name.clone()),
                            SqlValue::Integer(i as i64),
                            SqlValue::Text(c.name.clone()),
                            SqlValue::Text(c.decl_type.clone()),
                            SqlValue::Integer(c.not_null as i64),
                            SqlValue::Text(c.collation.name().to_owned()),
                        ]
                    })
                })
                .collect(),
            IntrospectionView::Indexes => schemas
                .iter()
                .flat_map(|t| {
                    t.indexes.iter().map(|ix| {
                        vec![
                            SqlValue::Text(t.name.clone()),
                            SqlValue::Text(ix.name.clone()),
                            SqlValue::Integer(ix.unique as i64),
                            SqlValue::Integer(ix.columns.len() as i64),
                        ]
                    })
                })
                .collect(),
        }
    }
}

#[async_trait]
impl VirtualTable for IntrospectionTable {
    fn schema(&self) -> Arc<TableSchema> {
        self.schema.clone()
    }

    fn best_index(&self, info: &mut IndexInfo) {
        // Always a full scan; the views are tiny.
        info.idx_num = 0;
        info.estimated_cost = 100.0;
        info.estimated_rows = 100;
    }

    async fn query(&self, _filter: FilterInfo) -> Result<RowStream> {
        let rows = self.rows();
        Ok(stream::iter(rows.into_iter().enumerate().map(|(i, row)| Ok((i as i64 + 1, row))))
            .boxed())
    }
}
