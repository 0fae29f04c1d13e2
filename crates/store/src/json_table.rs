//! A tabular view over a JSON document, in the shape of `json_each`.
//!
//! The document arrives through the connect options under the key
//! `json`. Arrays yield one row per element with integer keys; objects
//! yield one row per member with the member name as key; scalars yield a
//! single row with a NULL key.

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt as _;
use std::sync::Arc;
use stratadb_catalog::{ColumnSchema, TableSchema};
use stratadb_value::{Row, SqlValue};
use stratadb_vtab::{
    ConnectArgs, EngineError, FilterInfo, IndexInfo, Module, Result, RowStream, VirtualTable,
};

pub struct JsonEachModule;

impl JsonEachModule {
    pub fn new() -> Self {
        JsonEachModule
    }

    /// The fixed column shape every `json_each` table advertises:
    /// `(key, value, type)`.
    pub fn table_schema(schema_name: &str, name: &str) -> TableSchema {
        TableSchema::new(schema_name, name)
            .column(ColumnSchema::new("key", ""))
            .column(ColumnSchema::new("value", ""))
            .column(ColumnSchema::new("type", "TEXT"))
            .module("json_each")
    }
}

impl Default for JsonEachModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for JsonEachModule {
    async fn connect(&self, args: ConnectArgs) -> Result<Arc<dyn VirtualTable>> {
        let text = match args.options.get("json") {
            Some(SqlValue::Text(s)) => s.clone(),
            Some(other) => {
                return Err(EngineError::type_error(format!(
                    "json_each expects text, got {}",
                    other.type_name()
                )));
            }
            None => return Err(EngineError::misuse("json_each requires a `json` option")),
        };
        let doc: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| EngineError::with_cause(stratadb_vtab::ErrorKind::Type, "malformed JSON document", e))?;
        Ok(Arc::new(JsonEachTable { schema: args.schema, doc }))
    }
}

struct JsonEachTable {
    schema: Arc<TableSchema>,
    doc: serde_json::Value,
}

fn type_name_of(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(true) => "true",
        serde_json::Value::Bool(false) => "false",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        serde_json::Value::Number(_) => "real",
        serde_json::Value::String(_) => "text",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn atom_of(v: &serde_json::Value) -> SqlValue {
    match v {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        // Containers surface as their JSON text, like json_each does.
        other => SqlValue::Text(other.to_string()),
    }
}

impl JsonEachTable {
    fn rows(&self) -> Vec<Row> {
        match &self.doc {
            serde_json::Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    vec![
                        SqlValue::Integer(i as i64),
                        atom_of(v),
                        SqlValue::Text(type_name_of(v).to_owned()),
                    ]
                })
                .collect(),
            serde_json::Value::Object(members) => members
                .iter()
                .map(|(k, v)| {
                    vec![
                        SqlValue::Text(k.clone()),
                        atom_of(v),
                        SqlValue::Text(type_name_of(v).to_owned()),
                    ]
                })
                .collect(),
            scalar => {
                vec![vec![
                    SqlValue::Null,
                    atom_of(scalar),
                    SqlValue::Text(type_name_of(scalar).to_owned()),
                ]]
            }
        }
    }
}

#[async_trait]
impl VirtualTable for JsonEachTable {
    fn schema(&self) -> Arc<TableSchema> {
        self.schema.clone()
    }

    fn best_index(&self, info: &mut IndexInfo) {
        info.idx_num = 0;
        info.estimated_cost = 1000.0;
        info.estimated_rows = 1000;
    }

    async fn query(&self, _filter: FilterInfo) -> Result<RowStream> {
        let rows = self.rows();
        Ok(stream::iter(rows.into_iter().enumerate().map(|(i, row)| Ok((i as i64 + 1, row))))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use stratadb_vtab::FilterInfo;

    async fn collect(table: Arc<dyn VirtualTable>) -> Vec<Row> {
        table
            .query(FilterInfo::full_scan())
            .await
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect()
            .await
    }

    #[tokio::test]
    async fn array_document() {
        let module = JsonEachModule::new();
        let schema = Arc::new(JsonEachModule::table_schema("main", "j"));
        let mut options = BTreeMap::new();
        options.insert("json".to_owned(), SqlValue::Text("[1, \"two\", null]".into()));
        let table = module.connect(ConnectArgs { schema, create: false, options }).await.unwrap();
        let rows = collect(table).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![
            SqlValue::Integer(0),
            SqlValue::Integer(1),
            SqlValue::Text("integer".into())
        ]);
        assert_eq!(rows[1][1], SqlValue::Text("two".into()));
        assert_eq!(rows[2][1], SqlValue::Null);
    }

    #[tokio::test]
    async fn object_document_and_writes_rejected() {
        let module = JsonEachModule::new();
        let schema = Arc::new(JsonEachModule::table_schema("main", "j"));
        let mut options = BTreeMap::new();
        options.insert("json".to_owned(), SqlValue::Text("{\"a\": true}".into()));
        let table = module.connect(ConnectArgs { schema, create: false, options }).await.unwrap();
        let rows = collect(table.clone()).await;
        assert_eq!(rows, vec![vec![
            SqlValue::Text("a".into()),
            SqlValue::Integer(1),
            SqlValue::Text("true".into())
        ]]);

        let err = table
            .update(stratadb_vtab::UpdateArgs::insert(vec![], Default::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, stratadb_vtab::ErrorKind::ReadOnly);
    }

    #[tokio::test]
    async fn malformed_document_is_a_type_error() {
        let module = JsonEachModule::new();
        let schema = Arc::new(JsonEachModule::table_schema("main", "j"));
        let mut options = BTreeMap::new();
        options.insert("json".to_owned(), SqlValue::Text("{nope".into()));
        let err = module.connect(ConnectArgs { schema, create: false, options }).await.unwrap_err();
        assert_eq!(err.kind, stratadb_vtab::ErrorKind::Type);
    }
}
