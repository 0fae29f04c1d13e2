use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),
    #[error("column `{0}` not found")]
    ColumnNotFound(String),
    #[error("column index {column} out of range for table `{table}`")]
    ColumnOutOfRange { table: String, column: usize },
    #[error("cannot drop primary-key column `{0}`")]
    DropPrimaryKeyColumn(String),
    #[error("cannot drop column `{column}`: referenced by index `{index}`")]
    DropIndexedColumn { column: String, index: String },
    #[error("duplicate index `{0}`")]
    DuplicateIndex(String),
    #[error("index `{0}` not found")]
    IndexNotFound(String),
    #[error("`primary` is reserved for the primary-key index")]
    ReservedIndexName,
    #[error("NOT NULL column `{0}` added without a default")]
    NotNullWithoutDefault(String),
}
