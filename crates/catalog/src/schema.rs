use crate::error::SchemaError;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use stratadb_value::{Affinity, Collation, Row, SqlValue};

/// The distinguished name of a table's primary-key index.
pub const PRIMARY_INDEX: &str = "primary";

/// One column of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub decl_type: String,
    pub affinity: Affinity,
    pub not_null: bool,
    pub default: Option<SqlValue>,
    pub collation: Collation,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, decl_type: impl Into<String>) -> Self {
        let decl_type = decl_type.into();
        let affinity = Affinity::of_declared_type(&decl_type);
        ColumnSchema {
            name: name.into(),
            decl_type,
            affinity,
            not_null: false,
            default: None,
            collation: Collation::Binary,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default_value(mut self, v: SqlValue) -> Self {
        self.default = Some(v);
        self
    }

    pub fn collation(mut self, c: Collation) -> Self {
        self.collation = c;
        self
    }
}

/// One column of an index: position in the table, direction, collation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexColumn {
    pub column: usize,
    pub desc: bool,
    pub collation: Collation,
}

/// A named ordered index over a subset of a table's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub columns: SmallVec<[IndexColumn; 4]>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, columns: impl IntoIterator<Item = IndexColumn>) -> Self {
        IndexSpec {
            name: name.into(),
            columns: columns.into_iter().collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A row predicate compiled from a CHECK expression by the plan builder.
/// `None` (unknown) passes the check, per SQL semantics.
pub type CheckFn = Arc<dyn Fn(&Row) -> Option<bool> + Send + Sync>;

#[derive(Clone)]
pub struct CheckConstraint {
    pub name: String,
    pub check: CheckFn,
}

impl fmt::Debug for CheckConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckConstraint").field("name", &self.name).finish_non_exhaustive()
    }
}

/// A table's full shape. Immutable once published; alteration replaces the
/// whole schema behind an `Arc`.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub schema_name: String,
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    /// Ordered `(column, desc)` primary-key definition. Empty means the
    /// implicit rowid is the sole key.
    pub primary_key: SmallVec<[(usize, bool); 4]>,
    pub indexes: Vec<IndexSpec>,
    pub checks: Vec<CheckConstraint>,
    /// Name of the virtual-table module backing this table.
    pub module: String,
}

impl TableSchema {
    pub fn new(schema_name: impl Into<String>, name: impl Into<String>) -> Self {
        TableSchema {
            schema_name: schema_name.into(),
            name: name.into(),
            columns: Vec::new(),
            primary_key: SmallVec::new(),
            indexes: Vec::new(),
            checks: Vec::new(),
            module: "memory".into(),
        }
    }

    pub fn column(mut self, col: ColumnSchema) -> Self {
        self.columns.push(col);
        self
    }

    pub fn primary_key(mut self, cols: impl IntoIterator<Item = (usize, bool)>) -> Self {
        self.primary_key = cols.into_iter().collect();
        self
    }

    pub fn index(mut self, spec: IndexSpec) -> Self {
        self.indexes.push(spec);
        self
    }

    pub fn check(mut self, name: impl Into<String>, check: CheckFn) -> Self {
        self.checks.push(CheckConstraint { name: name.into(), check });
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Whether the table's key is the implicit rowid.
    pub fn rowid_keyed(&self) -> bool {
        self.primary_key.is_empty()
    }

    /// The primary key rendered as an [`IndexSpec`] named
    /// [`PRIMARY_INDEX`], with column collations resolved. Rowid-keyed
    /// tables produce an empty column list.
    pub fn primary_index(&self) -> IndexSpec {
        let columns = self
            .primary_key
            .iter()
            .map(|&(column, desc)| IndexColumn {
                column,
                desc,
                collation: self.columns[column].collation,
            })
            .collect();
        IndexSpec { name: PRIMARY_INDEX.into(), columns, unique: true }
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|ix| ix.name == name)
    }

    /// Validate internal consistency: column references in bounds, no
    /// duplicate column or index names, collations usable.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (i, col) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name.eq_ignore_ascii_case(&col.name)) {
                return Err(SchemaError::DuplicateColumn(col.name.clone()));
            }
        }
        for &(col, _) in &self.primary_key {
            if col >= self.columns.len() {
                return Err(SchemaError::ColumnOutOfRange { table: self.name.clone(), column: col });
            }
        }
        for (i, ix) in self.indexes.iter().enumerate() {
            if ix.name == PRIMARY_INDEX {
                return Err(SchemaError::ReservedIndexName);
            }
            if self.indexes[..i].iter().any(|other| other.name == ix.name) {
                return Err(SchemaError::DuplicateIndex(ix.name.clone()));
            }
            for ic in &ix.columns {
                if ic.column >= self.columns.len() {
                    return Err(SchemaError::ColumnOutOfRange {
                        table: self.name.clone(),
                        column: ic.column,
                    });
                }
            }
        }
        Ok(())
    }
}
