use crate::error::SchemaError;
use crate::schema::{ColumnSchema, TableSchema};

/// A single schema alteration, applied through the virtual-table
/// protocol's `alter_schema`.
#[derive(Debug, Clone)]
pub enum SchemaChange {
    AddColumn(ColumnSchema),
    DropColumn(String),
    RenameColumn { from: String, to: String },
}

impl TableSchema {
    /// Produce the schema that results from applying `change`, leaving
    /// `self` untouched. The caller publishes the result atomically.
    pub fn with_change(&self, change: &SchemaChange) -> Result<TableSchema, SchemaError> {
        let mut next = self.clone();
        match change {
            SchemaChange::AddColumn(col) => {
                if next.column_index(&col.name).is_some() {
                    return Err(SchemaError::DuplicateColumn(col.name.clone()));
                }
                if col.not_null && col.default.is_none() {
                    return Err(SchemaError::NotNullWithoutDefault(col.name.clone()));
                }
                next.columns.push(col.clone());
            }
            SchemaChange::DropColumn(name) => {
                let pos = next
                    .column_index(name)
                    .ok_or_else(|| SchemaError::ColumnNotFound(name.clone()))?;
                if next.primary_key.iter().any(|&(c, _)| c == pos) {
                    return Err(SchemaError::DropPrimaryKeyColumn(name.clone()));
                }
                if let Some(ix) =
                    next.indexes.iter().find(|ix| ix.columns.iter().any(|ic| ic.column == pos))
                {
                    return Err(SchemaError::DropIndexedColumn {
                        column: name.clone(),
                        index: ix.name.clone(),
                    });
                }
                next.columns.remove(pos);
                // Remaining key/index references shift down past the hole.
                for key in next.primary_key.iter_mut() {
                    if key.0 > pos {
                        key.0 -= 1;
                    }
                }
                for ix in next.indexes.iter_mut() {
                    for ic in ix.columns.iter_mut() {
                        if ic.column > pos {
                            ic.column -= 1;
                        }
                    }
                }
            }
            SchemaChange::RenameColumn { from, to } => {
                let pos = next
                    .column_index(from)
                    .ok_or_else(|| SchemaError::ColumnNotFound(from.clone()))?;
                if next.column_index(to).is_some_and(|other| other != pos) {
                    return Err(SchemaError::DuplicateColumn(to.clone()));
                }
                next.columns[pos].name = to.clone();
            }
        }
        next.validate()?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table() -> TableSchema {
        TableSchema::new("main", "t")
            .column(ColumnSchema::new("id", "INTEGER"))
            .column(ColumnSchema::new("name", "TEXT"))
            .primary_key([(0, false)])
    }

    #[test]
    fn add_column() {
        let next = table()
            .with_change(&SchemaChange::AddColumn(ColumnSchema::new("age", "INT")))
            .unwrap();
        assert_eq!(next.columns.len(), 3);
        // Original is untouched.
        assert_eq!(table().columns.len(), 2);
    }

    #[test]
    fn cannot_drop_primary_key_column() {
        let err = table().with_change(&SchemaChange::DropColumn("id".into())).unwrap_err();
        assert_eq!(err, SchemaError::DropPrimaryKeyColumn("id".into()));
    }

    #[test]
    fn drop_shifts_key_references() {
        let t = TableSchema::new("main", "t")
            .column(ColumnSchema::new("a", "INT"))
            .column(ColumnSchema::new("b", "INT"))
            .column(ColumnSchema::new("c", "INT"))
            .primary_key([(2, false)]);
        let next = t.with_change(&SchemaChange::DropColumn("b".into())).unwrap();
        assert_eq!(next.primary_key[0].0, 1);
    }

    #[test]
    fn rename_rejects_collisions() {
        let err = table()
            .with_change(&SchemaChange::RenameColumn { from: "name".into(), to: "ID".into() })
            .unwrap_err();
        assert_eq!(err, SchemaError::DuplicateColumn("ID".into()));
    }
}
