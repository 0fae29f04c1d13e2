//! The MVCC change layers.
//!
//! The bottom of every stack is a [`BaseVersion`]: the committed state,
//! shared across connections and immutable once published. Above it sit
//! per-connection [`TxLayer`]s, one per open transaction or savepoint.
//! Layers shadow, but never mutate, what sits below them.
//!
//! Invariants, per layer and against everything below it:
//!   - a rowid in `inserted` is not visible below
//!   - a rowid in `deleted` or `updated` is visible below
//!   - a rowid is in at most one of the three maps

use crate::key::{IndexKey, SecondaryEntry};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use stratadb_catalog::{IndexSpec, TableSchema};
use stratadb_value::{Row, RowIdRow};

/// The committed state of one table: the primary B-tree keyed by the
/// primary-key tuple, the rowid lookaside, and one B-tree per secondary
/// index. Published behind an `Arc` and replaced wholesale at commit, so
/// readers holding the old version never block.
#[derive(Debug, Default, Clone)]
pub struct BaseVersion {
    pub primary: BTreeMap<IndexKey, RowIdRow>,
    pub by_rowid: BTreeMap<i64, IndexKey>,
    pub secondaries: HashMap<String, BTreeSet<SecondaryEntry>>,
}

impl BaseVersion {
    pub fn with_indexes<'a>(indexes: impl IntoIterator<Item = &'a IndexSpec>) -> Self {
        BaseVersion {
            primary: BTreeMap::new(),
            by_rowid: BTreeMap::new(),
            secondaries: indexes.into_iter().map(|ix| (ix.name.clone(), BTreeSet::new())).collect(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.primary.len()
    }

    pub fn get_by_rowid(&self, rowid: i64) -> Option<&RowIdRow> {
        let pk = self.by_rowid.get(&rowid)?;
        self.primary.get(pk)
    }

    /// Insert a committed row, maintaining every tree. The caller has
    /// already established that `pk` is free.
    pub fn apply_insert(&mut self, schema: &TableSchema, pk: IndexKey, rowid: i64, row: Row) {
        for ix in &schema.indexes {
            let key = IndexKey::for_row(ix, &row);
            self.secondaries
                .entry(ix.name.clone())
                .or_default()
                .insert(SecondaryEntry { key, rowid });
        }
        self.by_rowid.insert(rowid, pk.clone());
        self.primary.insert(pk, (rowid, row));
    }

    /// Remove a committed row by rowid, maintaining every tree. Returns
    /// the removed row.
    pub fn apply_delete(&mut self, schema: &TableSchema, rowid: i64) -> Option<RowIdRow> {
        let pk = self.by_rowid.remove(&rowid)?;
        let (rowid, row) = self.primary.remove(&pk)?;
        for ix in &schema.indexes {
            let key = IndexKey::for_row(ix, &row);
            if let Some(tree) = self.secondaries.get_mut(&ix.name) {
                tree.remove(&SecondaryEntry { key, rowid });
            }
        }
        Some((rowid, row))
    }

    /// Build a fresh secondary tree over the existing rows.
    pub fn build_secondary(&mut self, spec: &IndexSpec) -> &BTreeSet<SecondaryEntry> {
        let tree: BTreeSet<SecondaryEntry> = self
            .primary
            .values()
            .map(|(rowid, row)| SecondaryEntry { key: IndexKey::for_row(spec, row), rowid: *rowid })
            .collect();
        self.secondaries.entry(spec.name.clone()).or_insert(tree)
    }

    pub fn drop_secondary(&mut self, name: &str) {
        self.secondaries.remove(name);
    }

    /// Rewrite every stored row with `f`, rebuilding all trees. Used by
    /// column-level schema changes.
    pub fn remap_rows(&mut self, schema: &TableSchema, f: impl Fn(&Row) -> Row) {
        let old = std::mem::take(&mut self.primary);
        self.by_rowid.clear();
        for tree in self.secondaries.values_mut() {
            tree.clear();
        }
        let pk_spec = schema.primary_index();
        for (_, (rowid, row)) in old {
            let row = f(&row);
            let pk = if schema.rowid_keyed() {
                IndexKey::for_rowid(rowid)
            } else {
                IndexKey::for_row(&pk_spec, &row)
            };
            self.apply_insert(schema, pk, rowid, row);
        }
    }
}

/// The key-ordered view of a transaction layer's pending rows: one entry
/// per inserted or updated row, in the same key spaces as the base trees.
/// This is what lets reads inside the transaction merge in their own
/// uncommitted rows without breaking scan order.
#[derive(Debug, Default, Clone)]
pub struct Mirror {
    pub primary: BTreeMap<IndexKey, i64>,
    pub secondaries: HashMap<String, BTreeSet<SecondaryEntry>>,
}

impl Mirror {
    fn add(&mut self, schema: &TableSchema, pk_spec: &IndexSpec, rowid: i64, row: &Row) {
        let pk = if schema.rowid_keyed() {
            IndexKey::for_rowid(rowid)
        } else {
            IndexKey::for_row(pk_spec, row)
        };
        self.primary.insert(pk, rowid);
        for ix in &schema.indexes {
            self.secondaries
                .entry(ix.name.clone())
                .or_default()
                .insert(SecondaryEntry { key: IndexKey::for_row(ix, row), rowid });
        }
    }

    fn remove(&mut self, schema: &TableSchema, pk_spec: &IndexSpec, rowid: i64, row: &Row) {
        let pk = if schema.rowid_keyed() {
            IndexKey::for_rowid(rowid)
        } else {
            IndexKey::for_row(pk_spec, row)
        };
        self.primary.remove(&pk);
        for ix in &schema.indexes {
            if let Some(tree) = self.secondaries.get_mut(&ix.name) {
                tree.remove(&SecondaryEntry { key: IndexKey::for_row(ix, row), rowid });
            }
        }
    }
}

/// What a layer knows about one rowid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowVerdict<'a> {
    /// The layer does not mention the rowid.
    Absent,
    /// The layer holds this pending version.
    Present(&'a Row),
    /// The layer deletes a row visible below it.
    Deleted,
}

/// One frame of the MVCC stack: the modifications of a single
/// transaction or savepoint scope. Keyed by rowid, with a [`Mirror`] for
/// ordered reads. An atomic unit for savepoint rollback.
#[derive(Debug, Default, Clone)]
pub struct TxLayer {
    pub inserted: BTreeMap<i64, Row>,
    pub updated: BTreeMap<i64, (Row, Row)>,
    pub deleted: BTreeSet<i64>,
    pub mirror: Mirror,
}

impl TxLayer {
    pub fn mentions(&self, rowid: i64) -> bool {
        self.inserted.contains_key(&rowid)
            || self.updated.contains_key(&rowid)
            || self.deleted.contains(&rowid)
    }

    pub fn verdict(&self, rowid: i64) -> RowVerdict<'_> {
        if let Some(row) = self.inserted.get(&rowid) {
            RowVerdict::Present(row)
        } else if let Some((_, new)) = self.updated.get(&rowid) {
            RowVerdict::Present(new)
        } else if self.deleted.contains(&rowid) {
            RowVerdict::Deleted
        } else {
            RowVerdict::Absent
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Record an insert of a rowid not visible below this layer.
    pub fn record_insert(&mut self, schema: &TableSchema, pk_spec: &IndexSpec, rowid: i64, row: Row) {
        self.mirror.add(schema, pk_spec, rowid, &row);
        self.inserted.insert(rowid, row);
    }

    /// Record an update. `old` is the version visible below this layer;
    /// if this layer itself holds the current version, the existing entry
    /// is collapsed instead.
    pub fn record_update(
        &mut self,
        schema: &TableSchema,
        pk_spec: &IndexSpec,
        rowid: i64,
        old: Row,
        new: Row,
    ) {
        if let Some(cur) = self.inserted.get_mut(&rowid) {
            let prev = std::mem::replace(cur, new.clone());
            self.mirror.remove(schema, pk_spec, rowid, &prev);
            self.mirror.add(schema, pk_spec, rowid, &new);
        } else if let Some((first_old, cur)) = self.updated.get_mut(&rowid) {
            let _ = first_old;
            let prev = std::mem::replace(cur, new.clone());
            self.mirror.remove(schema, pk_spec, rowid, &prev);
            self.mirror.add(schema, pk_spec, rowid, &new);
        } else {
            debug_assert!(!self.deleted.contains(&rowid), "cannot update a row this layer deleted");
            self.mirror.add(schema, pk_spec, rowid, &new);
            self.updated.insert(rowid, (old, new));
        }
    }

    /// Record a delete. The cumulative effect of deleting a row this
    /// layer inserted is nothing at all.
    pub fn record_delete(&mut self, schema: &TableSchema, pk_spec: &IndexSpec, rowid: i64) {
        if let Some(row) = self.inserted.remove(&rowid) {
            self.mirror.remove(schema, pk_spec, rowid, &row);
        } else if let Some((_, new)) = self.updated.remove(&rowid) {
            self.mirror.remove(schema, pk_spec, rowid, &new);
            self.deleted.insert(rowid);
        } else {
            self.deleted.insert(rowid);
        }
    }

    /// Direct mirror maintenance, for callers that manage the rowid maps
    /// themselves (the fold-down path).
    pub fn mirror_add_for(&mut self, schema: &TableSchema, pk_spec: &IndexSpec, rowid: i64, row: &Row) {
        self.mirror.add(schema, pk_spec, rowid, row);
    }

    pub fn mirror_remove_for(&mut self, schema: &TableSchema, pk_spec: &IndexSpec, rowid: i64, row: &Row) {
        self.mirror.remove(schema, pk_spec, rowid, row);
    }

    /// Rebuild the mirror from scratch against a (possibly changed) set
    /// of index specs.
    pub fn rebuild_mirror(&mut self, schema: &TableSchema) {
        let pk_spec = schema.primary_index();
        self.mirror = Mirror::default();
        let rows: Vec<(i64, Row)> = self
            .inserted
            .iter()
            .map(|(r, row)| (*r, row.clone()))
            .chain(self.updated.iter().map(|(r, (_, new))| (*r, new.clone())))
            .collect();
        for (rowid, row) in rows {
            self.mirror.add(schema, &pk_spec, rowid, &row);
        }
    }

    /// Rewrite every pending row with `f`. Used by column-level schema
    /// changes; the mirror is rebuilt by the caller afterwards.
    pub fn remap_rows(&mut self, f: impl Fn(&Row) -> Row) {
        for row in self.inserted.values_mut() {
            *row = f(row);
        }
        for (old, new) in self.updated.values_mut() {
            *old = f(old);
            *new = f(new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stratadb_catalog::{ColumnSchema, IndexColumn};
    use stratadb_value::{Collation, SqlValue};

    fn schema() -> TableSchema {
        TableSchema::new("main", "t")
            .column(ColumnSchema::new("a", "INTEGER"))
            .column(ColumnSchema::new("b", "TEXT"))
            .primary_key([(0, false)])
            .index(IndexSpec::new(
                "t_b",
                [IndexColumn { column: 1, desc: false, collation: Collation::Binary }],
            ))
    }

    fn row(a: i64, b: &str) -> Row {
        vec![SqlValue::Integer(a), SqlValue::Text(b.into())]
    }

    #[test]
    fn insert_then_delete_cancels_out() {
        let s = schema();
        let pk = s.primary_index();
        let mut layer = TxLayer::default();
        layer.record_insert(&s, &pk, 1, row(1, "x"));
        assert!(layer.mentions(1));
        layer.record_delete(&s, &pk, 1);
        assert!(!layer.mentions(1));
        assert!(layer.is_empty());
        assert!(layer.mirror.primary.is_empty());
        assert!(layer.mirror.secondaries["t_b"].is_empty());
    }

    #[test]
    fn update_of_own_insert_collapses() {
        let s = schema();
        let pk = s.primary_index();
        let mut layer = TxLayer::default();
        layer.record_insert(&s, &pk, 1, row(1, "x"));
        layer.record_update(&s, &pk, 1, row(1, "x"), row(1, "y"));
        assert_eq!(layer.verdict(1), RowVerdict::Present(&row(1, "y")));
        assert!(layer.updated.is_empty());
        assert_eq!(layer.mirror.secondaries["t_b"].len(), 1);
    }

    #[test]
    fn delete_of_updated_row_keeps_only_the_delete() {
        let s = schema();
        let pk = s.primary_index();
        let mut layer = TxLayer::default();
        layer.record_update(&s, &pk, 7, row(7, "old"), row(7, "new"));
        layer.record_delete(&s, &pk, 7);
        assert_eq!(layer.verdict(7), RowVerdict::Deleted);
        assert!(layer.updated.is_empty());
        assert!(layer.mirror.primary.is_empty());
    }

    #[test]
    fn base_roundtrip_maintains_all_trees() {
        let s = schema();
        let mut base = BaseVersion::with_indexes(&s.indexes);
        let pk = IndexKey::for_row(&s.primary_index(), &row(1, "x"));
        base.apply_insert(&s, pk, 10, row(1, "x"));
        assert_eq!(base.row_count(), 1);
        assert_eq!(base.secondaries["t_b"].len(), 1);
        assert_eq!(base.get_by_rowid(10).unwrap().1, row(1, "x"));

        let removed = base.apply_delete(&s, 10).unwrap();
        assert_eq!(removed.1, row(1, "x"));
        assert_eq!(base.row_count(), 0);
        assert!(base.secondaries["t_b"].is_empty());
    }
}
