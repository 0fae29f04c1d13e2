//! The memory engine's table handle.
//!
//! A [`TableShared`] is the cross-connection identity of a table: its
//! published schema, the committed [`BaseVersion`], the rowid allocator
//! and the single-writer commit lock. A [`MemoryTable`] is one
//! connection's handle to it, carrying that connection's private layer
//! stack. All spec'd write algorithms (insert, update, delete, conflict
//! resolution, fold-down commit) live here.

use crate::cursor::{CursorIndex, LayerRead, MergedCursor, Snapshot};
use crate::key::IndexKey;
use crate::layers::{BaseVersion, TxLayer};
use crate::plan::{choose_plan, ScanPlan};
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt as _;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use std::collections::Bound;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use stratadb_catalog::{IndexSpec, SchemaChange, TableSchema, PRIMARY_INDEX};
use stratadb_value::{Row, SqlValue};
use stratadb_vtab::{
    ConflictPolicy, EngineError, FilterInfo, IndexInfo, Result, RowStream, UpdateArgs, VirtualTable,
};

type CommitGuard = ArcMutexGuard<RawMutex, ()>;

/// State shared by every connection's handle to one table.
pub struct TableShared {
    pub schema: RwLock<Arc<TableSchema>>,
    pub base: RwLock<Arc<BaseVersion>>,
    next_rowid: AtomicI64,
    commit_lock: Arc<Mutex<()>>,
}

impl TableShared {
    pub fn new(schema: Arc<TableSchema>) -> Arc<Self> {
        let base = BaseVersion::with_indexes(&schema.indexes);
        Arc::new(TableShared {
            schema: RwLock::new(schema),
            base: RwLock::new(Arc::new(base)),
            next_rowid: AtomicI64::new(1),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    fn allocate_rowid(&self) -> i64 {
        self.next_rowid.fetch_add(1, AtomicOrdering::Relaxed)
    }
}

/// One connection's handle to a table: the shared state plus this
/// connection's layer stack. Savepoint layers carry the savepoint index
/// they were opened for; the bottom `None` layer belongs to `begin`.
pub struct MemoryTable {
    shared: Arc<TableShared>,
    stack: Mutex<Vec<(Option<usize>, TxLayer)>>,
    /// Held between `sync` and `commit`/`rollback`; serializes writers.
    pending_commit: Mutex<Option<CommitGuard>>,
}

impl MemoryTable {
    pub fn new(shared: Arc<TableShared>) -> Self {
        MemoryTable { shared, stack: Mutex::new(Vec::new()), pending_commit: Mutex::new(None) }
    }

    fn schema_now(&self) -> Arc<TableSchema> {
        self.shared.schema.read().clone()
    }

    /// An owned view of base + this connection's layers, bottom-first.
    fn snapshot(&self) -> Snapshot {
        let base = self.shared.base.read().clone();
        let stack = self.stack.lock();
        let mut layers = Vec::with_capacity(1 + stack.len());
        layers.push(LayerRead::Base(base));
        layers.extend(stack.iter().map(|(_, layer)| LayerRead::Tx(Arc::new(layer.clone()))));
        Snapshot { layers }
    }

    /// Apply column affinities and collapse wire-only types, validating
    /// arity, NOT NULL and CHECK constraints.
    fn prepare_row(&self, schema: &TableSchema, values: Row) -> Result<Row> {
        if values.len() != schema.columns.len() {
            return Err(EngineError::range(format!(
                "table `{}` expects {} values, got {}",
                schema.name,
                schema.columns.len(),
                values.len()
            )));
        }
        let row: Row = values
            .into_iter()
            .zip(&schema.columns)
            .map(|(v, col)| col.affinity.apply(v).into_stored())
            .collect();
        for (v, col) in row.iter().zip(&schema.columns) {
            if col.not_null && v.is_null() {
                return Err(EngineError::constraint(format!(
                    "NOT NULL constraint failed: {}.{}",
                    schema.name, col.name
                )));
            }
        }
        for check in &schema.checks {
            if (check.check)(&row) == Some(false) {
                return Err(EngineError::constraint(format!(
                    "CHECK constraint failed: {} on table `{}`",
                    check.name, schema.name
                )));
            }
        }
        Ok(row)
    }

    /// The rowid of the visible row matching `key` on `index`, if any.
    fn visible_match(&self, snapshot: &Snapshot, index: CursorIndex<'_>, key: &IndexKey) -> Option<i64> {
        let cursor = MergedCursor::new(
            snapshot.clone(),
            index,
            Bound::Included(key.clone()),
            Bound::Included(key.clone()),
            false,
        );
        cursor.map(|(rowid, _)| rowid).next()
    }

    /// Find every visible row whose keys collide with `row` on the
    /// primary key or a unique secondary index, excluding `exclude`.
    /// NULL key parts never conflict.
    fn conflicting_rowids(
        &self,
        schema: &TableSchema,
        snapshot: &Snapshot,
        row: &Row,
        exclude: Option<i64>,
    ) -> Vec<(String, i64)> {
        let mut hits = Vec::new();
        if !schema.rowid_keyed() {
            let pk_spec = schema.primary_index();
            let key = IndexKey::for_row(&pk_spec, row);
            if !key.has_null() {
                if let Some(rowid) = self.visible_match(snapshot, CursorIndex::Primary, &key) {
                    if Some(rowid) != exclude {
                        hits.push((PRIMARY_INDEX.to_owned(), rowid));
                    }
                }
            }
        }
        for ix in schema.indexes.iter().filter(|ix| ix.unique) {
            let key = IndexKey::for_row(ix, row);
            if key.has_null() {
                continue;
            }
            if let Some(rowid) = self.visible_match(snapshot, CursorIndex::Secondary(&ix.name), &key)
            {
                if Some(rowid) != exclude && !hits.iter().any(|(_, r)| *r == rowid) {
                    hits.push((ix.name.clone(), rowid));
                }
            }
        }
        hits
    }

    /// Push an implicit transaction layer if no explicit one is open.
    fn top_layer_guard(&self) -> parking_lot::MutexGuard<'_, Vec<(Option<usize>, TxLayer)>> {
        let mut stack = self.stack.lock();
        if stack.is_empty() {
            stack.push((None, TxLayer::default()));
        }
        stack
    }

    fn pk_key_of(&self, schema: &TableSchema, rowid: i64, row: &Row) -> IndexKey {
        if schema.rowid_keyed() {
            IndexKey::for_rowid(rowid)
        } else {
            IndexKey::for_row(&schema.primary_index(), row)
        }
    }

    #[tracing::instrument(skip_all)]
    fn insert_row(&self, values: Row, policy: ConflictPolicy) -> Result<Option<i64>> {
        let schema = self.schema_now();
        let row = self.prepare_row(&schema, values)?;
        if !schema.rowid_keyed() {
            let key = IndexKey::for_row(&schema.primary_index(), &row);
            if key.has_null() {
                return Err(EngineError::constraint(format!(
                    "NOT NULL constraint failed: primary key of `{}`",
                    schema.name
                )));
            }
        }
        let snapshot = self.snapshot();
        let conflicts = self.conflicting_rowids(&schema, &snapshot, &row, None);
        if !conflicts.is_empty() {
            match policy {
                ConflictPolicy::Ignore => return Ok(None),
                ConflictPolicy::Replace => {
                    let pk_spec = schema.primary_index();
                    let mut stack = self.top_layer_guard();
                    let (_, top) = stack.last_mut().expect("layer just ensured");
                    for (_, rowid) in &conflicts {
                        top.record_delete(&schema, &pk_spec, *rowid);
                    }
                }
                ConflictPolicy::Rollback | ConflictPolicy::Abort | ConflictPolicy::Fail => {
                    let (index, _) = &conflicts[0];
                    return Err(EngineError::constraint(format!(
                        "UNIQUE constraint failed: index `{index}` on table `{}`",
                        schema.name
                    )));
                }
            }
        }
        let rowid = self.shared.allocate_rowid();
        let pk_spec = schema.primary_index();
        let mut stack = self.top_layer_guard();
        let (_, top) = stack.last_mut().expect("layer just ensured");
        top.record_insert(&schema, &pk_spec, rowid, row);
        Ok(Some(rowid))
    }

    #[tracing::instrument(skip_all)]
    fn update_row(&self, rowid: i64, values: Row, policy: ConflictPolicy) -> Result<Option<i64>> {
        let schema = self.schema_now();
        let snapshot = self.snapshot();
        let Some((_, old)) = snapshot.visible_row(rowid) else {
            // Updating an invisible row is a no-op, not an error.
            return Ok(None);
        };
        let new = self.prepare_row(&schema, values)?;
        if !schema.rowid_keyed() {
            let key = IndexKey::for_row(&schema.primary_index(), &new);
            if key.has_null() {
                return Err(EngineError::constraint(format!(
                    "NOT NULL constraint failed: primary key of `{}`",
                    schema.name
                )));
            }
        }
        let conflicts = self.conflicting_rowids(&schema, &snapshot, &new, Some(rowid));
        if !conflicts.is_empty() {
            match policy {
                ConflictPolicy::Ignore => return Ok(None),
                ConflictPolicy::Replace => {
                    let pk_spec = schema.primary_index();
                    let mut stack = self.top_layer_guard();
                    let (_, top) = stack.last_mut().expect("layer just ensured");
                    for (_, victim) in &conflicts {
                        top.record_delete(&schema, &pk_spec, *victim);
                    }
                }
                ConflictPolicy::Rollback | ConflictPolicy::Abort | ConflictPolicy::Fail => {
                    let (index, _) = &conflicts[0];
                    return Err(EngineError::constraint(format!(
                        "UNIQUE constraint failed: index `{index}` on table `{}`",
                        schema.name
                    )));
                }
            }
        }
        let pk_spec = schema.primary_index();
        let mut stack = self.top_layer_guard();
        let (_, top) = stack.last_mut().expect("layer just ensured");
        top.record_update(&schema, &pk_spec, rowid, old, new);
        Ok(Some(rowid))
    }

    #[tracing::instrument(skip_all)]
    fn delete_row(&self, rowid: i64) -> Result<Option<i64>> {
        let schema = self.schema_now();
        let snapshot = self.snapshot();
        if snapshot.visible_row(rowid).is_none() {
            return Ok(None);
        }
        let pk_spec = schema.primary_index();
        let mut stack = self.top_layer_guard();
        let (_, top) = stack.last_mut().expect("layer just ensured");
        top.record_delete(&schema, &pk_spec, rowid);
        Ok(Some(rowid))
    }

    /// Fold `child` into `parent`, preserving the cumulative-effect
    /// invariants. `below` is the snapshot of everything under `parent`,
    /// used to recover old versions when a delete and a re-insert meet.
    fn fold_layer(schema: &TableSchema, child: TxLayer, parent: &mut TxLayer, below: &Snapshot) {
        let pk_spec = schema.primary_index();
        for (rowid, row) in child.inserted {
            if parent.deleted.remove(&rowid) {
                let old = below
                    .visible_row(rowid)
                    .map(|(_, r)| r)
                    .expect("deleted rows are visible below their layer");
                parent.mirror_add_for(schema, &pk_spec, rowid, &row);
                parent.updated.insert(rowid, (old, row));
            } else {
                parent.record_insert(schema, &pk_spec, rowid, row);
            }
        }
        for (rowid, (old, new)) in child.updated {
            if let Some(cur) = parent.inserted.get_mut(&rowid) {
                let prev = std::mem::replace(cur, new.clone());
                parent.mirror_remove_for(schema, &pk_spec, rowid, &prev);
                parent.mirror_add_for(schema, &pk_spec, rowid, &new);
            } else if let Some((_, cur)) = parent.updated.get_mut(&rowid) {
                let prev = std::mem::replace(cur, new.clone());
                parent.mirror_remove_for(schema, &pk_spec, rowid, &prev);
                parent.mirror_add_for(schema, &pk_spec, rowid, &new);
            } else {
                parent.mirror_add_for(schema, &pk_spec, rowid, &new);
                parent.updated.insert(rowid, (old, new));
            }
        }
        for rowid in child.deleted {
            if let Some(row) = parent.inserted.remove(&rowid) {
                parent.mirror_remove_for(schema, &pk_spec, rowid, &row);
            } else if let Some((_, new)) = parent.updated.remove(&rowid) {
                parent.mirror_remove_for(schema, &pk_spec, rowid, &new);
                parent.deleted.insert(rowid);
            } else {
                parent.deleted.insert(rowid);
            }
        }
    }

    /// Collapse the whole stack into one effective layer. The fold
    /// target is always the bottom layer, so "below the parent" is just
    /// the base.
    fn collapse_stack(&self, schema: &TableSchema) -> Option<TxLayer> {
        let mut stack = self.stack.lock();
        if stack.is_empty() {
            return None;
        }
        let base = self.shared.base.read().clone();
        let layers: Vec<(Option<usize>, TxLayer)> = std::mem::take(&mut *stack);
        drop(stack);
        let below = Snapshot { layers: vec![LayerRead::Base(base)] };
        let mut iter = layers.into_iter();
        let (_, mut folded) = iter.next().expect("non-empty stack");
        for (_, layer) in iter {
            Self::fold_layer(schema, layer, &mut folded, &below);
        }
        Some(folded)
    }

    /// Replay one folded layer onto a clone of the base and publish it.
    /// Re-validates primary-key uniqueness against commits that landed
    /// since this transaction's own checks ran.
    #[tracing::instrument(skip_all)]
    fn apply_to_base(&self, schema: &TableSchema, folded: TxLayer) -> Result<()> {
        let mut next: BaseVersion = (**self.shared.base.read()).clone();
        for rowid in &folded.deleted {
            next.apply_delete(schema, *rowid);
        }
        // Remove every updated row's old version first, so updates that
        // exchange primary keys do not trip over each other.
        for rowid in folded.updated.keys() {
            next.apply_delete(schema, *rowid);
        }
        for (rowid, (_, new)) in &folded.updated {
            let pk = self.pk_key_of(schema, *rowid, new);
            if next.primary.contains_key(&pk) {
                return Err(EngineError::constraint(format!(
                    "UNIQUE constraint failed: primary key of `{}`",
                    schema.name
                )));
            }
            next.apply_insert(schema, pk, *rowid, new.clone());
        }
        for (rowid, row) in &folded.inserted {
            let pk = self.pk_key_of(schema, *rowid, row);
            if next.primary.contains_key(&pk) {
                return Err(EngineError::constraint(format!(
                    "UNIQUE constraint failed: primary key of `{}`",
                    schema.name
                )));
            }
            next.apply_insert(schema, pk, *rowid, row.clone());
        }
        log::trace!(
            "table `{}`: committed {} inserts, {} updates, {} deletes",
            schema.name,
            folded.inserted.len(),
            folded.updated.len(),
            folded.deleted.len()
        );
        *self.shared.base.write() = Arc::new(next);
        Ok(())
    }

    fn take_commit_guard(&self) -> Result<CommitGuard> {
        if let Some(guard) = self.pending_commit.lock().take() {
            return Ok(guard);
        }
        self.shared.commit_lock.try_lock_arc().ok_or_else(|| {
            EngineError::busy("another connection is committing to this table")
        })
    }
}

#[async_trait]
impl VirtualTable for MemoryTable {
    fn schema(&self) -> Arc<TableSchema> {
        self.schema_now()
    }

    fn best_index(&self, info: &mut IndexInfo) {
        let schema = self.schema_now();
        let rows = self.snapshot().approx_rows().max(1);
        choose_plan(&schema, info, rows);
    }

    #[tracing::instrument(skip_all)]
    async fn query(&self, filter: FilterInfo) -> Result<RowStream> {
        let schema = self.schema_now();
        let plan: ScanPlan = match filter.idx_str.as_deref() {
            Some(s) => serde_json::from_str(s).map_err(|e| {
                EngineError::with_cause(
                    stratadb_vtab::ErrorKind::Internal,
                    "malformed scan plan handed back to query",
                    e,
                )
            })?,
            None => ScanPlan::full_scan(),
        };
        let (index, spec);
        if plan.index == PRIMARY_INDEX {
            index = CursorIndex::Primary;
            spec = if schema.rowid_keyed() { None } else { Some(schema.primary_index()) };
        } else {
            let found = schema
                .find_index(&plan.index)
                .ok_or_else(|| EngineError::not_found(format!("index `{}`", plan.index)))?;
            index = CursorIndex::Secondary(&plan.index);
            spec = Some(found.clone());
        }
        let (lower, upper) = match &spec {
            Some(spec) => plan.bounds(spec, &filter.args),
            // Rowid-keyed primary scans are unconstrained.
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        let cursor = MergedCursor::new(self.snapshot(), index, lower, upper, plan.descending);
        Ok(stream::iter(cursor.map(Ok)).boxed())
    }

    async fn update(&self, args: UpdateArgs) -> Result<Option<i64>> {
        match (args.rowid, args.values) {
            (None, Some(values)) => self.insert_row(values, args.policy),
            (Some(rowid), Some(values)) => self.update_row(rowid, values, args.policy),
            (Some(rowid), None) => self.delete_row(rowid),
            (None, None) => Err(EngineError::misuse("update call with neither rowid nor values")),
        }
    }

    async fn begin(&self) -> Result<()> {
        let mut stack = self.stack.lock();
        if stack.is_empty() {
            stack.push((None, TxLayer::default()));
        }
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        let guard = self.take_commit_guard()?;
        *self.pending_commit.lock() = Some(guard);
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn commit(&self) -> Result<()> {
        let guard = self.take_commit_guard()?;
        let schema = self.schema_now();
        let result = match self.collapse_stack(&schema) {
            Some(folded) if !folded.is_empty() => self.apply_to_base(&schema, folded),
            _ => Ok(()),
        };
        drop(guard);
        result
    }

    async fn rollback(&self) -> Result<()> {
        self.stack.lock().clear();
        self.pending_commit.lock().take();
        Ok(())
    }

    async fn savepoint(&self, index: usize) -> Result<()> {
        let mut stack = self.stack.lock();
        if stack.is_empty() {
            stack.push((None, TxLayer::default()));
        }
        stack.push((Some(index), TxLayer::default()));
        Ok(())
    }

    async fn release(&self, index: usize) -> Result<()> {
        let schema = self.schema_now();
        let base = self.shared.base.read().clone();
        let mut stack = self.stack.lock();
        while matches!(stack.last(), Some((Some(tag), _)) if *tag >= index) {
            let (_, child) = stack.pop().expect("just matched");
            if stack.is_empty() {
                // Releasing the outermost savepoint leaves an open
                // implicit transaction.
                stack.push((None, child));
                break;
            }
            // Visibility below the parent: base plus every layer under it.
            let below = Snapshot {
                layers: std::iter::once(LayerRead::Base(base.clone()))
                    .chain(
                        stack[..stack.len() - 1]
                            .iter()
                            .map(|(_, l)| LayerRead::Tx(Arc::new(l.clone()))),
                    )
                    .collect(),
            };
            let (_, parent) = stack.last_mut().expect("checked non-empty");
            Self::fold_layer(&schema, child, parent, &below);
        }
        Ok(())
    }

    async fn rollback_to(&self, index: usize) -> Result<()> {
        let mut stack = self.stack.lock();
        while matches!(stack.last(), Some((Some(tag), _)) if *tag >= index) {
            stack.pop();
        }
        // The savepoint itself stays open, empty again.
        stack.push((Some(index), TxLayer::default()));
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn alter_schema(&self, change: SchemaChange) -> Result<()> {
        let old = self.schema_now();
        let next = Arc::new(old.with_change(&change)?);
        let transform: Option<Box<dyn Fn(&Row) -> Row + Send + Sync>> = match &change {
            SchemaChange::AddColumn(col) => {
                let default = col.default.clone().unwrap_or(SqlValue::Null);
                Some(Box::new(move |row: &Row| {
                    let mut r = row.clone();
                    r.push(default.clone());
                    r
                }))
            }
            SchemaChange::DropColumn(name) => {
                let pos = old.column_index(name).expect("validated by with_change");
                Some(Box::new(move |row: &Row| {
                    let mut r = row.clone();
                    r.remove(pos);
                    r
                }))
            }
            SchemaChange::RenameColumn { .. } => None,
        };

        let _commit = self.take_commit_guard()?;
        if let Some(f) = &transform {
            let mut next_base: BaseVersion = (**self.shared.base.read()).clone();
            next_base.remap_rows(&next, f);
            *self.shared.base.write() = Arc::new(next_base);
            let mut stack = self.stack.lock();
            for (_, layer) in stack.iter_mut() {
                layer.remap_rows(f);
                layer.rebuild_mirror(&next);
            }
        }
        *self.shared.schema.write() = next;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let old = self.schema_now();
        if spec.name == PRIMARY_INDEX {
            return Err(EngineError::constraint("`primary` is reserved for the primary-key index"));
        }
        if old.find_index(&spec.name).is_some() {
            return Err(EngineError::constraint(format!("index `{}` already exists", spec.name)));
        }
        let mut next = (*old).clone();
        next.indexes.push(spec.clone());
        next.validate()?;
        let next = Arc::new(next);

        let _commit = self.take_commit_guard()?;
        let mut next_base: BaseVersion = (**self.shared.base.read()).clone();
        let tree = next_base.build_secondary(&spec);
        if spec.unique {
            let mut prev: Option<&IndexKey> = None;
            for entry in tree.iter() {
                if !entry.key.has_null() && prev == Some(&entry.key) {
                    return Err(EngineError::constraint(format!(
                        "cannot create unique index `{}`: duplicate keys exist",
                        spec.name
                    )));
                }
                prev = Some(&entry.key);
            }
        }
        *self.shared.base.write() = Arc::new(next_base);
        let mut stack = self.stack.lock();
        for (_, layer) in stack.iter_mut() {
            layer.rebuild_mirror(&next);
        }
        drop(stack);
        *self.shared.schema.write() = next;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn drop_index(&self, name: &str) -> Result<()> {
        let old = self.schema_now();
        if old.find_index(name).is_none() {
            return Err(EngineError::not_found(format!("index `{name}`")));
        }
        let mut next = (*old).clone();
        next.indexes.retain(|ix| ix.name != name);
        let next = Arc::new(next);

        let _commit = self.take_commit_guard()?;
        let mut next_base: BaseVersion = (**self.shared.base.read()).clone();
        next_base.drop_secondary(name);
        *self.shared.base.write() = Arc::new(next_base);
        let mut stack = self.stack.lock();
        for (_, layer) in stack.iter_mut() {
            layer.rebuild_mirror(&next);
        }
        drop(stack);
        *self.shared.schema.write() = next;
        Ok(())
    }

    fn disconnect(&self) {
        self.stack.lock().clear();
        self.pending_commit.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::MemoryModule;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use stratadb_catalog::{ColumnSchema, IndexColumn};
    use stratadb_value::{Collation, RowIdRow};
    use stratadb_vtab::{ConnectArgs, ConstraintInfo, ConstraintOp, ErrorKind, Module, OrderByInfo};

    fn ints(vals: &[i64]) -> Row {
        vals.iter().map(|&v| SqlValue::Integer(v)).collect()
    }

    async fn connect(schema: TableSchema) -> (Arc<MemoryModule>, Arc<dyn VirtualTable>) {
        let module = Arc::new(MemoryModule::new());
        let table = module
            .connect(ConnectArgs {
                schema: Arc::new(schema),
                create: true,
                options: BTreeMap::new(),
            })
            .await
            .unwrap();
        (module, table)
    }

    fn composite_pk_schema() -> TableSchema {
        TableSchema::new("main", "t")
            .column(ColumnSchema::new("a", "INT"))
            .column(ColumnSchema::new("b", "INT"))
            .primary_key([(0, false), (1, false)])
    }

    async fn insert(table: &Arc<dyn VirtualTable>, row: Row) -> Result<Option<i64>> {
        table.update(UpdateArgs::insert(row, ConflictPolicy::Abort)).await
    }

    async fn full_scan(table: &Arc<dyn VirtualTable>) -> Vec<RowIdRow> {
        // Drive the real negotiation path rather than reaching inside.
        let mut info = IndexInfo::new(vec![], vec![], u64::MAX);
        table.best_index(&mut info);
        let filter = FilterInfo {
            idx_num: info.idx_num,
            idx_str: info.idx_str.clone(),
            args: vec![],
            constraints: vec![],
        };
        table.query(filter).await.unwrap().map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn composite_pk_uniqueness_and_order() {
        let (_m, table) = connect(composite_pk_schema()).await;
        for row in [ints(&[1, 1]), ints(&[1, 2]), ints(&[2, 1])] {
            insert(&table, row).await.unwrap();
        }
        let err = insert(&table, ints(&[1, 1])).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Constraint);

        let rows = full_scan(&table).await;
        assert_eq!(
            rows.iter().map(|(_, r)| r.clone()).collect::<Vec<_>>(),
            vec![ints(&[1, 1]), ints(&[1, 2]), ints(&[2, 1])]
        );
    }

    #[tokio::test]
    async fn secondary_index_range_scan_in_rowid_order() {
        let schema = TableSchema::new("main", "u")
            .column(ColumnSchema::new("x", "INT"))
            .column(ColumnSchema::new("y", "TEXT"))
            .index(IndexSpec::new(
                "u_x",
                [IndexColumn { column: 0, desc: false, collation: Collation::Binary }],
            ));
        let (_m, table) = connect(schema).await;
        for (x, y) in [(1, "a"), (2, "b"), (3, "c"), (2, "d")] {
            insert(&table, vec![SqlValue::Integer(x), SqlValue::Text(y.into())]).await.unwrap();
        }

        // WHERE x >= 2 AND x < 3 ORDER BY x.
        let mut info = IndexInfo::new(
            vec![
                ConstraintInfo { column: 0, op: ConstraintOp::Ge, usable: true },
                ConstraintInfo { column: 0, op: ConstraintOp::Lt, usable: true },
            ],
            vec![OrderByInfo { column: 0, desc: false }],
            u64::MAX,
        );
        table.best_index(&mut info);
        assert!(info.order_by_consumed);
        assert_eq!(info.constraint_usage[0].argv_index, Some(1));
        assert_eq!(info.constraint_usage[1].argv_index, Some(2));

        let filter = FilterInfo {
            idx_num: info.idx_num,
            idx_str: info.idx_str.clone(),
            args: vec![SqlValue::Integer(2), SqlValue::Integer(3)],
            constraints: info.constraints.clone(),
        };
        let rows: Vec<RowIdRow> =
            table.query(filter).await.unwrap().map(|r| r.unwrap()).collect().await;
        assert_eq!(
            rows.iter().map(|(_, r)| r[1].clone()).collect::<Vec<_>>(),
            vec![SqlValue::Text("b".into()), SqlValue::Text("d".into())]
        );
        // Equal keys in rowid order.
        assert!(rows[0].0 < rows[1].0);
    }

    #[tokio::test]
    async fn savepoint_rollback_keeps_outer_changes() {
        let schema = TableSchema::new("main", "s")
            .column(ColumnSchema::new("v", "INT"))
            .primary_key([(0, false)]);
        let (_m, table) = connect(schema).await;

        table.begin().await.unwrap();
        insert(&table, ints(&[1])).await.unwrap();
        table.savepoint(1).await.unwrap();
        insert(&table, ints(&[2])).await.unwrap();
        table.rollback_to(1).await.unwrap();
        table.sync().await.unwrap();
        table.commit().await.unwrap();

        let rows = full_scan(&table).await;
        assert_eq!(rows.iter().map(|(_, r)| r.clone()).collect::<Vec<_>>(), vec![ints(&[1])]);
    }

    #[tokio::test]
    async fn savepoint_release_folds_into_parent() {
        let schema = TableSchema::new("main", "s2")
            .column(ColumnSchema::new("v", "INT"))
            .primary_key([(0, false)]);
        let (_m, table) = connect(schema).await;

        table.begin().await.unwrap();
        insert(&table, ints(&[1])).await.unwrap();
        table.savepoint(1).await.unwrap();
        insert(&table, ints(&[2])).await.unwrap();
        table.release(1).await.unwrap();
        table.commit().await.unwrap();

        let rows = full_scan(&table).await;
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn replace_policy_supersedes_conflicting_row() {
        let schema = TableSchema::new("main", "v")
            .column(ColumnSchema::new("k", "INT"))
            .column(ColumnSchema::new("val", "TEXT"))
            .index(
                IndexSpec::new(
                    "v_k",
                    [IndexColumn { column: 0, desc: false, collation: Collation::Binary }],
                )
                .unique(),
            );
        let (_m, table) = connect(schema).await;
        insert(&table, vec![SqlValue::Integer(1), SqlValue::Text("a".into())]).await.unwrap();
        table
            .update(UpdateArgs::insert(
                vec![SqlValue::Integer(1), SqlValue::Text("b".into())],
                ConflictPolicy::Replace,
            ))
            .await
            .unwrap();

        let rows = full_scan(&table).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1[1], SqlValue::Text("b".into()));
    }

    #[tokio::test]
    async fn ignore_policy_drops_the_row_silently() {
        let (_m, table) = connect(composite_pk_schema()).await;
        insert(&table, ints(&[1, 1])).await.unwrap();
        let outcome = table
            .update(UpdateArgs::insert(ints(&[1, 1]), ConflictPolicy::Ignore))
            .await
            .unwrap();
        assert_eq!(outcome, None);
        assert_eq!(full_scan(&table).await.len(), 1);
    }

    #[tokio::test]
    async fn rollback_restores_pre_transaction_state() {
        let (_m, table) = connect(composite_pk_schema()).await;
        insert(&table, ints(&[1, 1])).await.unwrap();
        table.sync().await.unwrap();
        table.commit().await.unwrap();

        table.begin().await.unwrap();
        insert(&table, ints(&[2, 2])).await.unwrap();
        table
            .update(UpdateArgs::update(1, ints(&[1, 9]), ConflictPolicy::Abort))
            .await
            .unwrap();
        table.rollback().await.unwrap();

        let rows = full_scan(&table).await;
        assert_eq!(rows.iter().map(|(_, r)| r.clone()).collect::<Vec<_>>(), vec![ints(&[1, 1])]);
    }

    #[tokio::test]
    async fn commit_is_atomic_across_connections() {
        let (module, writer) = connect(composite_pk_schema()).await;
        let reader = module
            .connect(ConnectArgs {
                schema: writer.schema(),
                create: false,
                options: BTreeMap::new(),
            })
            .await
            .unwrap();

        writer.begin().await.unwrap();
        insert(&writer, ints(&[1, 1])).await.unwrap();
        insert(&writer, ints(&[2, 2])).await.unwrap();
        // Uncommitted layers are invisible to the other connection.
        assert_eq!(full_scan(&reader).await.len(), 0);

        writer.sync().await.unwrap();
        writer.commit().await.unwrap();
        assert_eq!(full_scan(&reader).await.len(), 2);
    }

    #[tokio::test]
    async fn sync_holds_the_writer_lock() {
        let (module, one) = connect(composite_pk_schema()).await;
        let two = module
            .connect(ConnectArgs { schema: one.schema(), create: false, options: BTreeMap::new() })
            .await
            .unwrap();

        insert(&one, ints(&[1, 1])).await.unwrap();
        insert(&two, ints(&[2, 2])).await.unwrap();
        one.sync().await.unwrap();
        let err = two.sync().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);

        one.commit().await.unwrap();
        two.sync().await.unwrap();
        two.commit().await.unwrap();
        assert_eq!(full_scan(&one).await.len(), 2);
    }

    #[tokio::test]
    async fn check_constraints_gate_writes() {
        let schema = TableSchema::new("main", "c")
            .column(ColumnSchema::new("n", "INT"))
            .primary_key([(0, false)])
            .check("n_positive", Arc::new(|row: &Row| match &row[0] {
                SqlValue::Integer(n) => Some(*n > 0),
                SqlValue::Null => None,
                _ => Some(false),
            }));
        let (_m, table) = connect(schema).await;
        insert(&table, ints(&[5])).await.unwrap();
        let err = insert(&table, ints(&[-5])).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Constraint);
        assert!(err.message.contains("n_positive"));
    }

    #[tokio::test]
    async fn not_null_and_affinity_on_store() {
        let schema = TableSchema::new("main", "a")
            .column(ColumnSchema::new("id", "INT"))
            .column(ColumnSchema::new("label", "TEXT").not_null())
            .primary_key([(0, false)]);
        let (_m, table) = connect(schema).await;
        // Affinity turns the numeric label into text on store.
        insert(&table, vec![SqlValue::Text("7".into()), SqlValue::Integer(42)]).await.unwrap();
        let rows = full_scan(&table).await;
        assert_eq!(rows[0].1, vec![SqlValue::Integer(7), SqlValue::Text("42".into())]);

        let err = insert(&table, vec![SqlValue::Integer(8), SqlValue::Null]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Constraint);
    }

    #[tokio::test]
    async fn alter_schema_add_and_drop_column() {
        let schema = TableSchema::new("main", "alt")
            .column(ColumnSchema::new("id", "INT"))
            .primary_key([(0, false)]);
        let (_m, table) = connect(schema).await;
        insert(&table, ints(&[1])).await.unwrap();
        table.commit().await.unwrap();

        table
            .alter_schema(SchemaChange::AddColumn(
                ColumnSchema::new("extra", "TEXT").default_value(SqlValue::Text("x".into())),
            ))
            .await
            .unwrap();
        let rows = full_scan(&table).await;
        assert_eq!(rows[0].1, vec![SqlValue::Integer(1), SqlValue::Text("x".into())]);

        let err = table.alter_schema(SchemaChange::DropColumn("id".into())).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Constraint);
    }

    #[tokio::test]
    async fn create_index_backfills_and_enforces_uniqueness() {
        let schema = TableSchema::new("main", "ix")
            .column(ColumnSchema::new("id", "INT"))
            .column(ColumnSchema::new("tag", "TEXT"))
            .primary_key([(0, false)]);
        let (_m, table) = connect(schema).await;
        for (id, tag) in [(1, "x"), (2, "x"), (3, "y")] {
            insert(&table, vec![SqlValue::Integer(id), SqlValue::Text(tag.into())]).await.unwrap();
        }
        table.commit().await.unwrap();

        let err = table
            .create_index(
                IndexSpec::new(
                    "ix_tag",
                    [IndexColumn { column: 1, desc: false, collation: Collation::Binary }],
                )
                .unique(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Constraint);

        table
            .create_index(IndexSpec::new(
                "ix_tag",
                [IndexColumn { column: 1, desc: false, collation: Collation::Binary }],
            ))
            .await
            .unwrap();

        let mut info = IndexInfo::new(
            vec![ConstraintInfo { column: 1, op: ConstraintOp::Eq, usable: true }],
            vec![],
            u64::MAX,
        );
        table.best_index(&mut info);
        let filter = FilterInfo {
            idx_num: info.idx_num,
            idx_str: info.idx_str.clone(),
            args: vec![SqlValue::Text("x".into())],
            constraints: info.constraints.clone(),
        };
        let rows: Vec<RowIdRow> =
            table.query(filter).await.unwrap().map(|r| r.unwrap()).collect().await;
        assert_eq!(rows.len(), 2);

        table.drop_index("ix_tag").await.unwrap();
        let err = table.drop_index("ix_tag").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn nested_savepoints_roll_back_independently() {
        let schema = TableSchema::new("main", "nest")
            .column(ColumnSchema::new("v", "INT"))
            .primary_key([(0, false)]);
        let (_m, table) = connect(schema).await;

        table.begin().await.unwrap();
        insert(&table, ints(&[1])).await.unwrap();
        table.savepoint(1).await.unwrap();
        insert(&table, ints(&[2])).await.unwrap();
        table.savepoint(2).await.unwrap();
        insert(&table, ints(&[3])).await.unwrap();

        // Undo the inner scope only.
        table.rollback_to(2).await.unwrap();
        assert_eq!(full_scan(&table).await.len(), 2);

        // Undoing the outer scope removes its nested work too.
        insert(&table, ints(&[4])).await.unwrap();
        table.rollback_to(1).await.unwrap();
        assert_eq!(full_scan(&table).await.len(), 1);

        table.commit().await.unwrap();
        assert_eq!(full_scan(&table).await.len(), 1);
    }

    #[tokio::test]
    async fn delete_then_reinsert_survives_savepoint_release() {
        let (_m, table) = connect(composite_pk_schema()).await;
        let rowid = insert(&table, ints(&[1, 1])).await.unwrap().unwrap();
        table.commit().await.unwrap();

        table.begin().await.unwrap();
        table.savepoint(1).await.unwrap();
        table.update(UpdateArgs::delete(rowid)).await.unwrap();
        assert_eq!(full_scan(&table).await.len(), 0);
        table.savepoint(2).await.unwrap();
        insert(&table, ints(&[1, 1])).await.unwrap();
        table.release(2).await.unwrap();
        table.release(1).await.unwrap();
        table.commit().await.unwrap();

        let rows = full_scan(&table).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, ints(&[1, 1]));
    }

    #[tokio::test]
    async fn descending_index_serves_reverse_order() {
        let schema = TableSchema::new("main", "d")
            .column(ColumnSchema::new("x", "INT"))
            .index(IndexSpec::new(
                "d_x",
                [IndexColumn { column: 0, desc: true, collation: Collation::Binary }],
            ));
        let (_m, table) = connect(schema).await;
        for x in [1, 3, 2] {
            insert(&table, ints(&[x])).await.unwrap();
        }

        // ORDER BY x DESC matches the index order directly.
        let mut info = IndexInfo::new(vec![], vec![OrderByInfo { column: 0, desc: true }], u64::MAX);
        table.best_index(&mut info);
        assert!(info.order_by_consumed);
        let filter = FilterInfo {
            idx_num: info.idx_num,
            idx_str: info.idx_str.clone(),
            args: vec![],
            constraints: vec![],
        };
        let rows: Vec<RowIdRow> =
            table.query(filter).await.unwrap().map(|r| r.unwrap()).collect().await;
        assert_eq!(
            rows.iter().map(|(_, r)| r[0].clone()).collect::<Vec<_>>(),
            vec![SqlValue::Integer(3), SqlValue::Integer(2), SqlValue::Integer(1)]
        );
    }

    #[tokio::test]
    async fn ignored_update_leaves_the_row_alone() {
        let (_m, table) = connect(composite_pk_schema()).await;
        let first = insert(&table, ints(&[1, 1])).await.unwrap().unwrap();
        insert(&table, ints(&[2, 2])).await.unwrap();

        // Moving (1,1) onto (2,2) under Ignore is dropped silently.
        let outcome = table
            .update(UpdateArgs::update(first, ints(&[2, 2]), ConflictPolicy::Ignore))
            .await
            .unwrap();
        assert_eq!(outcome, None);
        let rows = full_scan(&table).await;
        assert_eq!(
            rows.iter().map(|(_, r)| r.clone()).collect::<Vec<_>>(),
            vec![ints(&[1, 1]), ints(&[2, 2])]
        );
    }

    #[tokio::test]
    async fn update_may_move_a_primary_key() {
        let (_m, table) = connect(composite_pk_schema()).await;
        let rowid = insert(&table, ints(&[5, 5])).await.unwrap().unwrap();
        insert(&table, ints(&[7, 7])).await.unwrap();
        table
            .update(UpdateArgs::update(rowid, ints(&[1, 1]), ConflictPolicy::Abort))
            .await
            .unwrap();
        let rows = full_scan(&table).await;
        assert_eq!(
            rows.iter().map(|(_, r)| r.clone()).collect::<Vec<_>>(),
            vec![ints(&[1, 1]), ints(&[7, 7])]
        );
    }
}
