//! Merged, ordered cursors over a layer stack.
//!
//! A cursor walks one index (primary or secondary) across every layer of
//! a snapshot at once, in key order, with top-of-stack precedence: the
//! topmost layer that mentions a rowid decides its fate (deleted rows are
//! suppressed, updated rows surface their new version, inserted rows
//! appear). Iteration is lazy; each step costs one bounded range probe
//! per layer.

use crate::key::{IndexKey, SecondaryEntry};
use crate::layers::{BaseVersion, RowVerdict, TxLayer};
use std::collections::Bound;
use std::sync::Arc;
use stratadb_value::RowIdRow;

/// One layer as seen by a read. Transaction layers are snapshotted by
/// clone at query time so a running scan is insulated from writes the
/// same statement performs.
#[derive(Debug, Clone)]
pub enum LayerRead {
    Base(Arc<BaseVersion>),
    Tx(Arc<TxLayer>),
}

/// An owned, immutable view of a table's whole layer stack,
/// bottom-first: `layers[0]` is the base.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub layers: Vec<LayerRead>,
}

impl Snapshot {
    /// The current visible version of `rowid`, resolved top-down.
    pub fn visible_row(&self, rowid: i64) -> Option<RowIdRow> {
        for layer in self.layers.iter().rev() {
            match layer {
                LayerRead::Tx(tx) => match tx.verdict(rowid) {
                    RowVerdict::Present(row) => return Some((rowid, row.clone())),
                    RowVerdict::Deleted => return None,
                    RowVerdict::Absent => continue,
                },
                LayerRead::Base(base) => return base.get_by_rowid(rowid).cloned(),
            }
        }
        None
    }

    /// Whether any layer strictly above `layer_idx` mentions `rowid`.
    fn shadowed_above(&self, layer_idx: usize, rowid: i64) -> bool {
        self.layers[layer_idx + 1..].iter().any(|layer| match layer {
            LayerRead::Tx(tx) => tx.mentions(rowid),
            LayerRead::Base(_) => false,
        })
    }

    /// Total number of visible rows is not tracked; this is the base
    /// row count used for cost estimation.
    pub fn approx_rows(&self) -> u64 {
        self.layers
            .iter()
            .map(|layer| match layer {
                LayerRead::Base(base) => base.row_count() as u64,
                LayerRead::Tx(tx) => tx.inserted.len() as u64,
            })
            .sum()
    }
}

/// The index a cursor walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorIndex<'a> {
    Primary,
    Secondary(&'a str),
}

/// A merged scan over `snapshot` for one index, within key-space bounds,
/// optionally reversed.
pub struct MergedCursor {
    snapshot: Snapshot,
    index: CursorIndexOwned,
    lower: Bound<IndexKey>,
    upper: Bound<IndexKey>,
    descending: bool,
    /// Last position handed out, exclusive for the next step.
    pos: Option<SecondaryEntry>,
    done: bool,
}

#[derive(Debug, Clone)]
enum CursorIndexOwned {
    Primary,
    Secondary(String),
}

impl MergedCursor {
    pub fn new(
        snapshot: Snapshot,
        index: CursorIndex<'_>,
        lower: Bound<IndexKey>,
        upper: Bound<IndexKey>,
        descending: bool,
    ) -> Self {
        MergedCursor {
            snapshot,
            index: match index {
                CursorIndex::Primary => CursorIndexOwned::Primary,
                CursorIndex::Secondary(name) => CursorIndexOwned::Secondary(name.to_owned()),
            },
            lower,
            upper,
            descending,
            pos: None,
            done: false,
        }
    }

    /// The next entry of `layer` past the cursor position, in scan
    /// direction, within bounds.
    fn probe(&self, layer: &LayerRead) -> Option<SecondaryEntry> {
        // Narrow the configured bounds by the current position.
        let (lo, hi): (Bound<&IndexKey>, Bound<&IndexKey>) = match (&self.pos, self.descending) {
            (None, _) => (as_ref_bound(&self.lower), as_ref_bound(&self.upper)),
            (Some(p), false) => (Bound::Included(&p.key), as_ref_bound(&self.upper)),
            (Some(p), true) => (as_ref_bound(&self.lower), Bound::Included(&p.key)),
        };
        // Contradictory constraints produce an inverted range; that is an
        // empty scan, not a panic inside `BTreeMap::range`.
        if bounds_empty(&lo, &hi) {
            return None;
        }
        match (&self.index, layer) {
            (CursorIndexOwned::Primary, LayerRead::Base(base)) => {
                let mut range = base.primary.range((lo, hi));
                let found = if self.descending { range.next_back() } else { range.next() };
                found
                    .map(|(key, (rowid, _))| SecondaryEntry { key: key.clone(), rowid: *rowid })
                    .filter(|e| self.past_pos(e))
                    .or_else(|| self.probe_next_key(layer))
            }
            (CursorIndexOwned::Primary, LayerRead::Tx(tx)) => {
                let mut range = tx.mirror.primary.range((lo, hi));
                let found = if self.descending { range.next_back() } else { range.next() };
                found
                    .map(|(key, rowid)| SecondaryEntry { key: key.clone(), rowid: *rowid })
                    .filter(|e| self.past_pos(e))
                    .or_else(|| self.probe_next_key(layer))
            }
            (CursorIndexOwned::Secondary(name), layer) => {
                let tree = match layer {
                    LayerRead::Base(base) => base.secondaries.get(name),
                    LayerRead::Tx(tx) => tx.mirror.secondaries.get(name),
                }?;
                let lo_e = entry_bound(lo, self.descending, /* low side */ true);
                let hi_e = entry_bound(hi, self.descending, false);
                // Position narrowing on the full (key, rowid) order.
                let (lo_e, hi_e) = match (&self.pos, self.descending) {
                    (None, _) => (lo_e, hi_e),
                    (Some(p), false) => (Bound::Excluded(p.clone()), hi_e),
                    (Some(p), true) => (lo_e, Bound::Excluded(p.clone())),
                };
                let mut range = tree.range((lo_e, hi_e));
                let found = if self.descending { range.next_back() } else { range.next() };
                found.cloned()
            }
        }
    }

    /// Primary trees are keyed by `IndexKey` alone, so after yielding an
    /// entry the next probe at `Included(pos.key)` may land on the same
    /// key. Step one key further.
    fn probe_next_key(&self, layer: &LayerRead) -> Option<SecondaryEntry> {
        let pos = self.pos.as_ref()?;
        let (lo, hi): (Bound<&IndexKey>, Bound<&IndexKey>) = if self.descending {
            (as_ref_bound(&self.lower), Bound::Excluded(&pos.key))
        } else {
            (Bound::Excluded(&pos.key), as_ref_bound(&self.upper))
        };
        if bounds_empty(&lo, &hi) {
            return None;
        }
        match (&self.index, layer) {
            (CursorIndexOwned::Primary, LayerRead::Base(base)) => {
                let mut range = base.primary.range((lo, hi));
                let found = if self.descending { range.next_back() } else { range.next() };
                found.map(|(key, (rowid, _))| SecondaryEntry { key: key.clone(), rowid: *rowid })
            }
            (CursorIndexOwned::Primary, LayerRead::Tx(tx)) => {
                let mut range = tx.mirror.primary.range((lo, hi));
                let found = if self.descending { range.next_back() } else { range.next() };
                found.map(|(key, rowid)| SecondaryEntry { key: key.clone(), rowid: *rowid })
            }
            (CursorIndexOwned::Secondary(_), _) => None,
        }
    }

    /// Whether `e` lies strictly past the current position in scan
    /// direction.
    fn past_pos(&self, e: &SecondaryEntry) -> bool {
        match &self.pos {
            None => true,
            Some(p) => {
                if self.descending {
                    e < p
                } else {
                    e > p
                }
            }
        }
    }

    /// Emit-or-skip rule for a candidate `(key, rowid)` found in
    /// `layer_idx`: the topmost layer mentioning the rowid wins, and the
    /// entry only surfaces if that winner is the candidate's own layer.
    fn resolve(&self, layer_idx: usize, entry: &SecondaryEntry) -> Option<RowIdRow> {
        if self.snapshot.shadowed_above(layer_idx, entry.rowid) {
            return None;
        }
        match &self.snapshot.layers[layer_idx] {
            LayerRead::Tx(tx) => match tx.verdict(entry.rowid) {
                RowVerdict::Present(row) => Some((entry.rowid, row.clone())),
                // A delete has no mirror entry; nothing to resolve here.
                RowVerdict::Deleted | RowVerdict::Absent => None,
            },
            LayerRead::Base(base) => base.get_by_rowid(entry.rowid).cloned(),
        }
    }
}

impl Iterator for MergedCursor {
    type Item = RowIdRow;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            // Find the frontier entry across all layers.
            let mut best: Option<(usize, SecondaryEntry)> = None;
            for (idx, layer) in self.snapshot.layers.iter().enumerate() {
                if let Some(e) = self.probe(layer) {
                    // Non-strict comparison: when two layers hold the
                    // identical entry (an update that kept its key), the
                    // topmost one must win so the pending version is the
                    // one resolved.
                    let better = match &best {
                        None => true,
                        Some((_, cur)) => {
                            if self.descending {
                                e >= *cur
                            } else {
                                e <= *cur
                            }
                        }
                    };
                    if better {
                        best = Some((idx, e));
                    }
                }
            }
            let Some((layer_idx, entry)) = best else {
                self.done = true;
                return None;
            };
            self.pos = Some(entry.clone());
            if let Some(row) = self.resolve(layer_idx, &entry) {
                return Some(row);
            }
        }
    }
}

fn as_ref_bound(b: &Bound<IndexKey>) -> Bound<&IndexKey> {
    match b {
        Bound::Included(k) => Bound::Included(k),
        Bound::Excluded(k) => Bound::Excluded(k),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn bounds_empty(lo: &Bound<&IndexKey>, hi: &Bound<&IndexKey>) -> bool {
    match (lo, hi) {
        (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b)) => a >= b,
        (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
        _ => false,
    }
}

/// Widen a key-space bound into entry space by attaching the rowid
/// extreme that keeps the bound's meaning.
fn entry_bound(b: Bound<&IndexKey>, _descending: bool, low_side: bool) -> Bound<SecondaryEntry> {
    match b {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(k) => Bound::Included(SecondaryEntry {
            key: k.clone(),
            rowid: if low_side { i64::MIN } else { i64::MAX },
        }),
        Bound::Excluded(k) => Bound::Excluded(SecondaryEntry {
            key: k.clone(),
            rowid: if low_side { i64::MAX } else { i64::MIN },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::IndexKey;
    use crate::layers::TxLayer;
    use pretty_assertions::assert_eq;
    use stratadb_catalog::{ColumnSchema, IndexColumn, IndexSpec, TableSchema};
    use stratadb_value::{Collation, Row, SqlValue};

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

    fn base_with(rows: &[(i64, i64, &str)]) -> Arc<BaseVersion> {
        let s = schema();
        let mut base = BaseVersion::with_indexes(&s.indexes);
        for &(rowid, a, b) in rows {
            let r = row(a, b);
            let pk = IndexKey::for_row(&s.primary_index(), &r);
            base.apply_insert(&s, pk, rowid, r);
        }
        Arc::new(base)
    }

    fn scan(snapshot: Snapshot, index: CursorIndex<'_>, descending: bool) -> Vec<RowIdRow> {
        MergedCursor::new(snapshot, index, Bound::Unbounded, Bound::Unbounded, descending).collect()
    }

    #[test]
    fn base_only_scan_in_key_order() {
        let base = base_with(&[(1, 3, "c"), (2, 1, "a"), (3, 2, "b")]);
        let rows = scan(Snapshot { layers: vec![LayerRead::Base(base)] }, CursorIndex::Primary, false);
        let keys: Vec<i64> = rows.iter().map(|(_, r)| match r[0] {
            SqlValue::Integer(i) => i,
            _ => unreachable!(),
        }).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn tx_inserts_merge_in_order() {
        let s = schema();
        let base = base_with(&[(1, 1, "a"), (2, 3, "c")]);
        let mut tx = TxLayer::default();
        tx.record_insert(&s, &s.primary_index(), 10, row(2, "b"));
        let snapshot = Snapshot { layers: vec![LayerRead::Base(base), LayerRead::Tx(Arc::new(tx))] };
        let rows = scan(snapshot, CursorIndex::Primary, false);
        assert_eq!(
            rows.iter().map(|(rid, _)| *rid).collect::<Vec<_>>(),
            vec![1, 10, 2]
        );
    }

    #[test]
    fn deletes_and_updates_shadow_the_base() {
        let s = schema();
        let base = base_with(&[(1, 1, "a"), (2, 2, "b"), (3, 3, "c")]);
        let mut tx = TxLayer::default();
        tx.record_delete(&s, &s.primary_index(), 2);
        tx.record_update(&s, &s.primary_index(), 3, row(3, "c"), row(3, "z"));
        let snapshot = Snapshot { layers: vec![LayerRead::Base(base), LayerRead::Tx(Arc::new(tx))] };
        let rows = scan(snapshot, CursorIndex::Primary, false);
        assert_eq!(rows, vec![(1, row(1, "a")), (3, row(3, "z"))]);
    }

    #[test]
    fn update_moving_a_key_appears_at_its_new_position_only() {
        let s = schema();
        let base = base_with(&[(1, 1, "a"), (2, 5, "e")]);
        let mut tx = TxLayer::default();
        // Move pk 5 to 0: must appear before pk 1 and not at its old slot.
        tx.record_update(&s, &s.primary_index(), 2, row(5, "e"), row(0, "e"));
        let snapshot = Snapshot { layers: vec![LayerRead::Base(base), LayerRead::Tx(Arc::new(tx))] };
        let rows = scan(snapshot, CursorIndex::Primary, false);
        assert_eq!(rows, vec![(2, row(0, "e")), (1, row(1, "a"))]);
    }

    #[test]
    fn secondary_scan_orders_equal_keys_by_rowid() {
        let base = base_with(&[(1, 1, "x"), (2, 2, "x"), (3, 3, "a")]);
        let rows = scan(
            Snapshot { layers: vec![LayerRead::Base(base)] },
            CursorIndex::Secondary("t_b"),
            false,
        );
        assert_eq!(rows.iter().map(|(rid, _)| *rid).collect::<Vec<_>>(), vec![3, 1, 2]);
    }

    #[test]
    fn descending_scan_reverses() {
        let base = base_with(&[(1, 1, "a"), (2, 2, "b"), (3, 3, "c")]);
        let rows = scan(Snapshot { layers: vec![LayerRead::Base(base)] }, CursorIndex::Primary, true);
        assert_eq!(rows.iter().map(|(rid, _)| *rid).collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn update_keeping_its_key_surfaces_the_new_version() {
        // Both layers hold the identical (key, rowid) entry; the pending
        // version must win and the row must not vanish.
        let s = schema();
        let base = base_with(&[(1, 1, "old")]);
        let mut tx = TxLayer::default();
        tx.record_update(&s, &s.primary_index(), 1, row(1, "old"), row(1, "new"));
        let snapshot = Snapshot { layers: vec![LayerRead::Base(base), LayerRead::Tx(Arc::new(tx))] };

        let rows = scan(snapshot.clone(), CursorIndex::Primary, false);
        assert_eq!(rows, vec![(1, row(1, "new"))]);
        // Same through the secondary index, where the key also did not
        // move.
        let s2 = schema();
        let base = base_with(&[(1, 1, "same")]);
        let mut tx = TxLayer::default();
        tx.record_update(&s2, &s2.primary_index(), 1, row(1, "same"), row(2, "same"));
        let snapshot = Snapshot { layers: vec![LayerRead::Base(base), LayerRead::Tx(Arc::new(tx))] };
        let rows = scan(snapshot, CursorIndex::Secondary("t_b"), false);
        assert_eq!(rows, vec![(1, row(2, "same"))]);
    }

    #[test]
    fn bounded_scans_respect_key_ranges() {
        let base = base_with(&[(1, 1, "a"), (2, 2, "b"), (3, 3, "c"), (4, 4, "d")]);
        let s = schema();
        let pk = s.primary_index();
        let lo = IndexKey::bound(&pk, &[SqlValue::Integer(2)], true);
        let hi = IndexKey::bound(&pk, &[SqlValue::Integer(3)], false);
        let rows: Vec<RowIdRow> = MergedCursor::new(
            Snapshot { layers: vec![LayerRead::Base(base)] },
            CursorIndex::Primary,
            Bound::Included(lo),
            Bound::Included(hi),
            false,
        )
        .collect();
        assert_eq!(rows.iter().map(|(rid, _)| *rid).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn inverted_bounds_scan_nothing() {
        let base = base_with(&[(1, 1, "a")]);
        let s = schema();
        let pk = s.primary_index();
        let lo = IndexKey::bound(&pk, &[SqlValue::Integer(5)], true);
        let hi = IndexKey::bound(&pk, &[SqlValue::Integer(3)], false);
        let rows: Vec<RowIdRow> = MergedCursor::new(
            Snapshot { layers: vec![LayerRead::Base(base)] },
            CursorIndex::Primary,
            Bound::Included(lo),
            Bound::Included(hi),
            false,
        )
        .collect();
        assert!(rows.is_empty());
    }

    #[test]
    fn nested_layers_respect_precedence() {
        let s = schema();
        let base = base_with(&[(1, 1, "a")]);
        let mut lower = TxLayer::default();
        lower.record_insert(&s, &s.primary_index(), 10, row(2, "b"));
        let mut upper = TxLayer::default();
        upper.record_delete(&s, &s.primary_index(), 10);
        upper.record_update(&s, &s.primary_index(), 1, row(1, "a"), row(1, "A"));
        let snapshot = Snapshot {
            layers: vec![
                LayerRead::Base(base),
                LayerRead::Tx(Arc::new(lower)),
                LayerRead::Tx(Arc::new(upper)),
            ],
        };
        let rows = scan(snapshot, CursorIndex::Primary, false);
        assert_eq!(rows, vec![(1, row(1, "A"))]);
    }
}
