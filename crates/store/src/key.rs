//! Ordered key tuples for the primary and secondary B-trees.
//!
//! A key carries its own comparison recipe: each part remembers the
//! direction and collation declared for its index column, so plain
//! `BTreeMap`/`BTreeSet` ordering reproduces the index order. `Min`/`Max`
//! sentinels stand in for unconstrained columns when range bounds are
//! built from a key prefix.

use smallvec::SmallVec;
use std::cmp::Ordering;
use stratadb_catalog::IndexSpec;
use stratadb_value::{storage_cmp, Collation, Row, SqlValue};

/// One column's slot in a key: a stored value, or a sentinel that sorts
/// below/above every stored value regardless of direction.
#[derive(Debug, Clone)]
pub enum KeySlot {
    Min,
    Val(SqlValue),
    Max,
}

#[derive(Debug, Clone)]
pub struct KeyPart {
    pub slot: KeySlot,
    pub desc: bool,
    pub collation: Collation,
}

impl KeyPart {
    fn cmp_part(&self, other: &KeyPart) -> Ordering {
        use KeySlot::*;
        match (&self.slot, &other.slot) {
            (Min, Min) | (Max, Max) => Ordering::Equal,
            (Min, _) => Ordering::Less,
            (_, Min) => Ordering::Greater,
            (Max, _) => Ordering::Greater,
            (_, Max) => Ordering::Less,
            (Val(a), Val(b)) => {
                let ord = storage_cmp(a, b, self.collation);
                if self.desc {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }
}

/// A full-width key tuple for one index. All keys stored in a given
/// B-tree have the same width and per-part recipes, so `Ord` is total and
/// consistent.
#[derive(Debug, Clone)]
pub struct IndexKey {
    parts: SmallVec<[KeyPart; 4]>,
}

impl IndexKey {
    /// Build the key a row produces for `spec`. Values are taken as
    /// stored (booleans already collapsed by the column affinity pass).
    pub fn for_row(spec: &IndexSpec, row: &Row) -> IndexKey {
        let parts = spec
            .columns
            .iter()
            .map(|ic| KeyPart {
                slot: KeySlot::Val(row.get(ic.column).cloned().unwrap_or(SqlValue::Null)),
                desc: ic.desc,
                collation: ic.collation,
            })
            .collect();
        IndexKey { parts }
    }

    /// The single-part key of a rowid-keyed table.
    pub fn for_rowid(rowid: i64) -> IndexKey {
        IndexKey {
            parts: [KeyPart {
                slot: KeySlot::Val(SqlValue::Integer(rowid)),
                desc: false,
                collation: Collation::Binary,
            }]
            .into_iter()
            .collect(),
        }
    }

    /// A bound key: `prefix` values for the leading columns, then a
    /// sentinel filling every remaining slot. `low` picks `Min`
    /// sentinels, otherwise `Max`.
    pub fn bound(spec: &IndexSpec, prefix: &[SqlValue], low: bool) -> IndexKey {
        let parts = spec
            .columns
            .iter()
            .enumerate()
            .map(|(i, ic)| KeyPart {
                slot: match prefix.get(i) {
                    Some(v) => KeySlot::Val(v.clone()),
                    None if low => KeySlot::Min,
                    None => KeySlot::Max,
                },
                desc: ic.desc,
                collation: ic.collation,
            })
            .collect();
        IndexKey { parts }
    }

    /// The bound key for a rowid-keyed table's primary tree.
    pub fn rowid_bound(prefix: Option<i64>, low: bool) -> IndexKey {
        IndexKey {
            parts: [KeyPart {
                slot: match prefix {
                    Some(v) => KeySlot::Val(SqlValue::Integer(v)),
                    None if low => KeySlot::Min,
                    None => KeySlot::Max,
                },
                desc: false,
                collation: Collation::Binary,
            }]
            .into_iter()
            .collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.parts.len()
    }

    /// The stored values of this key, in index-column order. Sentinels
    /// yield NULL; callers only use this on keys built from rows.
    pub fn values(&self) -> impl Iterator<Item = &SqlValue> {
        const NULL: SqlValue = SqlValue::Null;
        self.parts.iter().map(|p| match &p.slot {
            KeySlot::Val(v) => v,
            KeySlot::Min | KeySlot::Max => &NULL,
        })
    }

    /// Whether any part of the key is NULL. NULL key parts exempt a
    /// unique index from conflict detection, as in SQL.
    pub fn has_null(&self) -> bool {
        self.parts.iter().any(|p| matches!(&p.slot, KeySlot::Val(SqlValue::Null)))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        debug_assert_eq!(self.parts.len(), other.parts.len(), "keys of one tree share a width");
        for (a, b) in self.parts.iter().zip(&other.parts) {
            match a.cmp_part(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

/// A secondary-index entry: the key tuple plus the rowid suffix that
/// makes non-unique keys totally ordered and range scans stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryEntry {
    pub key: IndexKey,
    pub rowid: i64,
}

impl PartialOrd for SecondaryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SecondaryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then_with(|| self.rowid.cmp(&other.rowid))
    }
}
