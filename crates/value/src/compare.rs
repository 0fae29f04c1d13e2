use crate::value::{Numeric, SqlValue, TypeClass};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A text collating sequence. The closed builtin set; `BINARY` is the
/// default everywhere a collation is not declared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Collation {
    #[default]
    Binary,
    NoCase,
    RTrim,
}

impl Collation {
    /// Resolve a collation by its SQL name, case-insensitively.
    pub fn by_name(name: &str) -> Option<Collation> {
        if name.eq_ignore_ascii_case("binary") {
            Some(Collation::Binary)
        } else if name.eq_ignore_ascii_case("nocase") {
            Some(Collation::NoCase)
        } else if name.eq_ignore_ascii_case("rtrim") {
            Some(Collation::RTrim)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Collation::Binary => "BINARY",
            Collation::NoCase => "NOCASE",
            Collation::RTrim => "RTRIM",
        }
    }

    pub fn cmp_text(&self, a: &str, b: &str) -> Ordering {
        match self {
            Collation::Binary => a.as_bytes().cmp(b.as_bytes()),
            Collation::NoCase => {
                let la = a.bytes().map(|c| c.to_ascii_lowercase());
                let lb = b.bytes().map(|c| c.to_ascii_lowercase());
                la.cmp(lb)
            }
            Collation::RTrim => {
                let ta = a.trim_end_matches(' ');
                let tb = b.trim_end_matches(' ');
                ta.as_bytes().cmp(tb.as_bytes())
            }
        }
    }
}

fn cmp_numeric(a: Numeric, b: Numeric) -> Ordering {
    match (a, b) {
        (Numeric::Integer(x), Numeric::Integer(y)) => x.cmp(&y),
        (Numeric::Real(x), Numeric::Real(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Numeric::Integer(x), Numeric::Real(y)) => {
            (x as f64).partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Numeric::Real(x), Numeric::Integer(y)) => {
            x.partial_cmp(&(y as f64)).unwrap_or(Ordering::Equal)
        }
    }
}

fn numeric_of(v: &SqlValue) -> Numeric {
    match v {
        SqlValue::Integer(i) => Numeric::Integer(*i),
        SqlValue::Boolean(b) => Numeric::Integer(*b as i64),
        SqlValue::Real(r) => Numeric::Real(*r),
        _ => Numeric::Integer(0),
    }
}

/// SQL comparison: `None` when either side is NULL (unknown in
/// three-valued logic). Text is compared under `collation`; cross-type
/// ordering follows the type-class order numeric < text < blob.
pub fn compare(a: &SqlValue, b: &SqlValue, collation: Collation) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    Some(cmp_non_null(a, b, collation))
}

/// Total comparison used for index keys and sorting, where NULL needs a
/// definite position: NULL sorts before every other value, then the type
/// classes in SQLite order.
pub fn storage_cmp(a: &SqlValue, b: &SqlValue, collation: Collation) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => cmp_non_null(a, b, collation),
    }
}

fn cmp_non_null(a: &SqlValue, b: &SqlValue, collation: Collation) -> Ordering {
    let (ca, cb) = (a.type_class(), b.type_class());
    if ca != cb {
        return ca.cmp(&cb);
    }
    match ca {
        TypeClass::Numeric => cmp_numeric(numeric_of(a), numeric_of(b)),
        TypeClass::Text => {
            let (SqlValue::Text(x), SqlValue::Text(y)) = (a, b) else {
                unreachable!("text class implies text values");
            };
            collation.cmp_text(x, y)
        }
        TypeClass::Blob => {
            let (SqlValue::Blob(x), SqlValue::Blob(y)) = (a, b) else {
                unreachable!("blob class implies blob values");
            };
            x.cmp(y)
        }
        TypeClass::Null => Ordering::Equal,
    }
}

/// Truth value of `v` in a boolean context: `None` for NULL, otherwise the
/// numeric conversion compared against zero.
pub fn is_truthy(v: &SqlValue) -> Option<bool> {
    match v {
        SqlValue::Null => None,
        SqlValue::Boolean(b) => Some(*b),
        SqlValue::Integer(i) => Some(*i != 0),
        SqlValue::Real(r) => Some(*r != 0.0),
        SqlValue::Text(_) | SqlValue::Blob(_) => {
            let n = v.as_real().unwrap_or(0.0);
            Some(n != 0.0)
        }
    }
}

/// Three-valued AND.
pub fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

/// Three-valued OR.
pub fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

/// Three-valued NOT.
pub fn not3(a: Option<bool>) -> Option<bool> {
    a.map(|b| !b)
}
