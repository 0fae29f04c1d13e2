use crate::value::{parse_numeric_full, parse_numeric_prefix, Numeric, SqlValue};
use serde::{Deserialize, Serialize};

/// A column's type affinity. Selects a total coercion function applied on
/// store and compare; coercion never fails, it returns the input unchanged
/// when a conversion is not defined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Affinity {
    Integer,
    Real,
    Numeric,
    Text,
    Blob,
    #[default]
    None,
}

impl Affinity {
    /// Derive the affinity of a declared column type, per SQLite's rules:
    /// substring matching on the type name, in priority order.
    pub fn of_declared_type(decl: &str) -> Affinity {
        let d = decl.to_ascii_uppercase();
        if d.contains("INT") {
            Affinity::Integer
        } else if d.contains("CHAR") || d.contains("CLOB") || d.contains("TEXT") {
            Affinity::Text
        } else if d.contains("BLOB") || d.is_empty() {
            Affinity::Blob
        } else if d.contains("REAL") || d.contains("FLOA") || d.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }

    /// Apply this affinity to a value. Total: unconvertible inputs come
    /// back unchanged, except INTEGER affinity on a blob, which yields
    /// NULL.
    pub fn apply(&self, v: SqlValue) -> SqlValue {
        match self {
            Affinity::None | Affinity::Blob => v,
            Affinity::Text => match v.as_text() {
                Some(s) => SqlValue::Text(s),
                None => v,
            },
            Affinity::Integer => match v {
                SqlValue::Integer(_) => v,
                SqlValue::Boolean(b) => SqlValue::Integer(b as i64),
                SqlValue::Real(r) => SqlValue::Integer(r.trunc() as i64),
                SqlValue::Text(ref s) => match parse_numeric_prefix(s) {
                    Some(Numeric::Integer(i)) => SqlValue::Integer(i),
                    Some(Numeric::Real(r)) => SqlValue::Integer(r.trunc() as i64),
                    None => v,
                },
                SqlValue::Blob(_) => SqlValue::Null,
                SqlValue::Null => SqlValue::Null,
            },
            Affinity::Real => match v {
                SqlValue::Real(_) => v,
                SqlValue::Integer(i) => SqlValue::Real(i as f64),
                SqlValue::Boolean(b) => SqlValue::Real(b as i64 as f64),
                SqlValue::Text(ref s) => match parse_numeric_full(s) {
                    Some(Numeric::Integer(i)) => SqlValue::Real(i as f64),
                    Some(Numeric::Real(r)) => SqlValue::Real(r),
                    None => v,
                },
                SqlValue::Blob(_) | SqlValue::Null => v,
            },
            Affinity::Numeric => match v {
                SqlValue::Integer(_) => v,
                SqlValue::Boolean(b) => SqlValue::Integer(b as i64),
                // A real that is exactly integral and in range collapses
                // to an integer, per NUMERIC affinity.
                SqlValue::Real(r) => {
                    if r == r.trunc() && r >= i64::MIN as f64 && r < i64::MAX as f64 {
                        SqlValue::Integer(r as i64)
                    } else {
                        SqlValue::Real(r)
                    }
                }
                SqlValue::Text(ref s) => match parse_numeric_full(s) {
                    Some(Numeric::Integer(i)) => SqlValue::Integer(i),
                    Some(Numeric::Real(r)) => {
                        if r == r.trunc() && r >= i64::MIN as f64 && r < i64::MAX as f64 {
                            SqlValue::Integer(r as i64)
                        } else {
                            SqlValue::Real(r)
                        }
                    }
                    None => v,
                },
                SqlValue::Blob(_) | SqlValue::Null => v,
            },
        }
    }
}

/// The expected-argument kinds a function descriptor may declare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoercionKind {
    Text,
    Integer,
    Real,
    Numeric,
    Boolean,
    Blob,
    #[default]
    Any,
}

impl SqlValue {
    /// Convert `self` to the requested kind, when a conversion exists.
    /// NULL converts to NULL under every kind.
    pub fn coerce_to(&self, kind: CoercionKind) -> Option<SqlValue> {
        if self.is_null() {
            return Some(SqlValue::Null);
        }
        match kind {
            CoercionKind::Any => Some(self.clone()),
            CoercionKind::Text => self.as_text().map(SqlValue::Text),
            CoercionKind::Integer => self.as_integer().map(SqlValue::Integer),
            CoercionKind::Real => self.as_real().map(SqlValue::Real),
            CoercionKind::Numeric => self.as_numeric().map(|n| match n {
                Numeric::Integer(i) => SqlValue::Integer(i),
                Numeric::Real(r) => SqlValue::Real(r),
            }),
            CoercionKind::Boolean => crate::compare::is_truthy(self).map(SqlValue::Boolean),
            CoercionKind::Blob => match self {
                SqlValue::Blob(b) => Some(SqlValue::Blob(b.clone())),
                SqlValue::Text(s) => Some(SqlValue::Blob(s.clone().into_bytes())),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn declared_type_affinities() {
        assert_eq!(Affinity::of_declared_type("INTEGER"), Affinity::Integer);
        assert_eq!(Affinity::of_declared_type("TINYINT"), Affinity::Integer);
        assert_eq!(Affinity::of_declared_type("VARCHAR(30)"), Affinity::Text);
        assert_eq!(Affinity::of_declared_type("BLOB"), Affinity::Blob);
        assert_eq!(Affinity::of_declared_type(""), Affinity::Blob);
        assert_eq!(Affinity::of_declared_type("DOUBLE"), Affinity::Real);
        assert_eq!(Affinity::of_declared_type("DECIMAL(10,5)"), Affinity::Numeric);
    }

    #[test]
    fn text_affinity_renders_canonical_decimals() {
        assert_eq!(Affinity::Text.apply(SqlValue::Integer(42)), SqlValue::Text("42".into()));
        assert_eq!(Affinity::Text.apply(SqlValue::Real(3.0)), SqlValue::Text("3.0".into()));
        let blob = SqlValue::Blob(vec![1]);
        assert_eq!(Affinity::Text.apply(blob.clone()), blob);
    }

    #[test]
    fn integer_affinity_truncates_and_parses() {
        assert_eq!(Affinity::Integer.apply(SqlValue::Real(-2.9)), SqlValue::Integer(-2));
        assert_eq!(Affinity::Integer.apply(SqlValue::Text("17dogs".into())), SqlValue::Integer(17));
        assert_eq!(Affinity::Integer.apply(SqlValue::Blob(vec![1])), SqlValue::Null);
    }

    #[test]
    fn numeric_affinity_keeps_lossy_reals() {
        assert_eq!(Affinity::Numeric.apply(SqlValue::Real(3.0)), SqlValue::Integer(3));
        assert_eq!(Affinity::Numeric.apply(SqlValue::Real(3.5)), SqlValue::Real(3.5));
        assert_eq!(Affinity::Numeric.apply(SqlValue::Text("12".into())), SqlValue::Integer(12));
        let t = SqlValue::Text("12monkeys".into());
        assert_eq!(Affinity::Numeric.apply(t.clone()), t);
    }

    #[test]
    fn coercions_are_null_transparent() {
        assert_eq!(SqlValue::Null.coerce_to(CoercionKind::Integer), Some(SqlValue::Null));
        assert_eq!(SqlValue::Text("5".into()).coerce_to(CoercionKind::Integer), Some(SqlValue::Integer(5)));
        assert_eq!(SqlValue::Integer(1).coerce_to(CoercionKind::Blob), None);
    }
}
