use serde::{Deserialize, Serialize};
use std::fmt;

/// An ordered sequence of values; its length equals the producing
/// relation's column count.
pub type Row = Vec<SqlValue>;

/// A row paired with its rowid. The rowid is unique within a table at any
/// instant.
pub type RowIdRow = (i64, Row);

/// A single SQL value.
///
/// Booleans are first-class on the wire but map to integers on storage;
/// [`SqlValue::type_class`] reflects that by classing them as numeric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

/// SQLite's cross-type ordering classes: NULL < numeric < text < blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeClass {
    Null,
    Numeric,
    Text,
    Blob,
}

impl SqlValue {
    pub fn type_class(&self) -> TypeClass {
        match self {
            SqlValue::Null => TypeClass::Null,
            SqlValue::Integer(_) | SqlValue::Real(_) | SqlValue::Boolean(_) => TypeClass::Numeric,
            SqlValue::Text(_) => TypeClass::Text,
            SqlValue::Blob(_) => TypeClass::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// The `typeof()` name for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Integer(_) | SqlValue::Boolean(_) => "integer",
            SqlValue::Real(_) => "real",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
        }
    }

    /// The value as stored: booleans collapse to integers, everything else
    /// is unchanged. Applied by the storage layer before keys are built.
    pub fn into_stored(self) -> SqlValue {
        match self {
            SqlValue::Boolean(b) => SqlValue::Integer(b as i64),
            v => v,
        }
    }

    /// Numeric view of the value, if it has one after SQLite's numeric
    /// conversion. Text converts via its numeric prefix; blobs do not
    /// convert.
    pub fn as_numeric(&self) -> Option<Numeric> {
        match self {
            SqlValue::Integer(i) => Some(Numeric::Integer(*i)),
            SqlValue::Boolean(b) => Some(Numeric::Integer(*b as i64)),
            SqlValue::Real(r) => Some(Numeric::Real(*r)),
            SqlValue::Text(s) => parse_numeric_prefix(s),
            SqlValue::Null | SqlValue::Blob(_) => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.as_numeric()? {
            Numeric::Integer(i) => Some(i),
            Numeric::Real(r) => Some(r as i64),
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self.as_numeric()? {
            Numeric::Integer(i) => Some(i as f64),
            Numeric::Real(r) => Some(r),
        }
    }

    /// Text rendering used by TEXT affinity and string concatenation.
    /// Integers and reals render as canonical decimal strings.
    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Integer(i) => Some(i.to_string()),
            SqlValue::Boolean(b) => Some((*b as i64).to_string()),
            SqlValue::Real(r) => Some(render_real(*r)),
            SqlValue::Null | SqlValue::Blob(_) => None,
        }
    }
}

/// A numeric value: either exact or floating.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Integer(i64),
    Real(f64),
}

/// Parse the longest numeric prefix of `s`, SQLite-style: leading
/// whitespace is skipped, then an optional sign, digits, fraction and
/// exponent. An empty prefix parses as integer zero.
pub(crate) fn parse_numeric_prefix(s: &str) -> Option<Numeric> {
    let t = s.trim_start();
    let bytes = t.as_bytes();
    let mut i = 0;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    let int_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut is_real = false;
    if i < bytes.len() && bytes[i] == b'.' {
        is_real = true;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i > int_start && i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            is_real = true;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    let prefix = &t[..i];
    if prefix.is_empty() || prefix == "+" || prefix == "-" || prefix == "." {
        return Some(Numeric::Integer(0));
    }
    if is_real {
        prefix.parse::<f64>().ok().map(Numeric::Real)
    } else {
        match prefix.parse::<i64>() {
            Ok(v) => Some(Numeric::Integer(v)),
            // Out of i64 range, fall back to floating.
            Err(_) => prefix.parse::<f64>().ok().map(Numeric::Real),
        }
    }
}

/// Whether the whole of `s` is a well-formed numeric literal, as opposed to
/// merely having a numeric prefix.
pub(crate) fn parse_numeric_full(s: &str) -> Option<Numeric> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(v) = t.parse::<i64>() {
        return Some(Numeric::Integer(v));
    }
    let r = t.parse::<f64>().ok()?;
    if r.is_finite() {
        Some(Numeric::Real(r))
    } else {
        None
    }
}

/// Canonical decimal rendering for reals: always carries a decimal point
/// or exponent so the text round-trips as a real.
pub(crate) fn render_real(r: f64) -> String {
    if r == r.trunc() && r.abs() < 1e15 {
        format!("{r:.1}")
    } else {
        format!("{r}")
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{}", render_real(*r)),
            SqlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            SqlValue::Blob(b) => {
                write!(f, "x'")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "'")
            }
            SqlValue::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.into())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Boolean(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}
