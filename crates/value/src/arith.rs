//! SQL arithmetic and string operators.
//!
//! All of these are NULL-propagating: a NULL operand, or an operand that
//! fails numeric conversion, yields NULL. Integer overflow yields NULL
//! rather than wrapping or panicking.

use crate::value::{Numeric, SqlValue};

fn numeric_operand(v: &SqlValue) -> Option<Numeric> {
    v.as_numeric()
}

fn binary_numeric(
    a: &SqlValue,
    b: &SqlValue,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    real_op: impl Fn(f64, f64) -> Option<f64>,
) -> SqlValue {
    let (Some(x), Some(y)) = (numeric_operand(a), numeric_operand(b)) else {
        return SqlValue::Null;
    };
    match (x, y) {
        (Numeric::Integer(x), Numeric::Integer(y)) => match int_op(x, y) {
            Some(r) => SqlValue::Integer(r),
            None => SqlValue::Null,
        },
        _ => {
            let x = match x {
                Numeric::Integer(i) => i as f64,
                Numeric::Real(r) => r,
            };
            let y = match y {
                Numeric::Integer(i) => i as f64,
                Numeric::Real(r) => r,
            };
            match real_op(x, y) {
                Some(r) if r.is_finite() => SqlValue::Real(r),
                _ => SqlValue::Null,
            }
        }
    }
}

pub fn add(a: &SqlValue, b: &SqlValue) -> SqlValue {
    binary_numeric(a, b, |x, y| x.checked_add(y), |x, y| Some(x + y))
}

pub fn sub(a: &SqlValue, b: &SqlValue) -> SqlValue {
    binary_numeric(a, b, |x, y| x.checked_sub(y), |x, y| Some(x - y))
}

pub fn mul(a: &SqlValue, b: &SqlValue) -> SqlValue {
    binary_numeric(a, b, |x, y| x.checked_mul(y), |x, y| Some(x * y))
}

/// Division. Integer operands use integer division; division by zero is
/// NULL in either domain.
pub fn div(a: &SqlValue, b: &SqlValue) -> SqlValue {
    binary_numeric(
        a,
        b,
        |x, y| if y == 0 { None } else { x.checked_div(y) },
        |x, y| if y == 0.0 { None } else { Some(x / y) },
    )
}

/// Remainder. Real operands follow fmod; a zero divisor is NULL.
pub fn rem(a: &SqlValue, b: &SqlValue) -> SqlValue {
    binary_numeric(
        a,
        b,
        |x, y| if y == 0 { None } else { x.checked_rem(y) },
        |x, y| if y == 0.0 { None } else { Some(x % y) },
    )
}

/// Unary minus.
pub fn neg(a: &SqlValue) -> SqlValue {
    match numeric_operand(a) {
        Some(Numeric::Integer(i)) => match i.checked_neg() {
            Some(r) => SqlValue::Integer(r),
            None => SqlValue::Null,
        },
        Some(Numeric::Real(r)) => SqlValue::Real(-r),
        None => SqlValue::Null,
    }
}

/// String concatenation (`||`). NULL if any operand is NULL or a blob.
pub fn concat(a: &SqlValue, b: &SqlValue) -> SqlValue {
    match (a.as_text(), b.as_text()) {
        (Some(x), Some(y)) => SqlValue::Text(x + &y),
        _ => SqlValue::Null,
    }
}

/// SQL `LIKE` with `%`/`_` wildcards and an optional escape character.
/// ASCII case-insensitive, as the default LIKE is.
pub fn like_match(pattern: &str, text: &str, escape: Option<char>) -> bool {
    fn inner(p: &[char], t: &[char], escape: Option<char>) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(&c) if Some(c) == escape => match p.get(1) {
                Some(&lit) => {
                    !t.is_empty()
                        && t[0].eq_ignore_ascii_case(&lit)
                        && inner(&p[2..], &t[1..], escape)
                }
                None => false,
            },
            Some('%') => {
                // Fold consecutive wildcards, then try every split point.
                let rest = &p[1..];
                if rest.is_empty() {
                    return true;
                }
                (0..=t.len()).any(|i| inner(rest, &t[i..], escape))
            }
            Some('_') => !t.is_empty() && inner(&p[1..], &t[1..], escape),
            Some(&c) => {
                !t.is_empty() && t[0].eq_ignore_ascii_case(&c) && inner(&p[1..], &t[1..], escape)
            }
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t, escape)
}

/// SQL `GLOB`: `*`, `?` and `[...]` character classes, case-sensitive.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn class_match(p: &[char], c: char) -> Option<(bool, usize)> {
        // `p` starts after '['. Returns (matched, chars consumed incl ']').
        let mut i = 0;
        let negated = matches!(p.first(), Some('^'));
        if negated {
            i += 1;
        }
        let mut matched = false;
        let mut first = true;
        while i < p.len() {
            match p[i] {
                ']' if !first => return Some((matched != negated, i + 1)),
                lo => {
                    if p.get(i + 1) == Some(&'-') && p.get(i + 2).map_or(false, |&hi| hi != ']') {
                        let hi = p[i + 2];
                        if lo <= c && c <= hi {
                            matched = true;
                        }
                        i += 3;
                    } else {
                        if lo == c {
                            matched = true;
                        }
                        i += 1;
                    }
                }
            }
            first = false;
        }
        None
    }
    fn inner(p: &[char], t: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some('*') => {
                let rest = &p[1..];
                if rest.is_empty() {
                    return true;
                }
                (0..=t.len()).any(|i| inner(rest, &t[i..]))
            }
            Some('?') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some('[') => match t.first() {
                None => false,
                Some(&c) => match class_match(&p[1..], c) {
                    Some((true, used)) => inner(&p[1 + used..], &t[1..]),
                    _ => false,
                },
            },
            Some(&c) => !t.is_empty() && t[0] == c && inner(&p[1..], &t[1..]),
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}
