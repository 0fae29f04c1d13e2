//! The builtin function set.
//!
//! Scalars follow SQLite's core library semantics (ASCII case mapping,
//! 1-based substr, NULL-transparent math). `strftime` supports exactly
//! the specifiers `%Y %m %d %H %M %S %j %w %s %f %e %%`; anything else
//! passes through verbatim.

use crate::func::{AggregateFn, FuncRegistry, ScalarFn};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::cmp::Ordering;
use std::sync::Arc;
use stratadb_value::{compare, CoercionKind, Collation, SqlValue};
use stratadb_vtab::{EngineError, Result};

pub fn install(reg: &mut FuncRegistry) {
    install_scalars(reg);
    install_aggregates(reg);
}

fn scalar(
    reg: &mut FuncRegistry,
    name: &str,
    arity: (usize, usize),
    arg_kinds: Vec<CoercionKind>,
    call: impl Fn(&[SqlValue]) -> Result<SqlValue> + Send + Sync + 'static,
) {
    reg.register_scalar(ScalarFn { name: name.into(), arity, arg_kinds, call: Arc::new(call) });
}

fn install_scalars(reg: &mut FuncRegistry) {
    scalar(reg, "abs", (1, 1), vec![CoercionKind::Any], |args| {
        Ok(match &args[0] {
            SqlValue::Null => SqlValue::Null,
            SqlValue::Integer(i) => match i.checked_abs() {
                Some(v) => SqlValue::Integer(v),
                None => SqlValue::Null,
            },
            SqlValue::Real(r) => SqlValue::Real(r.abs()),
            other => match other.as_real() {
                Some(r) => SqlValue::Real(r.abs()),
                None => SqlValue::Null,
            },
        })
    });

    scalar(reg, "length", (1, 1), vec![CoercionKind::Any], |args| {
        Ok(match &args[0] {
            SqlValue::Null => SqlValue::Null,
            SqlValue::Blob(b) => SqlValue::Integer(b.len() as i64),
            other => match other.as_text() {
                Some(s) => SqlValue::Integer(s.chars().count() as i64),
                None => SqlValue::Null,
            },
        })
    });

    scalar(reg, "lower", (1, 1), vec![CoercionKind::Any], |args| {
        Ok(match args[0].as_text() {
            Some(s) => SqlValue::Text(s.to_ascii_lowercase()),
            None => SqlValue::Null,
        })
    });

    scalar(reg, "upper", (1, 1), vec![CoercionKind::Any], |args| {
        Ok(match args[0].as_text() {
            Some(s) => SqlValue::Text(s.to_ascii_uppercase()),
            None => SqlValue::Null,
        })
    });

    scalar(reg, "substr", (2, 3), vec![CoercionKind::Any], |args| {
        let Some(s) = args[0].as_text() else { return Ok(SqlValue::Null) };
        let Some(start) = args[1].as_integer() else { return Ok(SqlValue::Null) };
        let len = match args.get(2) {
            Some(v) => match v.as_integer() {
                Some(n) => Some(n),
                None => return Ok(SqlValue::Null),
            },
            None => None,
        };
        let chars: Vec<char> = s.chars().collect();
        let n = chars.len() as i64;
        // 1-based; negative start counts back from the end.
        let begin = if start > 0 {
            start - 1
        } else if start < 0 {
            (n + start).max(0)
        } else {
            0
        };
        let count = len.unwrap_or(n).max(0);
        let begin = begin.clamp(0, n) as usize;
        let end = (begin + count as usize).min(chars.len());
        Ok(SqlValue::Text(chars[begin..end].iter().collect()))
    });

    scalar(reg, "trim", (1, 2), vec![CoercionKind::Any], |args| {
        let Some(s) = args[0].as_text() else { return Ok(SqlValue::Null) };
        let out = match args.get(1).and_then(|v| v.as_text()) {
            Some(set) => {
                let set: Vec<char> = set.chars().collect();
                s.trim_matches(|c| set.contains(&c)).to_owned()
            }
            None => s.trim().to_owned(),
        };
        Ok(SqlValue::Text(out))
    });

    scalar(reg, "round", (1, 2), vec![CoercionKind::Any], |args| {
        let Some(x) = args[0].as_real() else { return Ok(SqlValue::Null) };
        let digits = match args.get(1) {
            Some(v) => match v.as_integer() {
                Some(n) => n.clamp(0, 30),
                None => return Ok(SqlValue::Null),
            },
            None => 0,
        };
        let factor = 10f64.powi(digits as i32);
        Ok(SqlValue::Real((x * factor).round() / factor))
    });

    scalar(reg, "coalesce", (2, usize::MAX), vec![], |args| {
        Ok(args.iter().find(|v| !v.is_null()).cloned().unwrap_or(SqlValue::Null))
    });

    scalar(reg, "ifnull", (2, 2), vec![], |args| {
        Ok(if args[0].is_null() { args[1].clone() } else { args[0].clone() })
    });

    scalar(reg, "nullif", (2, 2), vec![], |args| {
        Ok(match compare(&args[0], &args[1], Collation::Binary) {
            Some(Ordering::Equal) => SqlValue::Null,
            _ => args[0].clone(),
        })
    });

    scalar(reg, "typeof", (1, 1), vec![], |args| {
        Ok(SqlValue::Text(args[0].type_name().to_owned()))
    });

    scalar(reg, "min", (2, usize::MAX), vec![], |args| Ok(pick_extreme(args, Ordering::Less)));
    scalar(reg, "max", (2, usize::MAX), vec![], |args| Ok(pick_extreme(args, Ordering::Greater)));

    scalar(reg, "replace", (3, 3), vec![CoercionKind::Any], |args| {
        let (Some(s), Some(from), Some(to)) =
            (args[0].as_text(), args[1].as_text(), args[2].as_text())
        else {
            return Ok(SqlValue::Null);
        };
        if from.is_empty() {
            return Ok(SqlValue::Text(s));
        }
        Ok(SqlValue::Text(s.replace(&from, &to)))
    });

    scalar(reg, "instr", (2, 2), vec![CoercionKind::Any], |args| {
        let (Some(haystack), Some(needle)) = (args[0].as_text(), args[1].as_text()) else {
            return Ok(SqlValue::Null);
        };
        // 1-based character position; 0 means not found.
        let pos = match haystack.find(&needle) {
            Some(byte_pos) => haystack[..byte_pos].chars().count() as i64 + 1,
            None => 0,
        };
        Ok(SqlValue::Integer(pos))
    });

    scalar(reg, "hex", (1, 1), vec![], |args| {
        Ok(match &args[0] {
            SqlValue::Null => SqlValue::Text(String::new()),
            SqlValue::Blob(b) => {
                SqlValue::Text(b.iter().map(|byte| format!("{byte:02X}")).collect())
            }
            other => match other.as_text() {
                Some(s) => SqlValue::Text(s.bytes().map(|byte| format!("{byte:02X}")).collect()),
                None => SqlValue::Null,
            },
        })
    });

    scalar(reg, "date", (1, 1), vec![CoercionKind::Text], |args| {
        let Some(t) = args[0].as_text() else { return Ok(SqlValue::Null) };
        Ok(match parse_time_value(&t) {
            Some(dt) => SqlValue::Text(format_time("%Y-%m-%d", &dt)),
            None => SqlValue::Null,
        })
    });

    scalar(reg, "time", (1, 1), vec![CoercionKind::Text], |args| {
        let Some(t) = args[0].as_text() else { return Ok(SqlValue::Null) };
        Ok(match parse_time_value(&t) {
            Some(dt) => SqlValue::Text(format_time("%H:%M:%S", &dt)),
            None => SqlValue::Null,
        })
    });

    scalar(reg, "strftime", (2, 2), vec![CoercionKind::Text, CoercionKind::Text], |args| {
        let (Some(fmt), Some(time)) = (args[0].as_text(), args[1].as_text()) else {
            return Ok(SqlValue::Null);
        };
        match parse_time_value(&time) {
            Some(dt) => Ok(SqlValue::Text(format_time(&fmt, &dt))),
            None => Ok(SqlValue::Null),
        }
    });
}

/// Scalar min/max: NULL if any operand is NULL.
fn pick_extreme(args: &[SqlValue], wanted: Ordering) -> SqlValue {
    let mut best: Option<&SqlValue> = None;
    for v in args {
        if v.is_null() {
            return SqlValue::Null;
        }
        best = match best {
            None => Some(v),
            Some(b) => match compare(v, b, Collation::Binary) {
                Some(ord) if ord == wanted => Some(v),
                _ => Some(b),
            },
        };
    }
    best.cloned().unwrap_or(SqlValue::Null)
}

/// Accepted time values: `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` and the
/// fractional-seconds variant.
fn parse_time_value(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt);
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// The supported specifier set, expanded by hand so coverage is exactly
/// what the documentation promises.
fn format_time(fmt: &str, dt: &NaiveDateTime) -> String {
    let mut out = String::with_capacity(fmt.len() + 8);
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", dt.year())),
            Some('m') => out.push_str(&format!("{:02}", dt.month())),
            Some('d') => out.push_str(&format!("{:02}", dt.day())),
            Some('H') => out.push_str(&format!("{:02}", dt.hour())),
            Some('M') => out.push_str(&format!("{:02}", dt.minute())),
            Some('S') => out.push_str(&format!("{:02}", dt.second())),
            Some('j') => out.push_str(&format!("{:03}", dt.ordinal())),
            Some('w') => out.push_str(&dt.weekday().num_days_from_sunday().to_string()),
            Some('s') => out.push_str(&dt.and_utc().timestamp().to_string()),
            Some('f') => out.push_str(&format!(
                "{:02}.{:03}",
                dt.second(),
                dt.and_utc().timestamp_subsec_millis()
            )),
            Some('e') => out.push_str(&format!("{:2}", dt.day())),
            Some('%') => out.push('%'),
            // Unknown specifiers pass through verbatim.
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn aggregate(
    reg: &mut FuncRegistry,
    name: &str,
    arity: (usize, usize),
    init: impl Fn() -> Vec<SqlValue> + Send + Sync + 'static,
    step: impl Fn(Vec<SqlValue>, &[SqlValue]) -> Result<Vec<SqlValue>> + Send + Sync + 'static,
    finalize: impl Fn(Vec<SqlValue>) -> Result<SqlValue> + Send + Sync + 'static,
) {
    reg.register_aggregate(AggregateFn {
        name: name.into(),
        arity,
        init: Arc::new(init),
        step: Arc::new(step),
        finalize: Arc::new(finalize),
    });
}

fn numeric_add(acc: &SqlValue, v: &SqlValue) -> SqlValue {
    match (acc, v) {
        (SqlValue::Integer(a), SqlValue::Integer(b)) => match a.checked_add(*b) {
            Some(s) => SqlValue::Integer(s),
            // Past i64, keep accumulating in floating point.
            None => SqlValue::Real(*a as f64 + *b as f64),
        },
        _ => {
            let a = acc.as_real().unwrap_or(0.0);
            let b = v.as_real().unwrap_or(0.0);
            SqlValue::Real(a + b)
        }
    }
}

fn install_aggregates(reg: &mut FuncRegistry) {
    // count(*) and count(x); the star form arrives with no arguments.
    aggregate(
        reg,
        "count",
        (0, 1),
        || vec![SqlValue::Integer(0)],
        |mut state, args| {
            let counted = match args.first() {
                None => true,
                Some(v) => !v.is_null(),
            };
            if counted {
                if let SqlValue::Integer(n) = &mut state[0] {
                    *n += 1;
                }
            }
            Ok(state)
        },
        |state| Ok(state[0].clone()),
    );

    aggregate(
        reg,
        "sum",
        (1, 1),
        || vec![SqlValue::Null],
        |mut state, args| {
            if !args[0].is_null() {
                state[0] = match &state[0] {
                    SqlValue::Null => match args[0].as_numeric() {
                        Some(_) => numeric_add(&SqlValue::Integer(0), &args[0]),
                        None => numeric_add(&SqlValue::Integer(0), &SqlValue::Integer(0)),
                    },
                    acc => numeric_add(acc, &args[0]),
                };
            }
            Ok(state)
        },
        |state| Ok(state[0].clone()),
    );

    aggregate(
        reg,
        "total",
        (1, 1),
        || vec![SqlValue::Real(0.0)],
        |mut state, args| {
            if !args[0].is_null() {
                let acc = state[0].as_real().unwrap_or(0.0);
                state[0] = SqlValue::Real(acc + args[0].as_real().unwrap_or(0.0));
            }
            Ok(state)
        },
        |state| Ok(state[0].clone()),
    );

    // avg returns a real even over all-integer input.
    aggregate(
        reg,
        "avg",
        (1, 1),
        || vec![SqlValue::Real(0.0), SqlValue::Integer(0)],
        |mut state, args| {
            if !args[0].is_null() {
                let sum = state[0].as_real().unwrap_or(0.0);
                state[0] = SqlValue::Real(sum + args[0].as_real().unwrap_or(0.0));
                if let SqlValue::Integer(n) = &mut state[1] {
                    *n += 1;
                }
            }
            Ok(state)
        },
        |state| {
            let n = state[1].as_integer().unwrap_or(0);
            if n == 0 {
                Ok(SqlValue::Null)
            } else {
                Ok(SqlValue::Real(state[0].as_real().unwrap_or(0.0) / n as f64))
            }
        },
    );

    aggregate(
        reg,
        "min",
        (1, 1),
        || vec![SqlValue::Null],
        |mut state, args| {
            if !args[0].is_null() {
                let replace = match compare(&args[0], &state[0], Collation::Binary) {
                    Some(Ordering::Less) => true,
                    None => true,
                    _ => false,
                };
                if replace {
                    state[0] = args[0].clone();
                }
            }
            Ok(state)
        },
        |state| Ok(state[0].clone()),
    );

    aggregate(
        reg,
        "max",
        (1, 1),
        || vec![SqlValue::Null],
        |mut state, args| {
            if !args[0].is_null() {
                let replace = match compare(&args[0], &state[0], Collation::Binary) {
                    Some(Ordering::Greater) => true,
                    None => true,
                    _ => false,
                };
                if replace {
                    state[0] = args[0].clone();
                }
            }
            Ok(state)
        },
        |state| Ok(state[0].clone()),
    );

    aggregate(
        reg,
        "group_concat",
        (1, 2),
        || vec![SqlValue::Null],
        |mut state, args| {
            if args[0].is_null() {
                return Ok(state);
            }
            let piece = args[0].as_text().ok_or_else(|| {
                EngineError::type_error("group_concat over a blob value")
            })?;
            let sep = match args.get(1) {
                Some(v) => v.as_text().unwrap_or_else(|| ",".to_owned()),
                None => ",".to_owned(),
            };
            state[0] = match &state[0] {
                SqlValue::Null => SqlValue::Text(piece),
                SqlValue::Text(acc) => SqlValue::Text(format!("{acc}{sep}{piece}")),
                other => other.clone(),
            };
            Ok(state)
        },
        |state| Ok(state[0].clone()),
    );
}
