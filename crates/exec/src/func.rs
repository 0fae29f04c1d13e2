//! Scalar and aggregate function descriptors.
//!
//! The engine consumes descriptors; where they come from is the
//! registry's business. Invocation rules (C7): arguments are coerced to
//! the declared kinds before the call, the return value is normalized
//! back into the SQL value space, and anything the implementation raises
//! becomes an engine error bound to the calling expression.

use std::collections::HashMap;
use std::sync::Arc;
use stratadb_value::{CoercionKind, SqlValue};
use stratadb_vtab::{EngineError, Result};

pub type ScalarImpl = Arc<dyn Fn(&[SqlValue]) -> Result<SqlValue> + Send + Sync>;

/// Aggregate accumulators are small value tuples owned by the operator;
/// `step` is pure and returns the next accumulator.
pub type AggState = Vec<SqlValue>;
pub type AggInit = Arc<dyn Fn() -> AggState + Send + Sync>;
pub type AggStep = Arc<dyn Fn(AggState, &[SqlValue]) -> Result<AggState> + Send + Sync>;
pub type AggFinal = Arc<dyn Fn(AggState) -> Result<SqlValue> + Send + Sync>;

#[derive(Clone)]
pub struct ScalarFn {
    pub name: String,
    /// `(min, max)` argument counts; `max = usize::MAX` for variadic.
    pub arity: (usize, usize),
    /// Expected kind per argument; the last entry repeats for variadic
    /// tails. Empty means every argument passes through untouched.
    pub arg_kinds: Vec<CoercionKind>,
    pub call: ScalarImpl,
}

impl std::fmt::Debug for ScalarFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalarFn")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("arg_kinds", &self.arg_kinds)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct AggregateFn {
    pub name: String,
    pub arity: (usize, usize),
    pub init: AggInit,
    pub step: AggStep,
    pub finalize: AggFinal,
}

impl std::fmt::Debug for AggregateFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateFn")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

impl ScalarFn {
    /// Invoke with C7 coercion rules applied on the way in and out.
    pub fn invoke(&self, args: &[SqlValue]) -> Result<SqlValue> {
        self.check_arity(args.len())?;
        let coerced = self.coerce_args(args)?;
        let out = (self.call)(&coerced)
            .map_err(|e| EngineError::with_cause(e.kind, format!("in {}(): {}", self.name, e.message), e.clone()))?;
        Ok(normalize_return(out))
    }

    fn check_arity(&self, n: usize) -> Result<()> {
        let (min, max) = self.arity;
        if n < min || n > max {
            return Err(EngineError::misuse(format!(
                "wrong number of arguments to function {}()",
                self.name
            )));
        }
        Ok(())
    }

    fn coerce_args(&self, args: &[SqlValue]) -> Result<Vec<SqlValue>> {
        args.iter()
            .enumerate()
            .map(|(i, v)| {
                let kind = self
                    .arg_kinds
                    .get(i)
                    .or(self.arg_kinds.last())
                    .copied()
                    .unwrap_or(CoercionKind::Any);
                v.coerce_to(kind).ok_or_else(|| {
                    EngineError::type_error(format!(
                        "argument {} of {}(): cannot convert {} to {:?}",
                        i + 1,
                        self.name,
                        v.type_name(),
                        kind
                    ))
                })
            })
            .collect()
    }
}

impl AggregateFn {
    pub fn check_arity(&self, n: usize) -> Result<()> {
        let (min, max) = self.arity;
        if n < min || n > max {
            return Err(EngineError::misuse(format!(
                "wrong number of arguments to aggregate {}()",
                self.name
            )));
        }
        Ok(())
    }
}

/// Map an implementation's return value into the SQL value space:
/// non-finite reals collapse to NULL, everything else passes through.
fn normalize_return(v: SqlValue) -> SqlValue {
    match v {
        SqlValue::Real(r) if !r.is_finite() => SqlValue::Null,
        v => v,
    }
}

/// The function registry the engine consumes. Populated with the builtin
/// set by [`FuncRegistry::with_builtins`]; embedders may register more.
#[derive(Default)]
pub struct FuncRegistry {
    scalars: HashMap<String, Arc<ScalarFn>>,
    aggregates: HashMap<String, Arc<AggregateFn>>,
}

impl FuncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        crate::builtins::install(&mut reg);
        reg
    }

    pub fn register_scalar(&mut self, f: ScalarFn) {
        self.scalars.insert(f.name.to_ascii_lowercase(), Arc::new(f));
    }

    pub fn register_aggregate(&mut self, f: AggregateFn) {
        self.aggregates.insert(f.name.to_ascii_lowercase(), Arc::new(f));
    }

    pub fn scalar(&self, name: &str) -> Result<Arc<ScalarFn>> {
        self.scalars
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("no such function: {name}")))
    }

    pub fn aggregate(&self, name: &str) -> Result<Arc<AggregateFn>> {
        self.aggregates
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("no such aggregate: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn argument_coercion_applies_declared_kinds() {
        let f = ScalarFn {
            name: "plus1".into(),
            arity: (1, 1),
            arg_kinds: vec![CoercionKind::Integer],
            call: Arc::new(|args| match &args[0] {
                SqlValue::Integer(i) => Ok(SqlValue::Integer(i + 1)),
                SqlValue::Null => Ok(SqlValue::Null),
                other => Err(EngineError::type_error(format!("unexpected {}", other.type_name()))),
            }),
        };
        assert_eq!(f.invoke(&[SqlValue::Text("41".into())]).unwrap(), SqlValue::Integer(42));
        assert_eq!(f.invoke(&[SqlValue::Null]).unwrap(), SqlValue::Null);
        assert!(f.invoke(&[]).is_err());
    }

    #[test]
    fn non_finite_returns_become_null() {
        let f = ScalarFn {
            name: "inf".into(),
            arity: (0, 0),
            arg_kinds: vec![],
            call: Arc::new(|_| Ok(SqlValue::Real(f64::INFINITY))),
        };
        assert_eq!(f.invoke(&[]).unwrap(), SqlValue::Null);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let reg = FuncRegistry::with_builtins();
        assert!(reg.scalar("ABS").is_ok());
        assert!(reg.aggregate("Sum").is_ok());
        assert_eq!(reg.scalar("nope").unwrap_err().kind, stratadb_vtab::ErrorKind::NotFound);
    }
}
