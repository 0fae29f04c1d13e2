use std::fmt;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, EngineError>;

/// The closed, surface-stable set of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// API contract violation: step on a finalized statement, column read
    /// off EOF.
    Misuse,
    /// AST-level errors, passed through from the parser.
    Parse,
    /// PK / unique / check / not-null violation.
    Constraint,
    /// Failed hard conversion; most coercions are total so this is rare.
    Type,
    /// Out-of-bound column or parameter reference.
    Range,
    /// Missing table, index, function or module.
    NotFound,
    /// Write attempted against a read-only table.
    ReadOnly,
    /// Writer contention at commit time.
    Busy,
    /// Invariant violation. Always a bug, never a user error.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Misuse => "misuse",
            ErrorKind::Parse => "parse",
            ErrorKind::Constraint => "constraint",
            ErrorKind::Type => "type",
            ErrorKind::Range => "range",
            ErrorKind::NotFound => "not found",
            ErrorKind::ReadOnly => "read-only",
            ErrorKind::Busy => "busy",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// An engine error: a kind tag, a human-readable message, optionally an
/// inner cause. The engine never panics on user-triggered conditions;
/// `Internal` marks invariant breaks, which are bugs.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        EngineError { kind, message: message.into(), cause: None }
    }

    pub fn with_cause(
        kind: ErrorKind,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        EngineError { kind, message: message.into(), cause: Some(Arc::new(cause)) }
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Misuse, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Constraint, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn range(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Range, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn read_only(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReadOnly, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<stratadb_catalog::SchemaError> for EngineError {
    fn from(err: stratadb_catalog::SchemaError) -> Self {
        use stratadb_catalog::SchemaError::*;
        let kind = match &err {
            ColumnNotFound(_) | IndexNotFound(_) => ErrorKind::NotFound,
            ColumnOutOfRange { .. } => ErrorKind::Range,
            _ => ErrorKind::Constraint,
        };
        EngineError::with_cause(kind, err.to_string(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_carries_kind_and_message() {
        let err = EngineError::constraint("UNIQUE violated on t.a");
        assert_eq!(err.to_string(), "constraint error: UNIQUE violated on t.a");
        assert_eq!(err.kind, ErrorKind::Constraint);
    }

    #[test]
    fn schema_errors_map_to_kinds() {
        let err: EngineError = stratadb_catalog::SchemaError::ColumnNotFound("x".into()).into();
        assert_eq!(err.kind, ErrorKind::NotFound);
        let err: EngineError =
            stratadb_catalog::SchemaError::DropPrimaryKeyColumn("x".into()).into();
        assert_eq!(err.kind, ErrorKind::Constraint);
    }
}
