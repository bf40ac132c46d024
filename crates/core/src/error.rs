//! Unified error model
//!
//! Every failure in the engine is an [`Error`]: a class (which layer and
//! what recovery is possible), a code (the specific condition), a human
//! message, and — for parse, compile, and runtime errors — the source
//! location that produced it.
//!
//! Classes map to handling policy:
//! - `Parse` / `Compile` / `Schema`: client errors, reported up-front
//!   with a source excerpt and caret, never reach a partition
//! - `Runtime`: aborts the current query on the current partition
//! - `Resource`: transient, retried by the caller
//! - `Internal`: fatal; the worker logs and panics, the supervisor
//!   restarts it

use serde::Serialize;
use std::fmt;
use thiserror::Error as ThisError;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Which layer produced the error and how it should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    /// Tokenizer / block extraction / statement parse failure
    Parse,
    /// Post-parse compilation failure (lowering, filters, index extraction)
    Compile,
    /// Column catalog violation
    Schema,
    /// Per-entity evaluation failure; query-fatal on that partition
    Runtime,
    /// Transient condition; caller retries with an idempotent request id
    Resource,
    /// Invariant violation; fatal
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Parse => "parse",
            ErrorClass::Compile => "compile",
            ErrorClass::Schema => "schema",
            ErrorClass::Runtime => "runtime",
            ErrorClass::Resource => "resource",
            ErrorClass::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// The specific failure condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    // parse / compile
    /// General syntax error
    SyntaxError,
    /// Bracket or brace with no match
    UnmatchedBracket,
    /// Variable read before any assignment
    UndefinedVariable,
    /// Column not present in the table schema
    UnknownColumn,
    /// Mutually exclusive filters combined (e.g. `.forward` + `.reverse`)
    BadFilterCombination,
    /// Malformed `_seconds` / `_days` style literal
    InvalidTimeShorthand,
    /// Reserved query-language keyword used as an identifier
    ReservedWord,
    // schema
    /// Column name already present
    DuplicateName,
    /// Column name fails validation
    InvalidName,
    // runtime
    /// Division by zero
    DivideByZero,
    /// Subscript on a non-collection or out of range
    BadSubscript,
    /// Wrong number of arguments to a built-in function
    BadArity,
    /// `break n` exceeding the iteration nesting depth
    TooDeepBreak,
    /// Explicit cursor move past the end of the grid
    IterationPastEnd,
    /// Operation applied to incompatible value tags
    TypeMismatch,
    // resource
    /// Partition moved to another worker mid-query
    PartitionMigrated,
    /// Query deadline passed at a slice checkpoint
    DeadlineExceeded,
    /// Query cancelled at a slice checkpoint
    Cancelled,
    /// Collaborator router reports the node gone
    NodeUnavailable,
    // internal
    /// Engine invariant violated (a bug, not a data problem)
    Internal,
    /// Entity blob failed to decode
    CorruptBlob,
    /// Blob references a live column id missing from the schema
    SchemaMismatch,
    /// Two distinct strings share a 64-bit hash at merge time
    HashCollision,
}

/// Source location attached to parse, compile, and runtime errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceLoc {
    /// The offending source line, verbatim
    pub excerpt: String,
    /// Column of the caret within the excerpt
    pub caret: usize,
}

impl SourceLoc {
    /// Build a location from a line and caret column.
    pub fn new(excerpt: impl Into<String>, caret: usize) -> Self {
        SourceLoc {
            excerpt: excerpt.into(),
            caret,
        }
    }

    /// Render the excerpt with a caret line under it.
    pub fn render(&self) -> String {
        let mut out = self.excerpt.clone();
        out.push('\n');
        out.extend(std::iter::repeat(' ').take(self.caret));
        out.push('^');
        out
    }
}

/// The engine's error type.
#[derive(Debug, Clone, ThisError, Serialize)]
#[error("{class}/{code:?}: {message}")]
pub struct Error {
    /// Error class (handling policy)
    pub class: ErrorClass,
    /// Specific condition
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Source location, when the failure maps to query text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<SourceLoc>,
}

impl Error {
    /// Build an error with an explicit class.
    pub fn new(class: ErrorClass, code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            class,
            code,
            message: message.into(),
            loc: None,
        }
    }

    /// Parse-class error.
    pub fn parse(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::new(ErrorClass::Parse, code, message)
    }

    /// Compile-class error.
    pub fn compile(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::new(ErrorClass::Compile, code, message)
    }

    /// Schema-class error.
    pub fn schema(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::new(ErrorClass::Schema, code, message)
    }

    /// Runtime-class error.
    pub fn runtime(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::new(ErrorClass::Runtime, code, message)
    }

    /// Resource-class (transient) error.
    pub fn resource(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::new(ErrorClass::Resource, code, message)
    }

    /// Internal-class (fatal) error.
    pub fn internal(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::new(ErrorClass::Internal, code, message)
    }

    /// Attach a source location.
    pub fn with_loc(mut self, loc: SourceLoc) -> Self {
        self.loc = Some(loc);
        self
    }

    /// Transient errors are retried by the caller.
    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Resource
    }

    /// Client errors never reach a partition.
    pub fn is_client(&self) -> bool {
        matches!(
            self.class,
            ErrorClass::Parse | ErrorClass::Compile | ErrorClass::Schema
        )
    }

    /// The wire shape: `{"error": {"class", "code", "message", "detail"?}}`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "class": self.class.to_string(),
            "code": format!("{:?}", self.code),
            "message": self.message,
        });
        if let Some(loc) = &self.loc {
            body["detail"] = serde_json::Value::String(loc.render());
        }
        serde_json::json!({ "error": body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_class_and_code() {
        let err = Error::parse(ErrorCode::SyntaxError, "unexpected `end`");
        let msg = err.to_string();
        assert!(msg.contains("parse"));
        assert!(msg.contains("SyntaxError"));
        assert!(msg.contains("unexpected `end`"));
    }

    #[test]
    fn test_caret_render() {
        let loc = SourceLoc::new("if fruit === 3", 9);
        let rendered = loc.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "if fruit === 3");
        assert_eq!(lines[1].len(), 10);
        assert!(lines[1].ends_with('^'));
    }

    #[test]
    fn test_error_json_shape() {
        let err = Error::runtime(ErrorCode::DivideByZero, "division by zero")
            .with_loc(SourceLoc::new("x = 1 / 0", 6));
        let json = err.to_json();
        assert_eq!(json["error"]["class"], "runtime");
        assert_eq!(json["error"]["code"], "DivideByZero");
        assert!(json["error"]["detail"].as_str().unwrap().contains('^'));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::resource(ErrorCode::DeadlineExceeded, "deadline").is_transient());
        assert!(!Error::runtime(ErrorCode::BadArity, "arity").is_transient());
        assert!(Error::schema(ErrorCode::DuplicateName, "dup").is_client());
    }
}
