//! Error taxonomy for the preprocessor.
//!
//! One enum covers the whole pipeline, from comment stripping through
//! runnable execution. Every variant that originates in source text carries
//! a [`Pos`] (file and line) so diagnostics always point somewhere real.
//! Nothing here is retried silently; re-scanning expanded text is expansion,
//! not error recovery.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type used throughout the kernel.
pub type PrepResult<T> = Result<T, PrepError>;

/// A source position: file plus 1-based line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pos {
    pub file: PathBuf,
    pub line: usize,
}

impl Pos {
    pub fn new(file: impl Into<PathBuf>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

/// Preprocessing errors.
#[derive(Debug, Clone, Error)]
pub enum PrepError {
    #[error("{pos}: unterminated block comment")]
    Lex { pos: Pos },

    #[error("{pos}: bad directive: {msg}")]
    DirectiveSyntax { pos: Pos, msg: String },

    #[error("{pos}: unterminated directive block '{name}'")]
    UnterminatedDirective { pos: Pos, name: String },

    #[error("{pos}: macro '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        pos: Pos,
        name: String,
        expected: String,
        got: usize,
    },

    #[error("{pos}: recursion limit {limit} exceeded expanding {chain}")]
    RecursionLimit {
        pos: Pos,
        limit: usize,
        chain: String,
    },

    #[error("{pos}: include failed: {msg}")]
    Include { pos: Pos, msg: String },

    #[error("{pos}: condition type error: {msg}")]
    ConditionType { pos: Pos, msg: String },

    #[error("{pos}: compiling runnable '{name}' failed: {diagnostics}")]
    Compile {
        pos: Pos,
        name: String,
        diagnostics: String,
    },

    #[error("{pos}: runnable '{name}' failed at runtime (exit {code}): {output}")]
    RuntimeFailed {
        pos: Pos,
        name: String,
        code: i32,
        output: String,
    },

    #[error("{pos}: runnable '{name}' timed out after {}ms", .deadline.as_millis())]
    TimedOut {
        pos: Pos,
        name: String,
        deadline: Duration,
    },

    #[error("{pos}: no signal lease for '{id}': {msg}")]
    SignalLeaseConflict { pos: Pos, id: String, msg: String },
}

impl PrepError {
    /// The source position this error points at.
    pub fn pos(&self) -> &Pos {
        match self {
            PrepError::Lex { pos }
            | PrepError::DirectiveSyntax { pos, .. }
            | PrepError::UnterminatedDirective { pos, .. }
            | PrepError::Arity { pos, .. }
            | PrepError::RecursionLimit { pos, .. }
            | PrepError::Include { pos, .. }
            | PrepError::ConditionType { pos, .. }
            | PrepError::Compile { pos, .. }
            | PrepError::RuntimeFailed { pos, .. }
            | PrepError::TimedOut { pos, .. }
            | PrepError::SignalLeaseConflict { pos, .. } => pos,
        }
    }

    /// True for failures of the runnable execution subsystem. These are the
    /// errors the `Marker` policy downgrades to an inline error marker.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            PrepError::Compile { .. }
                | PrepError::RuntimeFailed { .. }
                | PrepError::TimedOut { .. }
                | PrepError::SignalLeaseConflict { .. }
        )
    }

    /// Short lowercase tag used by the inline error marker.
    pub fn kind(&self) -> &'static str {
        match self {
            PrepError::Lex { .. } => "lex",
            PrepError::DirectiveSyntax { .. } => "syntax",
            PrepError::UnterminatedDirective { .. } => "unterminated",
            PrepError::Arity { .. } => "arity",
            PrepError::RecursionLimit { .. } => "recursion",
            PrepError::Include { .. } => "include",
            PrepError::ConditionType { .. } => "condition",
            PrepError::Compile { .. } => "compile",
            PrepError::RuntimeFailed { .. } => "runtime",
            PrepError::TimedOut { .. } => "timeout",
            PrepError::SignalLeaseConflict { .. } => "signal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pos_display() {
        let pos = Pos::new("foo.c", 12);
        assert_eq!(pos.to_string(), "foo.c:12");
    }

    #[test]
    fn test_error_carries_position() {
        let err = PrepError::Arity {
            pos: Pos::new("a.c", 3),
            name: "m".into(),
            expected: "2".into(),
            got: 1,
        };
        assert_eq!(err.pos().line, 3);
        assert!(err.to_string().contains("a.c:3"));
    }

    #[test]
    fn test_execution_failure_classification() {
        let pos = Pos::new("x.c", 1);
        let timeout = PrepError::TimedOut {
            pos: pos.clone(),
            name: "r".into(),
            deadline: Duration::from_secs(1),
        };
        assert!(timeout.is_execution_failure());
        assert_eq!(timeout.kind(), "timeout");

        let lex = PrepError::Lex { pos };
        assert!(!lex.is_execution_failure());
    }
}
