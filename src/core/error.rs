// This module defines the error types for vmgen using the thiserror crate. CompileError
// separates the two classes of failure the backend can report: user-facing errors that
// point at a source file and line (type mismatches, use of uninitialized variables, bad
// call arity, illegal types, and warnings escalated by configuration), and internal errors
// that signal a bug in the compiler itself (register bookkeeping mismatches, a value that
// claims a position it does not hold, an instruction whose emitted size differs from the
// size promised during layout, allocation with every register locked, and unimplemented
// lowering paths). Diagnostics collects non-fatal warnings and escalates them when asked.

//! Error types for the vmgen backend.
//!
//! Using thiserror for more idiomatic error handling.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A source location attached to user-facing diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLoc {
    pub file: Arc<str>,
    pub line: u32,
}

impl SourceLoc {
    pub fn new(file: impl Into<Arc<str>>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Location used for operations synthesised by the backend itself.
    pub fn builtin() -> Self {
        Self::new("<builtin>", 0)
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Main error type for lowering and assembly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("{loc}: error: {message}")]
    User { loc: SourceLoc, message: String },

    #[error("{loc}: error (from warning): {message}")]
    Warning { loc: SourceLoc, message: String },

    #[error("internal compiler error: {message}")]
    Internal { message: String },

    #[error("internal compiler error: unsupported operation: {operation}")]
    Unsupported { operation: String },
}

impl CompileError {
    pub fn user(loc: &SourceLoc, message: impl Into<String>) -> Self {
        CompileError::User {
            loc: loc.clone(),
            message: message.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        CompileError::Unsupported {
            operation: operation.into(),
        }
    }

    /// True for errors that indicate a compiler bug rather than bad input.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            CompileError::Internal { .. } | CompileError::Unsupported { .. }
        )
    }

    /// Source location of a user-facing error.
    pub fn location(&self) -> Option<&SourceLoc> {
        match self {
            CompileError::User { loc, .. } | CompileError::Warning { loc, .. } => Some(loc),
            _ => None,
        }
    }
}

/// Build a [`CompileError::Internal`] from a format string.
#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::core::error::CompileError::Internal { message: format!($($arg)*) }
    };
}

/// Result type alias for lowering and assembly operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// A non-fatal diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub loc: SourceLoc,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: warning: {}", self.loc, self.message)
    }
}

/// Collected warnings for one module.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
    warnings_as_errors: bool,
}

impl Diagnostics {
    pub fn new(warnings_as_errors: bool) -> Self {
        Self {
            warnings: Vec::new(),
            warnings_as_errors,
        }
    }

    /// Record a warning, or fail with it when warnings are escalated.
    pub fn warn(&mut self, loc: &SourceLoc, message: impl Into<String>) -> CompileResult<()> {
        let message = message.into();
        if self.warnings_as_errors {
            return Err(CompileError::Warning {
                loc: loc.clone(),
                message,
            });
        }
        let warning = Warning {
            loc: loc.clone(),
            message,
        };
        log::warn!("{}", warning);
        self.warnings.push(warning);
        Ok(())
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }
}
