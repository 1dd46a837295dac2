//! VM error kinds and diagnostic rendering.

use thiserror::Error;

/// Every way a running chunk can fail. Allocation failure and guest-code
/// faults both land here; a broken collector or bytecode invariant panics
/// instead (see `gc` and `ember_bytecode::verify`), since those indicate a
/// defect in this crate rather than something a guest program triggered.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    /// An operation received an operand of the wrong type (e.g. adding a
    /// bool to an array).
    #[error("type error: {0}")]
    TypeError(String),

    /// Division or modulo by zero, or an operation producing a value the
    /// language declines to represent (e.g. integer overflow in a context
    /// that doesn't wrap).
    #[error("arithmetic error: {0}")]
    ArithmeticError(String),

    /// A global or struct field name was not found. Note: per-instance
    /// property *reads* that miss return `nil` rather than raising this —
    /// only globals and explicit lookups use it.
    #[error("name error: '{0}' is not defined")]
    NameError(String),

    /// A call supplied the wrong number of arguments for the callee.
    #[error("arity error: {name} expected {expected} argument(s), got {got}")]
    ArityError {
        name: String,
        expected: usize,
        got: usize,
    },

    /// An array or string index was out of bounds.
    #[error("index error: index {index} out of bounds for length {len}")]
    IndexError { index: i64, len: usize },

    /// The heap or a resource limit (task count, stack depth) was exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// The chunk itself is malformed in a way that escaped verification, or
    /// an opcode reached the interpreter that it doesn't know how to
    /// execute. This should never happen to a chunk that passed
    /// `ember_bytecode::verify_chunk`.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type VmResult<T> = Result<T, VmError>;

/// One entry in an optional stack trace, most-recent-call-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function_name: String,
    pub line: Option<u32>,
}

/// A `VmError` paired with the call stack active when it was raised.
/// Stack traces are optional scaffolding for diagnostics, not part of the
/// error's identity — two `Diagnostic`s with the same error and different
/// traces are still "the same error" as far as guest code can observe.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub error: VmError,
    pub frames: Vec<Frame>,
}

impl Diagnostic {
    pub fn new(error: VmError) -> Self {
        Self {
            error,
            frames: Vec::new(),
        }
    }

    pub fn with_frames(error: VmError, frames: Vec<Frame>) -> Self {
        Self { error, frames }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.error)?;
        for frame in &self.frames {
            match frame.line {
                Some(line) => writeln!(f, "  at {} (line {})", frame.function_name, line)?,
                None => writeln!(f, "  at {}", frame.function_name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_renders_error_and_frames() {
        let diag = Diagnostic::with_frames(
            VmError::NameError("foo".into()),
            vec![
                Frame { function_name: "bar".into(), line: Some(10) },
                Frame { function_name: "main".into(), line: None },
            ],
        );
        let rendered = diag.to_string();
        assert!(rendered.contains("name error: 'foo' is not defined"));
        assert!(rendered.contains("at bar (line 10)"));
        assert!(rendered.contains("at main"));
    }

    #[test]
    fn arity_error_formats_counts() {
        let err = VmError::ArityError { name: "f".into(), expected: 2, got: 1 };
        assert_eq!(err.to_string(), "arity error: f expected 2 argument(s), got 1");
    }
}
