//! Error types for compilation and execution.

use std::fmt;

use crate::span::Span;
use thiserror::Error;

/// A single static error detected during compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct Trap {
    pub message: String,
    pub span: Span,
}

impl Trap {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.span, self.message)
    }
}

/// Batched compile-time errors. The compiler accumulates every static error
/// it finds in a single pass and surfaces them together.
#[derive(Debug, Error)]
#[error("{}", self.summary())]
pub struct SyntaxError {
    /// Name of the script being compiled.
    pub script: String,
    /// All traps, in source order of discovery.
    pub traps: Vec<Trap>,
}

impl SyntaxError {
    pub fn new(script: impl Into<String>, traps: Vec<Trap>) -> Self {
        Self {
            script: script.into(),
            traps,
        }
    }

    fn summary(&self) -> String {
        let mut out = format!(
            "{} error(s) compiling '{}'",
            self.traps.len(),
            self.script
        );
        for trap in &self.traps {
            out.push('\n');
            out.push_str(&trap.to_string());
        }
        out
    }
}

/// The kind of a runtime fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Ordinary runtime error (type error, undefined variable, ...).
    Error,
    /// A script-level `assert` failed.
    Assertion,
    /// The call-frame stack hit its depth limit.
    StackOverflow,
}

/// An unrecoverable runtime error.
///
/// Faults carry a growable list of human-readable trace frames, built
/// innermost-first by the VM's unwinder as the error propagates toward the
/// host boundary.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RuntimeFault {
    pub message: String,
    pub kind: FaultKind,
    /// Trace lines, innermost frame first.
    pub traces: Vec<String>,
}

impl RuntimeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FaultKind::Error,
            traces: Vec::new(),
        }
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FaultKind::Assertion,
            traces: Vec::new(),
        }
    }

    pub fn stack_overflow() -> Self {
        Self {
            message: "Call stack overflow.".to_string(),
            kind: FaultKind::StackOverflow,
            traces: Vec::new(),
        }
    }

    /// The message followed by all trace frames, one per line.
    pub fn full_trace(&self) -> String {
        let mut out = self.message.clone();
        for line in &self.traces {
            out.push('\n');
            out.push_str("  ");
            out.push_str(line);
        }
        out
    }
}

/// A unified error type for embedders.
#[derive(Debug, Error)]
pub enum SkiffError {
    #[error("Syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeFault),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_counts_traps() {
        let err = SyntaxError::new(
            "test.sk",
            vec![
                Trap::new("first", Span::line(1)),
                Trap::new("second", Span::line(3)),
            ],
        );
        let text = err.to_string();
        assert!(text.starts_with("2 error(s) compiling 'test.sk'"));
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn test_fault_full_trace() {
        let mut fault = RuntimeFault::new("boom");
        fault.traces.push("In function f() (line 2)".to_string());
        fault.traces.push("In <test.sk> (line 9)".to_string());
        let text = fault.full_trace();
        let inner = text.find("function f").unwrap();
        let outer = text.find("<test.sk>").unwrap();
        assert!(inner < outer);
    }
}
