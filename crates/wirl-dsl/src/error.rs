//! Error types for parsing and compilation.

use thiserror::Error;

/// Source does not conform to the WIRL grammar. Fatal at parse time.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("parse error at {line}:{col}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, col: usize, message: String) -> Self {
        ParseError { line, col, message }
    }
}

/// AST violates one of the invariants in the graph compiler. Compilation
/// batches every violation found in a single pass rather than failing on
/// the first.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("workflow must declare at least one input")]
    NoInputs,

    #[error("workflow must declare at least one output")]
    NoOutputs,

    #[error("no node transitively depends on a workflow input (dead-start graph)")]
    DeadStart,

    #[error("duplicate name '{0}' in scope '{1}'")]
    DuplicateName(String, String),

    #[error("reference '{0}' does not resolve to a declared channel")]
    UnresolvedReference(String),

    #[error("reference '{reference}' inside cycle '{cycle}' must use dotted notation")]
    NonDottedInCycle { cycle: String, reference: String },

    #[error("reference '{reference}' inside cycle '{cycle}' resolves outside the cycle scope")]
    CrossCycleReference { cycle: String, reference: String },

    #[error("reducer tag on '{0}' is not permitted in this position")]
    IllegalReducerTag(String),

    #[error("output '{0}' has no source expression resolving to a declared channel")]
    UnresolvedOutput(String),

    #[error("cycle '{0}' contains an internal dependency cycle")]
    InternalCycle(String),

    #[error("workflow-level graph contains a cycle outside a declared cycle block")]
    UnexpectedCycle,
}
