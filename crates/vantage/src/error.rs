use crate::arena::NodeId;
use crate::funcnode::FnId;
use thiserror::Error;

/// Faults raised by a node's `eval`. The engine logs them and keeps the
/// node's previous result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("{op}: expected {expected}, found {found}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        found: String,
    },
    #[error("{op}: cannot combine sequences of length {left} and {right}")]
    LengthMismatch {
        op: &'static str,
        left: usize,
        right: usize,
    },
    #[error("{op}: expected {expected} arguments, got {found}")]
    Arity {
        op: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("unknown data source {0}")]
    UnknownDataSource(u32),
    #[error("data source {0} failed: {1}")]
    DataSource(u32, String),
}

/// Errors returned to callers of the engine API.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("node {0} does not exist or was destroyed")]
    UnknownNode(NodeId),
    #[error("node {0} does not accept writes")]
    NotWritable(NodeId),
    #[error("function node {0} is not part of the program")]
    UnknownFunctionNode(FnId),
    #[error("defun {0} is not part of the program")]
    UnknownDefun(u32),
    #[error("no environment for {0} above the current one")]
    MissingEnvironment(String),
    #[error("unknown output '{0}'")]
    UnknownOutput(String),
    #[error("write position {index}..{end} is out of range for a sequence of length {len}")]
    PositionOutOfRange { index: usize, end: usize, len: usize },
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("malformed program: {0}")]
    Program(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
