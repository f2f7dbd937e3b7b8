// ABOUTME: Error types for parsing and evaluation faults

use crate::token::Position;
use thiserror::Error;

/// A lexing or parsing failure, reported at the host boundary.
#[derive(Error, Debug, Clone)]
#[error("{message} at {pos}")]
pub struct ParseError {
    pub message: String,
    pub pos: Position,
}

/// An internal evaluator fault: a programmer mistake such as an arity error
/// or an undefined identifier. Faults propagate in-band as `Object::Error`
/// and stop execution unless caught by a `defer onerror`.
#[derive(Error, Debug, Clone)]
pub enum EvalFault {
    #[error("{function}: expected {expected}, got {actual}")]
    TypeMismatch {
        function: String,
        expected: String,
        actual: String,
    },

    #[error("wrong number of arguments: expected {expected}, got {actual}")]
    Arity { expected: String, actual: usize },

    #[error("identifier not found: {0}")]
    Undefined(String),

    #[error("cannot assign to immutable binding '{0}'")]
    ImmutableAssign(String),

    #[error("unknown parameter '{0}'")]
    UnknownParam(String),

    #[error("parameter '{0}' bound twice")]
    DuplicateArg(String),

    #[error("index out of range: {0}")]
    BadIndex(String),

    #[error("not callable: {0}")]
    NotCallable(String),

    #[error("no matching signature for arguments ({0})")]
    DispatchFailed(String),

    #[error("'{0}' used before initialization")]
    UsedBeforeInit(String),

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("unknown member '{0}'")]
    UnknownMember(String),

    #[error("{0}")]
    Message(String),
}

impl EvalFault {
    pub fn type_mismatch(function: &str, expected: &str, actual: &str) -> Self {
        EvalFault::TypeMismatch {
            function: function.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        EvalFault::Message(text.into())
    }
}
