//! Error types for action models and rule evaluation.

use protosim_env::EnvError;
use thiserror::Error;

/// Errors raised while loading action models or evaluating rules.
///
/// `MalformedActionModel` and `UnresolvedReference` are authoring errors:
/// defects in the model itself rather than in the protocol under test.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// The action model document is invalid
    #[error("Malformed action model '{action}': {reason}")]
    MalformedActionModel { action: String, reason: String },

    /// A path could not be resolved against the bindings
    #[error("Unresolved reference: {path}")]
    UnresolvedReference { path: String },

    /// An operator was applied to values of the wrong type
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// Integer division or remainder by zero
    #[error("Division by zero in {expr}")]
    DivisionByZero { expr: String },

    /// An expression string is outside the supported grammar
    #[error("Parse error in '{input}' at {position}: {message}")]
    Parse {
        input: String,
        position: usize,
        message: String,
    },

    /// The execution environment failed
    #[error(transparent)]
    Env(#[from] EnvError),
}

impl CoreError {
    /// Creates a malformed-model error.
    pub fn malformed(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedActionModel {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unresolved-reference error.
    pub fn unresolved(path: impl std::fmt::Display) -> Self {
        Self::UnresolvedReference {
            path: path.to_string(),
        }
    }

    /// Creates a type-mismatch error.
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Returns true for defects in the model rather than the environment.
    pub fn is_authoring(&self) -> bool {
        !matches!(self, CoreError::Env(_))
    }
}
