//! Error types for schema and path operations.

use thiserror::Error;

/// Errors raised by the schema store and path resolver.
///
/// Public `Chip` accessors normally log these and latch the object error
/// flag rather than propagating them; the engine-facing cores return them
/// directly.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("keypath [{0}] does not exist")]
    UnknownKeypath(String),

    #[error("keypath [{0}] is not a parameter")]
    NotAParam(String),

    #[error("keypath [{0}] is not a branch")]
    NotABranch(String),

    #[error("field '{field}' is not valid for keypath [{keypath}]")]
    UnknownField { keypath: String, field: String },

    #[error("type mismatch for keypath [{keypath}]: {reason}")]
    TypeMismatch { keypath: String, reason: String },

    #[error("illegal add() on scalar parameter [{0}]")]
    AddToScalar(String),

    #[error("illegal add() on field '{field}' of keypath [{keypath}]")]
    AddToField { keypath: String, field: String },

    #[error("invalid type string '{0}'")]
    BadTypeString(String),

    #[error("file {0} was not found")]
    FileNotFound(String),

    #[error("can only resolve files on file or dir parameters, not [{0}]")]
    NotAFileParam(String),

    #[error("unknown job '{0}' in history")]
    UnknownJob(String),

    #[error("unsupported manifest format for {0}")]
    BadManifestFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
