use thiserror::Error;

use crate::model::{NodeId, PortType};

/// Errors raised while building, transforming, archiving or interpreting a model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("port '{0}' not found")]
    PortNotFound(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: PortType, found: PortType },

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("cycle detected through nodes {0:?}")]
    CycleDetected(Vec<NodeId>),

    #[error("archive error: {0}")]
    Archive(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the code-generation layer.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("duplicate symbol '{0}'")]
    DuplicateSymbol(String),

    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("code generation failed: {0}")]
    Codegen(String),

    #[error("object emission failed: {0}")]
    Object(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<cranelift_module::ModuleError> for EmitterError {
    fn from(err: cranelift_module::ModuleError) -> Self {
        EmitterError::Codegen(err.to_string())
    }
}

/// Errors raised while compiling a map or driving its compiled form.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("uncompilable node type '{0}'")]
    UncompilableNode(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("input type mismatch: map expects {expected}, caller supplied {found}")]
    InputTypeMismatch { expected: PortType, found: PortType },

    #[error("execution engine: {0}")]
    Jit(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Emitter(#[from] EmitterError),
}

impl From<std::io::Error> for CompileError {
    fn from(err: std::io::Error) -> Self {
        CompileError::Emitter(EmitterError::Io(err))
    }
}

pub type ModelResult<T> = Result<T, ModelError>;
pub type EmitterResult<T> = Result<T, EmitterError>;
pub type CompileResult<T> = Result<T, CompileError>;
