//! Error types for the array kernel compiler

use thiserror::Error;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Compilation errors
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Lexer error at position {position}: {message}")]
    LexerError { position: usize, message: String },

    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("Invalid shape: {message}")]
    InvalidShape { message: String },

    #[error("Undefined variable: {name}")]
    UndefinedVariable { name: String },

    #[error("Unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    #[error("Code generation error: {message}")]
    CodeGen { message: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CompileError {
    pub fn parse_error(msg: impl Into<String>) -> Self {
        CompileError::ParseError { message: msg.into() }
    }

    pub fn shape_mismatch(expected: impl ToString, got: impl ToString) -> Self {
        CompileError::ShapeMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    pub fn invalid_shape(msg: impl Into<String>) -> Self {
        CompileError::InvalidShape { message: msg.into() }
    }

    pub fn undefined(name: impl Into<String>) -> Self {
        CompileError::UndefinedVariable { name: name.into() }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        CompileError::UnsupportedOperation { message: msg.into() }
    }

    pub fn codegen(msg: impl Into<String>) -> Self {
        CompileError::CodeGen { message: msg.into() }
    }
}

/// Failures reported by an accelerator backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Device unavailable: {message}")]
    DeviceUnavailable { message: String },

    #[error("Kernel compilation failed: {message}")]
    Compile { message: String },

    #[error("Kernel launch failed: {message}")]
    Launch { message: String },

    #[error("Read-back failed: {message}")]
    ReadBack { message: String },
}

impl BackendError {
    pub fn device(msg: impl Into<String>) -> Self {
        BackendError::DeviceUnavailable { message: msg.into() }
    }

    pub fn compile(msg: impl Into<String>) -> Self {
        BackendError::Compile { message: msg.into() }
    }

    pub fn launch(msg: impl Into<String>) -> Self {
        BackendError::Launch { message: msg.into() }
    }

    pub fn read_back(msg: impl Into<String>) -> Self {
        BackendError::ReadBack { message: msg.into() }
    }
}
