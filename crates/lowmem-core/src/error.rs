use crate::dtype::DType;

/// Errors raised by tensor construction and conversion.
#[derive(Debug, thiserror::Error)]
pub enum LowmemError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("unsupported dtype {0} for this operation")]
    UnsupportedDType(DType),

    #[error("unknown dtype name '{0}'")]
    UnknownDType(String),

    #[error("cannot reshape {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<usize> },

    #[error("parameter '{0}' has no backing storage")]
    Unmaterialized(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    StorageError(String),
}
