use std::path::PathBuf;

use lowmem_core::LowmemError;

/// Errors from checkpoint storage, annotation and materialization.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// A parameter name sanitized to nothing usable as a file name.
    #[error("parameter name {0:?} does not yield a usable file name")]
    InvalidName(String),

    /// A checkpoint, manifest or config that should exist does not.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A per-parameter file referenced by a manifest is absent.
    #[error("checkpoint file missing: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("malformed {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tensor(#[from] LowmemError),

    /// Parameters still waiting on a deferred source.
    #[error("{} parameter(s) still unresolved, first: {}", .0.len(), .0.first().map(String::as_str).unwrap_or(""))]
    Unresolved(Vec<String>),
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CheckpointError::Format {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
