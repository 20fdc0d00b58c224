//! Error types for checkpoint patching.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for checkpoint patching.
pub type PatchResult<T> = Result<T, PatchError>;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{0}")]
    Precondition(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("socket image codec failed on {}: {reason}", path.display())]
    Codec { path: PathBuf, reason: String },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("socket image {} not found in checkpoint", path.display())]
    MissingSocketImage { path: PathBuf },

    #[error(
        "no socket in {} is bound to {old} or a wildcard address (found: [{}]); decoded image dumped to {}",
        path.display(),
        observed.join(", "),
        dump_path.display()
    )]
    AddressNotFound {
        path: PathBuf,
        old: String,
        observed: Vec<String>,
        dump_path: PathBuf,
    },

    #[error("tar archive {}: {source}", path.display())]
    Tar {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PatchError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> PatchError {
        let path = path.into();
        move |source| PatchError::Io { path, source }
    }

    pub(crate) fn tar(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> PatchError {
        let path = path.into();
        move |source| PatchError::Tar { path, source }
    }
}
