use crate::time_index::IndexError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("catalog serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt file {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}
