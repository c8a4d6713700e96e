use crate::storage::ExecutionStatus;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("log event JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid execution id: {0:?}")]
    InvalidId(String),

    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("execution {id} already finished with status {status}")]
    AlreadyFinished { id: String, status: ExecutionStatus },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
