use thiserror::Error;

use crate::types::BlockPointer;

pub type CrResult<T> = Result<T, CrError>;

#[derive(Debug, Error)]
pub enum CrError {
    /// The folder has failed to resolve too many times in a row and
    /// will not be retried until an operator clears its attempt log.
    #[error("too many conflict resolution attempts for folder {folder}")]
    TooManyAttempts { folder: String },

    #[error("conflict resolution canceled")]
    Canceled,

    #[error("no chain found for pointer {0}")]
    NoChainFound(BlockPointer),

    #[error("node not found for pointer {0}")]
    NodeNotFound(BlockPointer),

    #[error("no entry named {name:?} in directory {dir}")]
    NoSuchName { dir: BlockPointer, name: String },

    #[error("block {0} is not a directory block")]
    NotDirBlock(BlockPointer),

    #[error("block {0} is not a file block")]
    NotFileBlock(BlockPointer),

    #[error("couldn't find a unique name for {0:?}")]
    NoUniqueName(String),

    #[error("inconsistent resolution state: {0}")]
    Inconsistent(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrError {
    /// Cancellation is not a failure for stuck-detection purposes.
    pub fn is_canceled(&self) -> bool {
        matches!(self, CrError::Canceled)
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        CrError::Inconsistent(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_canceled() {
        assert!(CrError::Canceled.is_canceled());
        assert!(!CrError::Storage("boom".into()).is_canceled());
        assert!(!CrError::TooManyAttempts {
            folder: "f".into()
        }
        .is_canceled());
    }

    #[test]
    fn test_display_includes_context() {
        let err = CrError::NoSuchName {
            dir: BlockPointer::ZERO,
            name: "notes.txt".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("notes.txt"), "got: {msg}");

        let err = CrError::TooManyAttempts {
            folder: "team/docs".into(),
        };
        assert!(err.to_string().contains("team/docs"));
    }
}
