//! Sync-level errors

use thiserror::Error;

use crate::cache::CacheError;
use crate::paths::PathError;
use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("Failed to encode entity: {0}")]
    Encode(#[from] serde_json::Error),

    /// One path can only be mirrored as one entity type at a time
    #[error("Path '{path}' is already observed as '{existing}', cannot observe it as '{requested}'")]
    PathTypeConflict {
        path: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("No Tokio runtime is running on this thread")]
    NoRuntime,
}

impl SyncError {
    /// True when the failure came from the remote side rejecting or missing a write
    pub fn is_remote(&self) -> bool {
        matches!(self, SyncError::Remote(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
