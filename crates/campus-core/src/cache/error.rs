//! Cache error handling
//!
//! Typed errors for the local cache with recovery suggestions for the
//! failures a user can actually fix.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Failed to create the cache directory
    #[error("Failed to create cache directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A payload could not be converted to or from JSON
    #[error("Cached payload is not valid JSON: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Classify an I/O error (permission, disk full, ...) with path context
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => CacheError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full_error(&error) => CacheError::DiskFull {
                path,
                source: error,
            },
            _ => CacheError::CreateDirectory {
                path,
                source: error,
            },
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CacheError::DiskFull { .. } | CacheError::PermissionDenied { .. }
        )
    }

    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            CacheError::DiskFull { .. } => Some("Free up disk space and try again."),
            CacheError::PermissionDenied { .. } => {
                Some("Check file and directory permissions, or point CAMPUS_DATA_DIR somewhere writable.")
            }
            CacheError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            CacheError::Database(_) => {
                Some("The cache only mirrors remote data; deleting cache.db is safe and it will be rebuilt.")
            }
            _ => None,
        }
    }
}

fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = CacheError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(err, CacheError::PermissionDenied { .. }));
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = CacheError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(matches!(err, CacheError::DiskFull { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_other_io_errors_are_directory_failures() {
        let io_err = io::Error::new(io::ErrorKind::AlreadyExists, "is a file");
        let err = CacheError::from_io(io_err, PathBuf::from("/data/campus"));

        assert!(matches!(err, CacheError::CreateDirectory { .. }));
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("/data/campus"));
    }
}
