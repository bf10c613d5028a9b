//! Error types for filesystem operations.
//!
//! Every user-visible failure maps onto a POSIX errno so the transport
//! layer can hand it straight back to the kernel. The type is `Clone`
//! because a single failed inode load must be delivered to every caller
//! waiting on that load.

use std::path::PathBuf;

use crate::scm::Hash;

/// A filesystem operation error with a POSIX errno mapping.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FsError {
    /// `ENOENT`
    #[error("{}: no such file or directory", path.display())]
    NotFound {
        /// Path (or best-effort log path) of the missing entry.
        path: PathBuf,
    },

    /// `EEXIST`
    #[error("{}: file exists", path.display())]
    Exists {
        /// Path of the conflicting entry.
        path: PathBuf,
    },

    /// `ENOTDIR`
    #[error("{}: not a directory", path.display())]
    NotADirectory {
        /// Path of the non-directory entry.
        path: PathBuf,
    },

    /// `EISDIR`
    #[error("{}: is a directory", path.display())]
    IsADirectory {
        /// Path of the directory.
        path: PathBuf,
    },

    /// `ENOTEMPTY`
    #[error("{}: directory not empty", path.display())]
    NotEmpty {
        /// Path of the non-empty directory.
        path: PathBuf,
    },

    /// `EPERM`
    #[error("{}: operation not permitted", path.display())]
    PermissionDenied {
        /// Path the operation was attempted on.
        path: PathBuf,
    },

    /// `EINVAL`
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was invalid.
        message: String,
    },

    /// `ENAMETOOLONG`
    #[error("path component too long ({length} bytes)")]
    NameTooLong {
        /// Byte length of the offending component.
        length: usize,
    },

    /// `ENOENT` for a source-control object the backing store does not have.
    #[error("object {hash} not found in object store")]
    ObjectNotFound {
        /// Content hash of the missing object.
        hash: Hash,
    },

    /// `EIO`: an underlying storage failure, stringified so the error
    /// stays `Clone` across promise fan-out.
    #[error("I/O error: {message}")]
    Io {
        /// Description of the underlying failure.
        message: String,
    },

    /// `EIO`: an internal invariant was violated. These are logged at
    /// error level where they are raised; the variant exists so waiters
    /// on a poisoned load observe a failure instead of hanging.
    #[error("internal error: {message}")]
    Bug {
        /// Description of the violated invariant.
        message: String,
    },
}

impl FsError {
    /// The POSIX errno corresponding to this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound { .. } | Self::ObjectNotFound { .. } => libc::ENOENT,
            Self::Exists { .. } => libc::EEXIST,
            Self::NotADirectory { .. } => libc::ENOTDIR,
            Self::IsADirectory { .. } => libc::EISDIR,
            Self::NotEmpty { .. } => libc::ENOTEMPTY,
            Self::PermissionDenied { .. } => libc::EPERM,
            Self::InvalidArgument { .. } => libc::EINVAL,
            Self::NameTooLong { .. } => libc::ENAMETOOLONG,
            Self::Io { .. } | Self::Bug { .. } => libc::EIO,
        }
    }

    /// Wrap an `std::io::Error` from the overlay or object store.
    pub fn io(err: &std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }

    /// Report a broken internal invariant.
    ///
    /// The caller is expected to have logged the incident with full
    /// context before constructing the error.
    pub fn bug(message: impl Into<String>) -> Self {
        Self::Bug {
            message: message.into(),
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        Self::from_raw_os_error(err.errno())
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = FsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let err = FsError::NotFound {
            path: PathBuf::from("a/b"),
        };
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(err.to_string().contains("a/b"));
        let io: std::io::Error = err.into();
        assert_eq!(io.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn errors_are_cloneable() {
        let err = FsError::bug("load requested for an already-loaded inode");
        let copy = err.clone();
        assert_eq!(copy.errno(), libc::EIO);
    }
}
