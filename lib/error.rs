//! Error taxonomy for the cache.
//!
//! Absence and supersession are not errors: they are resolved as values (`Option::None`,
//! [`WriteOutcome::CanceledByNewerRequest`](crate::cache::WriteOutcome)). Everything here is a
//! genuine failure that reaches only the caller of the operation that triggered it.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Coarse classification of an OS-level I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum IoClass {
    /// The file or one of its parents does not exist.
    NotFound,
    /// The process lacks permission for the operation.
    PermissionDenied,
    /// The device has no space left, or a quota was exceeded.
    NoSpace,
    /// The process or the system ran out of file descriptors.
    TooManyOpenFiles,
    /// The path is malformed, too long, or traverses a non-directory.
    InvalidPath,
    /// The operation was interrupted or timed out.
    Interrupted,
    /// Anything else (hardware failures, unexpected errno values, ...).
    Other,
}

impl IoClass {
    /// Classify an I/O error, preferring the raw errno where it is more specific than the
    /// [`io::ErrorKind`].
    #[must_use]
    pub fn of(error: &io::Error) -> Self {
        if let Some(errno) = error.raw_os_error() {
            match errno {
                libc::EMFILE | libc::ENFILE => return Self::TooManyOpenFiles,
                libc::ENOSPC | libc::EDQUOT => return Self::NoSpace,
                libc::ENAMETOOLONG | libc::ENOTDIR | libc::ELOOP | libc::EISDIR => {
                    return Self::InvalidPath;
                }
                libc::EACCES | libc::EPERM | libc::EROFS => return Self::PermissionDenied,
                libc::ENOENT => return Self::NotFound,
                _ => {}
            }
        }

        match error.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::PermissionDenied
            }
            io::ErrorKind::StorageFull => Self::NoSpace,
            io::ErrorKind::InvalidFilename
            | io::ErrorKind::NotADirectory
            | io::ErrorKind::IsADirectory
            | io::ErrorKind::InvalidInput => Self::InvalidPath,
            io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => Self::Interrupted,
            _ => Self::Other,
        }
    }

    /// A short human-readable description of the class.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::NotFound => "no such file or directory",
            Self::PermissionDenied => "permission denied",
            Self::NoSpace => "no space left on device",
            Self::TooManyOpenFiles => "too many open files",
            Self::InvalidPath => "invalid path",
            Self::Interrupted => "interrupted",
            Self::Other => "I/O failure",
        }
    }
}

impl fmt::Display for IoClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Errors returned by cache operations.
///
/// Cloneable so that every caller joined onto one coalesced read receives the same failure.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The file name contains a path separator or is otherwise not a plain file name.
    #[error("Invalid cache file name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A filesystem operation failed.
    #[error("I/O error on {} ({class}): {source}", path.display())]
    Io {
        /// The path the operation was performed on.
        path: PathBuf,
        /// Classification of the failure.
        class: IoClass,
        /// The underlying error.
        #[source]
        source: Arc<io::Error>,
    },

    /// A background task servicing the operation panicked or was cancelled.
    #[error("Background task for {} failed: {reason}", path.display())]
    TaskFailed {
        /// The path the task was servicing.
        path: PathBuf,
        /// The join error message.
        reason: String,
    },

    /// The stream session already failed; the original failure is carried along.
    #[error("Stream session on {} already failed: {source}", path.display())]
    SessionFailed {
        /// The path of the session.
        path: PathBuf,
        /// The first error the session observed.
        #[source]
        source: Arc<io::Error>,
    },
}

impl CacheError {
    /// Wrap an [`io::Error`] raised while operating on `path`.
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            class: IoClass::of(&source),
            source: Arc::new(source),
        }
    }

    /// The classification of the underlying I/O failure, if this is one.
    #[must_use]
    pub fn io_class(&self) -> Option<IoClass> {
        match self {
            Self::Io { class, .. } => Some(*class),
            Self::SessionFailed { source, .. } => Some(IoClass::of(source)),
            Self::InvalidName { .. } | Self::TaskFailed { .. } => None,
        }
    }
}

/// Errors returned when opening a cache directory.
#[derive(Debug, Error)]
pub enum OpenDirectoryError {
    /// The path exists but is not a directory.
    #[error("Cache path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The path does not exist and creation was not requested.
    #[error("Cache directory does not exist: {0}")]
    Missing(PathBuf),

    /// The path must be absolute.
    #[error("Cache directory path must be absolute: {0}")]
    NotAbsolute(PathBuf),

    /// An I/O error occurred while inspecting or creating the directory.
    #[error("I/O error while opening cache directory ({class}): {source}")]
    Io {
        /// Classification of the failure.
        class: IoClass,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

impl From<io::Error> for OpenDirectoryError {
    fn from(source: io::Error) -> Self {
        Self::Io {
            class: IoClass::of(&source),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errno_before_kind() {
        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(IoClass::of(&emfile), IoClass::TooManyOpenFiles);

        let enospc = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(IoClass::of(&enospc), IoClass::NoSpace);

        let eacces = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(IoClass::of(&eacces), IoClass::PermissionDenied);
    }

    #[test]
    fn classifies_synthetic_errors_by_kind() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(IoClass::of(&err), IoClass::NotFound);

        let err = io::Error::other("weird");
        assert_eq!(IoClass::of(&err), IoClass::Other);
    }

    #[test]
    fn io_error_carries_class_and_path() {
        let err = CacheError::io(
            Path::new("/tmp/x"),
            io::Error::from_raw_os_error(libc::ENAMETOOLONG),
        );
        assert_eq!(err.io_class(), Some(IoClass::InvalidPath));
        assert!(err.to_string().contains("/tmp/x"));
    }
}
