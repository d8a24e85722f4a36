//! Error kinds reported by the archive and restore code.
//!
//! All public functions return [`anyhow::Error`]. When a failure belongs to
//! one of the kinds below, an [`ArchiveError`] is its root cause and can be
//! recovered with `err.downcast_ref::<ArchiveError>()`.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Error;
use nix::errno::Errno;

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("no such file or directory: {path:?}")]
    NotFound { path: PathBuf },

    #[error("permission denied: {path:?}")]
    Access { path: PathBuf },

    #[error("unsupported file type 0o{mode:o} at {path:?}")]
    UnsupportedType { path: PathBuf, mode: u32 },

    #[error("malformed stream: {0}")]
    MalformedStream(String),

    #[error("hardlink {path:?} refers to {target:?} which has not been restored yet")]
    DanglingLink { path: PathBuf, target: PathBuf },
}

impl ArchiveError {
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        ArchiveError::MalformedStream(reason.into())
    }
}

/// Turn an I/O error on `path` into an [`ArchiveError`] where a matching kind exists, or
/// attach the path as context otherwise.
pub(crate) fn io_error(err: io::Error, path: &Path) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => ArchiveError::NotFound {
            path: path.to_owned(),
        }
        .into(),
        io::ErrorKind::PermissionDenied => ArchiveError::Access {
            path: path.to_owned(),
        }
        .into(),
        _ => Error::from(err).context(format!("error at {path:?}")),
    }
}

/// Same as [`io_error`] for raw `errno` values returned by `nix`.
pub(crate) fn errno_error(errno: Errno, path: &Path) -> Error {
    match errno {
        Errno::ENOENT => ArchiveError::NotFound {
            path: path.to_owned(),
        }
        .into(),
        Errno::EACCES | Errno::EPERM => ArchiveError::Access {
            path: path.to_owned(),
        }
        .into(),
        other => Error::from(other).context(format!("error at {path:?}")),
    }
}
