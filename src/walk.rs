//! Deterministic directory traversal.
//!
//! Yields every object below a root directory exactly once, depth-first, with the children of
//! each directory sorted by their raw file name bytes. Symbolic links are reported but never
//! followed.

use std::fs::Metadata;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use walkdir::WalkDir;

use crate::error::{io_error, ArchiveError};

/// Object types which can be stored in a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    File,
    Symlink,
    Fifo,
}

pub struct WalkEntry {
    path: PathBuf,
    relative: PathBuf,
    kind: FileKind,
    metadata: Metadata,
}

impl WalkEntry {
    /// Full path on the file system.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path relative to the walked root.
    pub fn relative_path(&self) -> &Path {
        &self.relative
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// `lstat()` information of the object.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Permission bits of the object.
    pub fn mode(&self) -> u32 {
        self.metadata.mode() & crate::format::MODE_PERMISSION_MASK
    }
}

pub struct Walker {
    root: PathBuf,
    inner: walkdir::IntoIter,
    failed: bool,
}

impl Walker {
    /// Start walking below `root`, which has to be an existing directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        let root = root.as_ref().to_owned();

        let metadata = std::fs::metadata(&root).map_err(|err| io_error(err, &root))?;
        if !metadata.is_dir() {
            bail!("not a directory: {root:?}");
        }

        let inner = WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter();

        Ok(Self {
            root,
            inner,
            failed: false,
        })
    }

    fn convert(&self, entry: walkdir::DirEntry) -> Result<WalkEntry, Error> {
        let relative = match entry.path().strip_prefix(&self.root) {
            Ok(relative) => relative.to_owned(),
            Err(_) => bail!("walked outside of the root directory: {:?}", entry.path()),
        };

        let metadata = entry.metadata().map_err(|err| walk_error(err, &relative))?;
        let file_type = metadata.file_type();

        let kind = if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::File
        } else if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_fifo() {
            FileKind::Fifo
        } else {
            return Err(ArchiveError::UnsupportedType {
                path: relative,
                mode: metadata.mode() & libc::S_IFMT,
            }
            .into());
        };

        Ok(WalkEntry {
            path: entry.into_path(),
            relative,
            kind,
            metadata,
        })
    }
}

impl Iterator for Walker {
    type Item = Result<WalkEntry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = match self.inner.next()? {
            Ok(entry) => self.convert(entry),
            Err(err) => Err(walk_error(err, &self.root)),
        };
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

fn walk_error(err: walkdir::Error, fallback: &Path) -> Error {
    let path = err.path().unwrap_or(fallback).to_owned();
    match err.into_io_error() {
        Some(inner) => io_error(inner, &path),
        None => Error::from(io::Error::new(
            io::ErrorKind::Other,
            format!("filesystem loop detected at {path:?}"),
        )),
    }
}
