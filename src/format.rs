//! Stream entry definitions.
//!
//! Every entry starts with a fixed-size header followed by its path:
//!
//! ```text
//! kind: u8 | mode: u32 | path_len: u32 | path: [u8; path_len]
//! ```
//!
//! and continues depending on the kind:
//!  * `FILE`: `size: u64` followed by exactly `size` bytes of file contents
//!  * `SYMLINK`, `HARDLINK`: `target_len: u32` followed by the target bytes
//!  * `DIRECTORY`, `FIFO`: nothing
//!
//! All integers are little endian.

use std::path::{Path, PathBuf};

pub const KIND_DIRECTORY: u8 = 1;
pub const KIND_FILE: u8 = 2;
pub const KIND_SYMLINK: u8 = 3;
pub const KIND_HARDLINK: u8 = 4;
pub const KIND_FIFO: u8 = 5;

/// Permission bits (including setuid, setgid and sticky) stored for every entry.
pub const MODE_PERMISSION_MASK: u32 = 0o7777;

/// Upper limit for entry paths and link targets.
pub const MAX_PATH_LEN: u32 = 64 * 1024;

/// Size of `kind`, `mode` and `path_len`.
pub const HEADER_SIZE: usize = 1 + 4 + 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File { size: u64 },
    /// Literal symlink target, not resolved and not required to exist.
    Symlink(PathBuf),
    /// Path of an earlier entry of the same stream sharing this inode.
    Hardlink(PathBuf),
    Fifo,
}

impl EntryKind {
    pub fn tag(&self) -> u8 {
        match self {
            EntryKind::Directory => KIND_DIRECTORY,
            EntryKind::File { .. } => KIND_FILE,
            EntryKind::Symlink(_) => KIND_SYMLINK,
            EntryKind::Hardlink(_) => KIND_HARDLINK,
            EntryKind::Fifo => KIND_FIFO,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::Directory => "directory",
            EntryKind::File { .. } => "file",
            EntryKind::Symlink(_) => "symlink",
            EntryKind::Hardlink(_) => "hardlink",
            EntryKind::Fifo => "fifo",
        }
    }
}

/// One filesystem object of a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub(crate) path: PathBuf,
    pub(crate) mode: u32,
    pub(crate) kind: EntryKind,
}

impl Entry {
    pub fn new<P: Into<PathBuf>>(path: P, mode: u32, kind: EntryKind) -> Self {
        Self {
            path: path.into(),
            mode: mode & MODE_PERMISSION_MASK,
            kind,
        }
    }

    /// Path relative to the archived root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Permission bits.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    pub fn is_hardlink(&self) -> bool {
        matches!(self.kind, EntryKind::Hardlink(_))
    }

    /// Size of the file contents, zero for everything but regular files.
    pub fn file_size(&self) -> u64 {
        match self.kind {
            EntryKind::File { size } => size,
            _ => 0,
        }
    }
}
