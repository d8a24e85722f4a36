//! *dirstream* - deterministic directory tree archives
//!
//! This crate serializes a directory tree into a single linear byte stream
//! and restores an equivalent tree from it. Two trees produce the same
//! stream (and thus the same digest) if and only if they contain the same
//! paths, types, permission bits, file contents, symlink targets and
//! hard-link groups.
//!
//! A stream is a plain sequence of entries without any global header,
//! trailer or index. Every entry consists of:
//!  * `KIND`     -- one byte type tag (directory, file, symlink, hardlink, fifo)
//!  * `MODE`     -- permission bits
//!  * `PATH`     -- path relative to the archived root, `/` separated
//!  * `PAYLOAD`  -- size and file contents, if it is a regular file
//!  * `TARGET`   -- link target, if it is a symlink or hardlink
//!
//! Entries are emitted depth-first with the children of every directory
//! sorted by name, so a directory always precedes its contents. The first
//! path referring to an inode is stored as a regular file, every further
//! path of that inode becomes a `HARDLINK` entry referring back to it.

pub mod decoder;
pub mod digest;
pub mod encoder;
pub mod error;
pub mod format;
pub mod hardlinks;
pub mod walk;

pub(crate) mod dir_stack;
pub(crate) mod tools;

mod create;
mod extract;

pub use create::{archive, create_archive};
pub use decoder::Decoder;
pub use digest::{tree_digest, DigestWriter};
pub use encoder::Encoder;
pub use error::ArchiveError;
pub use extract::{extract_archive, unarchive, OverwriteFlags, RestoreContext, UnarchiveOptions};
pub use format::{Entry, EntryKind};
pub use tools::format_single_line_entry;
