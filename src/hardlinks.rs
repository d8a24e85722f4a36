//! Hardlink detection while archiving.

use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::Error;

use crate::error::io_error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HardLinkInfo {
    st_dev: u64,
    st_ino: u64,
}

impl HardLinkInfo {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            st_dev: metadata.dev(),
            st_ino: metadata.ino(),
        }
    }
}

/// Result of [`HardLinkTracker::observe`].
#[derive(Debug, PartialEq, Eq)]
pub struct Observation<'a> {
    /// `true` if no other path with the same identity was observed before.
    pub first_seen: bool,
    /// The first path observed with this identity.
    pub canonical_path: &'a Path,
}

/// Maps file identities to the first archived path, scoped to a single archive run.
#[derive(Default)]
pub struct HardLinkTracker {
    links: HashMap<HardLinkInfo, PathBuf>,
}

impl HardLinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a regular file at `path` with the given `lstat()` data.
    ///
    /// Files with a single link cannot show up again and are not remembered.
    pub fn observe<'a>(&'a mut self, path: &'a Path, metadata: &Metadata) -> Observation<'a> {
        if metadata.nlink() <= 1 {
            return Observation {
                first_seen: true,
                canonical_path: path,
            };
        }

        let info = HardLinkInfo::from_metadata(metadata);
        if self.links.contains_key(&info) {
            return Observation {
                first_seen: false,
                canonical_path: &self.links[&info],
            };
        }

        self.links.insert(info, path.to_owned());
        Observation {
            first_seen: true,
            canonical_path: path,
        }
    }

    /// Same as [`observe`](Self::observe), but queries the file system for `path` first.
    /// `path` is used as is for the lookup and for recording.
    pub fn observe_path<'a>(&'a mut self, path: &'a Path) -> Result<Observation<'a>, Error> {
        let metadata = std::fs::symlink_metadata(path).map_err(|err| io_error(err, path))?;
        Ok(self.observe(path, &metadata))
    }

    /// Number of remembered multi-link files.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
