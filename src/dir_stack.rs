use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::{fchmod, mkdirat, Mode};

use proxmox_sys::error::SysError;

use crate::error::{errno_error, ArchiveError};
use crate::tools::perms_from_mode;

/// Mode of directories which are created without a directory entry of their own.
const IMPLICIT_DIR_MODE: u32 = 0o755;

/// Directories stay writable for us until they are left.
const WORKING_DIR_MODE: u32 = 0o700;

struct RestoreDir {
    file_name: OsString,
    /// Recorded permissions, applied once the directory is left.
    mode: Option<u32>,
    dir: Dir,
}

/// Stack of open directories from the restore root down to the directory currently being
/// filled.
///
/// Every directory below the root is opened with `O_NOFOLLOW`, so no entry can be placed
/// outside of the root through a symlink.
pub struct DirStack {
    dirs: Vec<RestoreDir>,
    path: PathBuf,
    /// Directories created during this run, these may be entered again.
    created: HashSet<PathBuf>,
    /// Directories which had an entry of their own, each path may only have one.
    restored: HashSet<PathBuf>,
}

impl DirStack {
    pub fn new(root: Dir) -> Self {
        Self {
            dirs: vec![RestoreDir {
                file_name: OsString::from("."),
                mode: None,
                dir: root,
            }],
            path: PathBuf::new(),
            created: HashSet::new(),
            restored: HashSet::new(),
        }
    }

    /// Path of the current directory relative to the root.
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root_dir_fd(&self) -> RawFd {
        self.dirs[0].dir.as_raw_fd()
    }

    fn last_dir_fd(&self) -> RawFd {
        // the root directory is never popped
        self.dirs[self.dirs.len() - 1].dir.as_raw_fd()
    }

    /// Make `parent` (relative to the root) the current directory and return its descriptor.
    ///
    /// Directories which are not on the way to `parent` are left, missing ones are created.
    pub fn enter(&mut self, parent: &Path, allow_existing_dirs: bool) -> Result<RawFd, Error> {
        let components: Vec<&OsStr> = parent.iter().collect();

        let common = self.dirs[1..]
            .iter()
            .zip(components.iter())
            .take_while(|(dir, name)| dir.file_name.as_os_str() == **name)
            .count();

        while self.dirs.len() > common + 1 {
            self.leave()?;
        }

        for name in &components[common..] {
            self.create_dir(name, None, allow_existing_dirs)?;
        }

        Ok(self.last_dir_fd())
    }

    /// Create the directory `file_name` inside the current directory and make it the new
    /// current directory. `mode` is applied when the directory is left.
    pub fn create_dir(
        &mut self,
        file_name: &OsStr,
        mode: Option<u32>,
        allow_existing_dirs: bool,
    ) -> Result<(), Error> {
        let parent = self.last_dir_fd();
        let path = self.path.join(file_name);

        if mode.is_some() && self.restored.contains(&path) {
            return Err(ArchiveError::malformed(format!(
                "duplicate directory entry {path:?}"
            ))
            .into());
        }

        let initial_mode = if mode.is_some() {
            WORKING_DIR_MODE
        } else {
            IMPLICIT_DIR_MODE
        };

        match mkdirat(parent, file_name, Mode::from_bits_truncate(initial_mode)) {
            Ok(()) => {
                self.created.insert(path.clone());
            }
            Err(err) if err.already_exists() => {
                if !(allow_existing_dirs || self.created.contains(&path)) {
                    return Err(errno_error(err, &path))
                        .with_context(|| format!("directory {path:?} already exists"));
                }
            }
            Err(err) => return Err(errno_error(err, &path)),
        }

        let dir = Dir::openat(
            parent,
            file_name,
            OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|err| errno_error(err, &path))
        .with_context(|| format!("failed to open directory {path:?}"))?;

        if mode.is_some() {
            self.restored.insert(path.clone());
        }
        self.path = path;
        self.dirs.push(RestoreDir {
            file_name: file_name.to_owned(),
            mode,
            dir,
        });
        Ok(())
    }

    /// Leave the current directory and apply its recorded permissions.
    fn leave(&mut self) -> Result<(), Error> {
        if self.dirs.len() <= 1 {
            return Ok(());
        }
        let dir = match self.dirs.pop() {
            Some(dir) => dir,
            None => return Ok(()),
        };

        if let Some(mode) = dir.mode {
            fchmod(dir.dir.as_raw_fd(), perms_from_mode(mode)?)
                .map_err(|err| errno_error(err, &self.path))
                .context("failed to apply directory permissions")?;
        }

        self.path.pop();
        Ok(())
    }

    /// Leave all directories, applying their permissions.
    pub fn finish(mut self) -> Result<(), Error> {
        while self.dirs.len() > 1 {
            self.leave()?;
        }
        Ok(())
    }
}
