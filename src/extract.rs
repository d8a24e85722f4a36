//! Code for extraction of stream contents onto the file system.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use bitflags::bitflags;
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::{FchmodatFlags, Mode};
use nix::unistd::{LinkatFlags, UnlinkatFlags};

use proxmox_io::sparse_copy;

use crate::decoder::Decoder;
use crate::dir_stack::DirStack;
use crate::error::{errno_error, ArchiveError};
use crate::format::{Entry, EntryKind};
use crate::tools::{assert_relative_path, perms_from_mode};

bitflags! {
    #[derive(Default)]
    pub struct OverwriteFlags: u8 {
        /// Overwrite existing entries file content
        const FILE = 0x1;
        /// Overwrite existing entry with symlink
        const SYMLINK = 0x2;
        /// Overwrite existing entry with hardlink
        const HARDLINK = 0x4;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UnarchiveOptions {
    /// Reuse directories which already exist in the destination.
    pub allow_existing_dirs: bool,
    /// Which kinds of non-directory objects may replace existing ones.
    pub overwrite_flags: OverwriteFlags,
}

/// Restore a stream below `root`, which has to be an existing, writable directory.
pub fn unarchive<R: Read>(reader: R, root: &Path) -> Result<(), Error> {
    extract_archive(reader, root, UnarchiveOptions::default(), |_| ())
}

/// Restore a stream below `destination`, calling `callback` with the path of each entry before
/// it is materialized.
///
/// Extraction stops at the first error. Everything restored up to that point stays on disk.
/// Failures while creating an object carry a [`RestoreContext`].
pub fn extract_archive<R, F>(
    reader: R,
    destination: &Path,
    options: UnarchiveOptions,
    mut callback: F,
) -> Result<(), Error>
where
    R: Read,
    F: FnMut(&Path),
{
    let root = Dir::open(
        destination,
        OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|err| errno_error(err, destination))
    .with_context(|| format!("unable to open target directory {destination:?}"))?;

    let mut decoder = Decoder::new(reader);
    let mut extractor = Extractor::new(root, options);

    while let Some(entry) = decoder.next_entry()? {
        callback(entry.path());
        extractor
            .extract_entry(&entry, &mut decoder)
            .with_context(|| format!("error at entry {:?}", entry.path()))?;
    }

    extractor
        .dir_stack
        .finish()
        .context(RestoreContext::LeaveDirectory)?;

    log::debug!(
        "restored {} entries to {destination:?}",
        extractor.entry_counter
    );

    Ok(())
}

/// Attached as [context](anyhow::Context) to errors of [`extract_archive`], telling which step
/// of the restore failed.
///
/// ```
/// # use anyhow::{anyhow, Error};
/// # use dirstream::RestoreContext;
/// let err = anyhow!("oh noes!").context(RestoreContext::ExtractFile);
///
/// assert_eq!(err.downcast_ref::<RestoreContext>(), Some(&RestoreContext::ExtractFile));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestoreContext {
    EnterDirectory,
    LeaveDirectory,
    ExtractSymlink,
    ExtractHardlink,
    ExtractFifo,
    ExtractFile,
}

impl RestoreContext {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        use RestoreContext::*;

        match *self {
            EnterDirectory => "failed to enter directory",
            LeaveDirectory => "failed to leave directory",
            ExtractSymlink => "failed to extract symlink",
            ExtractHardlink => "failed to extract hardlink",
            ExtractFifo => "failed to extract named pipe",
            ExtractFile => "failed to extract file",
        }
    }
}

impl std::fmt::Display for RestoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Extractor {
    allow_existing_dirs: bool,
    overwrite_flags: OverwriteFlags,
    dir_stack: DirStack,
    /// Paths of regular files restored so far, the only valid hardlink targets.
    restored: HashSet<PathBuf>,
    entry_counter: usize,
}

impl Extractor {
    fn new(root: Dir, options: UnarchiveOptions) -> Self {
        Self {
            allow_existing_dirs: options.allow_existing_dirs,
            overwrite_flags: options.overwrite_flags,
            dir_stack: DirStack::new(root),
            restored: HashSet::new(),
            entry_counter: 0,
        }
    }

    fn extract_entry<R: Read>(
        &mut self,
        entry: &Entry,
        decoder: &mut Decoder<R>,
    ) -> Result<(), Error> {
        let path = entry.path();
        assert_relative_path(path)?;

        let file_name = path
            .file_name()
            .ok_or_else(|| ArchiveError::malformed(format!("entry without file name: {path:?}")))?;
        let parent = path.parent().unwrap_or_else(|| Path::new(""));

        self.entry_counter += 1;

        match entry.kind() {
            EntryKind::Directory => self
                .enter_directory(parent, file_name, entry.mode())
                .context(RestoreContext::EnterDirectory),
            EntryKind::Symlink(target) => self
                .extract_symlink(path, parent, file_name, target)
                .context(RestoreContext::ExtractSymlink),
            EntryKind::Hardlink(target) => self
                .extract_hardlink(path, parent, file_name, target)
                .context(RestoreContext::ExtractHardlink),
            EntryKind::Fifo => self
                .extract_fifo(path, parent, file_name, entry.mode())
                .context(RestoreContext::ExtractFifo),
            EntryKind::File { size } => {
                let overwrite = self.overwrite_flags.contains(OverwriteFlags::FILE);
                let mode = entry.mode();
                match decoder.contents() {
                    Some(mut contents) => self.extract_file(
                        path,
                        parent,
                        file_name,
                        mode,
                        *size,
                        &mut contents,
                        overwrite,
                    ),
                    None if *size == 0 => self.extract_file(
                        path,
                        parent,
                        file_name,
                        mode,
                        0,
                        &mut io::empty(),
                        overwrite,
                    ),
                    None => Err(format_err!(
                        "found regular file entry without contents in archive"
                    )),
                }
                .context(RestoreContext::ExtractFile)
            }
        }
    }

    fn parent_fd(&mut self, parent: &Path) -> Result<RawFd, Error> {
        self.dir_stack
            .enter(parent, self.allow_existing_dirs)
            .context("failed to get parent directory file descriptor")
    }

    fn enter_directory(&mut self, parent: &Path, file_name: &OsStr, mode: u32) -> Result<(), Error> {
        self.parent_fd(parent)?;
        self.dir_stack
            .create_dir(file_name, Some(mode), self.allow_existing_dirs)
    }

    fn extract_symlink(
        &mut self,
        path: &Path,
        parent: &Path,
        file_name: &OsStr,
        link: &Path,
    ) -> Result<(), Error> {
        let parent_fd = self.parent_fd(parent)?;

        match nix::unistd::symlinkat(link, Some(parent_fd), file_name) {
            Ok(()) => {}
            Err(Errno::EEXIST) if self.overwrite_flags.contains(OverwriteFlags::SYMLINK) => {
                // Never unlink directories
                let flag = UnlinkatFlags::NoRemoveDir;
                nix::unistd::unlinkat(Some(parent_fd), file_name, flag)
                    .map_err(|err| errno_error(err, path))?;
                nix::unistd::symlinkat(link, Some(parent_fd), file_name)
                    .map_err(|err| errno_error(err, path))?;
            }
            Err(err) => return Err(errno_error(err, path)),
        }

        Ok(())
    }

    fn extract_hardlink(
        &mut self,
        path: &Path,
        parent: &Path,
        file_name: &OsStr,
        link: &Path,
    ) -> Result<(), Error> {
        assert_relative_path(link)?;

        if !self.restored.contains(link) {
            return Err(ArchiveError::DanglingLink {
                path: path.to_owned(),
                target: link.to_owned(),
            }
            .into());
        }

        let parent_fd = self.parent_fd(parent)?;
        let root = self.dir_stack.root_dir_fd();
        let file_name = Path::new(file_name);
        let dolink = || {
            nix::unistd::linkat(
                Some(root),
                link,
                Some(parent_fd),
                file_name,
                LinkatFlags::NoSymlinkFollow,
            )
        };

        match dolink() {
            Ok(()) => {}
            Err(Errno::EEXIST) if self.overwrite_flags.contains(OverwriteFlags::HARDLINK) => {
                // Never unlink directories
                let flag = UnlinkatFlags::NoRemoveDir;
                nix::unistd::unlinkat(Some(parent_fd), file_name, flag)
                    .map_err(|err| errno_error(err, path))?;
                dolink().map_err(|err| errno_error(err, path))?;
            }
            Err(err) => return Err(errno_error(err, path)),
        }

        self.restored.insert(path.to_owned());
        Ok(())
    }

    fn extract_fifo(
        &mut self,
        path: &Path,
        parent: &Path,
        file_name: &OsStr,
        mode: u32,
    ) -> Result<(), Error> {
        let parent_fd = self.parent_fd(parent)?;

        nix::unistd::mkfifoat(Some(parent_fd), file_name, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|err| errno_error(err, path))
            .context("failed to create named pipe")?;

        nix::sys::stat::fchmodat(
            Some(parent_fd),
            file_name,
            perms_from_mode(mode)?,
            FchmodatFlags::FollowSymlink,
        )
        .map_err(|err| errno_error(err, path))
        .context("failed to change named pipe permissions")
    }

    #[allow(clippy::too_many_arguments)]
    fn extract_file(
        &mut self,
        path: &Path,
        parent: &Path,
        file_name: &OsStr,
        mode: u32,
        size: u64,
        contents: &mut dyn Read,
        overwrite: bool,
    ) -> Result<(), Error> {
        let parent_fd = self.parent_fd(parent)?;

        let mut oflags = OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW;
        if overwrite {
            oflags |= OFlag::O_TRUNC;
        } else {
            oflags |= OFlag::O_EXCL;
        }
        let fd = nix::fcntl::openat(parent_fd, file_name, oflags, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|err| errno_error(err, path))
            .with_context(|| format!("failed to create file {file_name:?}"))?;
        let mut file = unsafe { File::from_raw_fd(fd) };

        let result = sparse_copy(&mut *contents, &mut file).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                ArchiveError::malformed(format!("truncated contents of {path:?}")).into()
            } else {
                Error::from(err).context("failed to copy file contents")
            }
        })?;

        if size != result.written {
            bail!(
                "extracted {} bytes of a file of {} bytes",
                result.written,
                size
            );
        }

        if result.seeked_last {
            while match nix::unistd::ftruncate(file.as_raw_fd(), size as i64) {
                Ok(_) => false,
                Err(errno) if errno == Errno::EINTR => true,
                Err(err) => return Err(errno_error(err, path)).context("error setting file size"),
            } {}
        }

        nix::sys::stat::fchmod(file.as_raw_fd(), perms_from_mode(mode)?)
            .map_err(|err| errno_error(err, path))
            .context("failed to change file permissions")?;

        self.restored.insert(path.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    use crate::encoder::Encoder;

    fn stream(entries: Vec<(Entry, Vec<u8>)>) -> Vec<u8> {
        let mut encoder = Encoder::new(Vec::new());
        for (entry, payload) in entries {
            let mut payload = &payload[..];
            encoder
                .encode(&entry, Some(&mut payload as &mut dyn Read))
                .unwrap();
        }
        encoder.finish().unwrap()
    }

    fn file(path: &str, mode: u32, data: &[u8]) -> (Entry, Vec<u8>) {
        let size = data.len() as u64;
        (Entry::new(path, mode, EntryKind::File { size }), data.to_vec())
    }

    fn other(path: &str, mode: u32, kind: EntryKind) -> (Entry, Vec<u8>) {
        (Entry::new(path, mode, kind), Vec::new())
    }

    fn archive_error(err: &Error) -> Option<&ArchiveError> {
        err.downcast_ref::<ArchiveError>()
    }

    #[test]
    fn test_restore_kinds() {
        let data = stream(vec![
            other("dir", 0o750, EntryKind::Directory),
            file("dir/file", 0o640, b"hello"),
            other("dir/link", 0o644, EntryKind::Hardlink("dir/file".into())),
            other("pipe", 0o620, EntryKind::Fifo),
            other("sym", 0o777, EntryKind::Symlink("dir/file".into())),
            // parents without an entry of their own are created on demand
            file("implicit/sub/zeros", 0o600, &[0u8; 8192]),
        ]);

        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let mut seen = Vec::new();
        extract_archive(&data[..], root, UnarchiveOptions::default(), |path| {
            seen.push(path.to_owned())
        })
        .unwrap();
        assert_eq!(seen.len(), 6);

        let mode = |p: &str| fs::symlink_metadata(root.join(p)).unwrap().mode() & 0o7777;
        assert_eq!(mode("dir"), 0o750);
        assert_eq!(mode("dir/file"), 0o640);
        assert_eq!(mode("pipe"), 0o620);
        assert_eq!(fs::read(root.join("dir/file")).unwrap(), b"hello");
        assert_eq!(
            fs::metadata(root.join("dir/file")).unwrap().ino(),
            fs::metadata(root.join("dir/link")).unwrap().ino()
        );
        assert_eq!(
            fs::read_link(root.join("sym")).unwrap(),
            Path::new("dir/file")
        );
        assert_eq!(
            fs::read(root.join("implicit/sub/zeros")).unwrap(),
            vec![0u8; 8192]
        );
    }

    #[test]
    fn test_read_only_directory_is_populated() {
        let data = stream(vec![
            other("ro", 0o500, EntryKind::Directory),
            file("ro/file", 0o400, b"x"),
        ]);

        let tmp = tempfile::tempdir().unwrap();
        unarchive(&data[..], tmp.path()).unwrap();

        let ro = tmp.path().join("ro");
        assert_eq!(fs::metadata(&ro).unwrap().permissions().mode() & 0o7777, 0o500);
        assert_eq!(fs::read(ro.join("file")).unwrap(), b"x");

        // allow the temporary directory to be cleaned up
        fs::set_permissions(&ro, fs::Permissions::from_mode(0o700)).unwrap();
    }

    #[test]
    fn test_dangling_hardlink() {
        let data = stream(vec![other(
            "link",
            0o644,
            EntryKind::Hardlink("missing".into()),
        )]);

        let tmp = tempfile::tempdir().unwrap();
        let err = unarchive(&data[..], tmp.path()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RestoreContext>(),
            Some(&RestoreContext::ExtractHardlink)
        );
        match archive_error(&err) {
            Some(ArchiveError::DanglingLink { path, target }) => {
                assert_eq!(path, Path::new("link"));
                assert_eq!(target, Path::new("missing"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unsafe_paths_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir(&root).unwrap();

        for path in ["../escape", "/abs", "a/../../escape"] {
            let data = stream(vec![file(path, 0o644, b"x")]);
            let err = unarchive(&data[..], &root).unwrap_err();
            assert!(
                matches!(archive_error(&err), Some(ArchiveError::MalformedStream(_))),
                "{path:?} was accepted"
            );
        }

        let data = stream(vec![
            file("file", 0o644, b"x"),
            other("link", 0o644, EntryKind::Hardlink("../file".into())),
        ]);
        let err = unarchive(&data[..], &root).unwrap_err();
        assert!(matches!(
            archive_error(&err),
            Some(ArchiveError::MalformedStream(_))
        ));

        assert!(!tmp.path().join("escape").exists());
    }

    #[test]
    fn test_symlinked_directory_is_not_followed() {
        let outside = tempfile::tempdir().unwrap();
        let data = stream(vec![
            other(
                "escape",
                0o777,
                EntryKind::Symlink(outside.path().to_owned()),
            ),
            file("escape/file", 0o644, b"x"),
        ]);

        let tmp = tempfile::tempdir().unwrap();
        let options = UnarchiveOptions {
            allow_existing_dirs: true,
            ..Default::default()
        };
        assert!(extract_archive(&data[..], tmp.path(), options, |_| ()).is_err());
        assert!(!outside.path().join("file").exists());
    }

    #[test]
    fn test_truncated_payload() {
        let data = stream(vec![file("file", 0o644, b"hello world")]);

        let tmp = tempfile::tempdir().unwrap();
        let err = unarchive(&data[..data.len() - 3], tmp.path()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RestoreContext>(),
            Some(&RestoreContext::ExtractFile)
        );
        assert!(matches!(
            archive_error(&err),
            Some(ArchiveError::MalformedStream(_))
        ));
    }

    #[test]
    fn test_existing_objects() {
        let data = stream(vec![
            other("dir", 0o755, EntryKind::Directory),
            file("dir/file", 0o644, b"new"),
            other("dir/sym", 0o777, EntryKind::Symlink("file".into())),
        ]);

        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("dir")).unwrap();
        fs::write(root.join("dir/file"), b"old contents").unwrap();
        std::os::unix::fs::symlink("elsewhere", root.join("dir/sym")).unwrap();

        let err = unarchive(&data[..], root).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RestoreContext>(),
            Some(&RestoreContext::EnterDirectory)
        );

        let options = UnarchiveOptions {
            allow_existing_dirs: true,
            ..Default::default()
        };
        let err = extract_archive(&data[..], root, options, |_| ()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RestoreContext>(),
            Some(&RestoreContext::ExtractFile)
        );

        let options = UnarchiveOptions {
            allow_existing_dirs: true,
            overwrite_flags: OverwriteFlags::FILE | OverwriteFlags::SYMLINK,
        };
        extract_archive(&data[..], root, options, |_| ()).unwrap();
        assert_eq!(fs::read(root.join("dir/file")).unwrap(), b"new");
        assert_eq!(
            fs::read_link(root.join("dir/sym")).unwrap(),
            Path::new("file")
        );
    }

    #[test]
    fn test_missing_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let err = unarchive(&b""[..], &tmp.path().join("missing")).unwrap_err();
        assert!(matches!(
            archive_error(&err),
            Some(ArchiveError::NotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_directory_entry() {
        let data = stream(vec![
            other("a", 0o755, EntryKind::Directory),
            other("a", 0o700, EntryKind::Directory),
        ]);

        let tmp = tempfile::tempdir().unwrap();
        let err = unarchive(&data[..], tmp.path()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RestoreContext>(),
            Some(&RestoreContext::EnterDirectory)
        );
        assert!(matches!(
            archive_error(&err),
            Some(ArchiveError::MalformedStream(_))
        ));
        let mode = fs::metadata(tmp.path().join("a")).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_read_only_destination() {
        if nix::unistd::geteuid().is_root() {
            // permission checks do not apply
            return;
        }

        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ro");
        fs::create_dir(&root).unwrap();
        fs::set_permissions(&root, fs::Permissions::from_mode(0o555)).unwrap();

        let cases = [
            (
                other("sym", 0o777, EntryKind::Symlink("target".into())),
                RestoreContext::ExtractSymlink,
            ),
            (file("file", 0o644, b"x"), RestoreContext::ExtractFile),
            (other("pipe", 0o644, EntryKind::Fifo), RestoreContext::ExtractFifo),
            (other("dir", 0o755, EntryKind::Directory), RestoreContext::EnterDirectory),
        ];

        for (entry, context) in cases {
            let data = stream(vec![entry]);
            let err = unarchive(&data[..], &root).unwrap_err();
            assert_eq!(err.downcast_ref::<RestoreContext>(), Some(&context));
            match archive_error(&err) {
                Some(ArchiveError::Access { .. }) => (),
                other => panic!("{context}: unexpected error {other:?}"),
            }
        }

        fs::set_permissions(&root, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
