//! Some common methods used by the archive and restore code.

use std::ffi::OsStr;
use std::path::{Component, Path};

use anyhow::{Context, Error};
use nix::sys::stat::Mode;

use crate::error::ArchiveError;
use crate::format::{Entry, EntryKind};

/// Get the permission bits as `nix::Mode`.
pub fn perms_from_mode(mode: u32) -> Result<Mode, Error> {
    Mode::from_bits(mode)
        .with_context(|| format!("mode contains illegal bits: 0x{:x} (0o{:o})", mode, mode))
}

/// Make sure a path read from a stream is relative, not empty and only consists of normal
/// components (no `.`, `..` or root).
pub fn assert_relative_path<S: AsRef<OsStr> + ?Sized>(path: &S) -> Result<(), Error> {
    assert_relative_path_do(Path::new(path))
}

fn assert_relative_path_do(path: &Path) -> Result<(), Error> {
    if path.as_os_str().is_empty() {
        return Err(ArchiveError::malformed("empty path in archive").into());
    }

    if !path.is_relative() {
        return Err(
            ArchiveError::malformed(format!("bad absolute file name in archive: {path:?}")).into(),
        );
    }

    // `Path::components` silently drops inner `.` components, check the raw bytes as well
    let bytes = std::os::unix::ffi::OsStrExt::as_bytes(path.as_os_str());
    let has_dot_component = bytes.split(|b| *b == b'/').any(|part| part == b".");

    if has_dot_component || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(
            ArchiveError::malformed(format!("invalid path component in archive: {path:?}"))
                .into(),
        );
    }

    Ok(())
}

#[rustfmt::skip]
fn symbolic_mode(c: u32, special: bool, special_x: u8, special_no_x: u8) -> [u8; 3] {
    [
        if 0 != c & 4 { b'r' } else { b'-' },
        if 0 != c & 2 { b'w' } else { b'-' },
        match (c & 1, special) {
            (0, false) => b'-',
            (0, true) => special_no_x,
            (_, false) => b'x',
            (_, true) => special_x,
        }
    ]
}

fn mode_string(entry: &Entry) -> String {
    // like `ls -l`, additionally we use a capital 'L' for hard links
    let mode = entry.mode();
    let type_char = match entry.kind() {
        EntryKind::Directory => 'd',
        EntryKind::File { .. } => '-',
        EntryKind::Symlink(_) => 'l',
        EntryKind::Hardlink(_) => 'L',
        EntryKind::Fifo => 'p',
    };

    let fmt_u = symbolic_mode((mode >> 6) & 7, 0 != mode & 0o4000, b's', b'S');
    let fmt_g = symbolic_mode((mode >> 3) & 7, 0 != mode & 0o2000, b's', b'S');
    let fmt_o = symbolic_mode(mode & 7, 0 != mode & 0o1000, b't', b'T');

    let mut out = String::with_capacity(10);
    out.push(type_char);
    for c in fmt_u.iter().chain(&fmt_g).chain(&fmt_o) {
        out.push(char::from(*c));
    }
    out
}

/// Format an entry like a line of `ls -l`: mode, size, path and link target.
pub fn format_single_line_entry(entry: &Entry) -> String {
    let mode_string = mode_string(entry);

    let link = match entry.kind() {
        EntryKind::Symlink(link) | EntryKind::Hardlink(link) => format!(" -> {:?}", link),
        _ => String::new(),
    };

    format!(
        "{} {:>12} {:?}{}",
        mode_string,
        entry.file_size(),
        entry.path(),
        link,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_relative_path() {
        assert!(assert_relative_path("a").is_ok());
        assert!(assert_relative_path("a/b/c").is_ok());
        assert!(assert_relative_path("a..b").is_ok());

        for bad in ["", "/a", "../a", "a/../b", "a/./b", "./a", ".", "a/.."] {
            let err = assert_relative_path(bad).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<ArchiveError>(),
                    Some(ArchiveError::MalformedStream(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_perms_from_mode() {
        assert_eq!(perms_from_mode(0o4755).unwrap().bits(), 0o4755);
        assert!(perms_from_mode(0o100644).is_err());
    }

    #[test]
    fn test_format_single_line_entry() {
        let entry = Entry::new("thing/bar", 0o644, EntryKind::File { size: 9 });
        assert_eq!(
            format_single_line_entry(&entry),
            "-rw-r--r--            9 \"thing/bar\""
        );

        let entry = Entry::new("tmp", 0o1777, EntryKind::Directory);
        assert_eq!(
            format_single_line_entry(&entry),
            "drwxrwxrwt            0 \"tmp\""
        );

        let entry = Entry::new("hardlink", 0o4754, EntryKind::Hardlink("thing/bar".into()));
        assert_eq!(
            format_single_line_entry(&entry),
            "Lrwsr-xr--            0 \"hardlink\" -> \"thing/bar\""
        );

        let entry = Entry::new("pipe", 0o2640, EntryKind::Fifo);
        assert_eq!(
            format_single_line_entry(&entry),
            "prw-r-S---            0 \"pipe\""
        );
    }
}
