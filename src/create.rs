//! Archive a directory tree into a stream.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use nix::errno::Errno;

use proxmox_io::vec;

use crate::encoder::Encoder;
use crate::error::{io_error, ArchiveError};
use crate::hardlinks::HardLinkTracker;
use crate::walk::{FileKind, WalkEntry, Walker};

const FILE_COPY_BUFFER_SIZE: usize = 4 * 1024 * 1024;

struct Archiver<W: Write> {
    encoder: Encoder<W>,
    /// Path of the entry currently being archived, relative to the root.
    path: PathBuf,
    hardlinks: HardLinkTracker,
    file_copy_buffer: Vec<u8>,
    entry_counter: usize,
}

/// Archive everything below `source` into `writer`.
pub fn archive<W: Write>(source: &Path, writer: W) -> Result<(), Error> {
    create_archive(source, writer, |_| Ok(()))
}

/// Archive everything below `source` into `writer`, calling `callback` with the relative path
/// of every entry before it is written. An error returned by the callback aborts the run.
///
/// On error the stream is left incomplete and has to be discarded by the caller.
pub fn create_archive<W, F>(source: &Path, writer: W, mut callback: F) -> Result<(), Error>
where
    W: Write,
    F: FnMut(&Path) -> Result<(), Error>,
{
    let walker = Walker::new(source)?;

    let mut archiver = Archiver {
        encoder: Encoder::new(writer),
        path: PathBuf::new(),
        hardlinks: HardLinkTracker::new(),
        file_copy_buffer: vec::undefined(FILE_COPY_BUFFER_SIZE),
        entry_counter: 0,
    };

    for entry in walker {
        let entry = entry?;
        archiver.path = entry.relative_path().to_owned();
        callback(&archiver.path)?;
        archiver
            .add_entry(&entry)
            .map_err(|err| archiver.wrap_err(err))?;
    }

    let entries = archiver.entry_counter;
    let hardlinks = archiver.hardlinks.len();
    let encoder = archiver.encoder;
    let size = encoder.position();
    encoder.finish().context("failed to flush archive stream")?;

    log::debug!(
        "archived {entries} entries ({hardlinks} multiply linked files) from {source:?}, {size} bytes"
    );

    Ok(())
}

impl<W: Write> Archiver<W> {
    /// Typed errors already name their path, everything else gets the current path attached.
    fn wrap_err(&self, err: Error) -> Error {
        if err.downcast_ref::<ArchiveError>().is_some() {
            err
        } else {
            err.context(format!("error at {:?}", self.path))
        }
    }

    fn add_entry(&mut self, entry: &WalkEntry) -> Result<(), Error> {
        let mode = entry.mode();
        self.entry_counter += 1;

        match entry.kind() {
            FileKind::Directory => self.encoder.add_directory(&self.path, mode),
            FileKind::Fifo => self.encoder.add_fifo(&self.path, mode),
            FileKind::Symlink => {
                let target = std::fs::read_link(entry.path())
                    .map_err(|err| io_error(err, &self.path))?;
                self.encoder.add_symlink(&self.path, mode, &target)
            }
            FileKind::File => {
                let seen = self.hardlinks.observe(&self.path, entry.metadata());
                if !seen.first_seen {
                    log::debug!("{:?} is a hardlink to {:?}", self.path, seen.canonical_path);
                    return self
                        .encoder
                        .add_hardlink(&self.path, mode, seen.canonical_path);
                }

                let file_size = entry.metadata().size();
                self.add_regular_file(entry.path(), mode, file_size)
            }
        }
    }

    /// Open a file for reading without following symlinks, using `O_NOATIME` if we are allowed
    /// to.
    fn open_file(&self, path: &Path) -> Result<File, Error> {
        let mut noatime = libc::O_NOATIME;
        loop {
            return match std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NOFOLLOW | libc::O_NOCTTY | noatime)
                .open(path)
            {
                Ok(file) => Ok(file),
                Err(err) if err.raw_os_error() == Some(Errno::EPERM as i32) && noatime != 0 => {
                    // Retry without O_NOATIME:
                    noatime = 0;
                    continue;
                }
                Err(err) => Err(io_error(err, &self.path)),
            };
        }
    }

    fn report_file_shrunk_while_reading(&self) {
        log::warn!(
            "warning: file size shrunk while reading: {:?}, file will be padded with zeros!",
            self.path,
        );
    }

    fn report_file_grew_while_reading(&self) {
        log::warn!(
            "warning: file size increased while reading: {:?}, file will be truncated!",
            self.path,
        );
    }

    fn add_regular_file(&mut self, path: &Path, mode: u32, file_size: u64) -> Result<(), Error> {
        let mut file = self.open_file(path)?;

        let mut remaining = file_size;
        let mut grew = false;
        let mut out = self.encoder.create_file(&self.path, mode, file_size)?;
        loop {
            let mut got = match file.read(&mut self.file_copy_buffer[..]) {
                Ok(0) => break,
                Ok(got) => got,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(io_error(err, &self.path)),
            };
            if got as u64 > remaining {
                grew = true;
                got = remaining as usize;
            }
            out.write_all(&self.file_copy_buffer[..got])?;
            remaining -= got as u64;
            // keep reading after the last expected byte to notice files which kept growing
            if grew {
                break;
            }
        }

        let shrunk = remaining > 0;
        if shrunk {
            let to_zero = remaining.min(self.file_copy_buffer.len() as u64) as usize;
            vec::clear(&mut self.file_copy_buffer[..to_zero]);
            while remaining != 0 {
                let fill = remaining.min(to_zero as u64) as usize;
                out.write_all(&self.file_copy_buffer[..fill])?;
                remaining -= fill as u64;
            }
        }
        out.finish()?;

        if grew {
            self.report_file_grew_while_reading();
        } else if shrunk {
            self.report_file_shrunk_while_reading();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use anyhow::bail;

    use crate::decoder::Decoder;
    use crate::format::{Entry, EntryKind};

    #[test]
    fn test_archive_stream_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("thing")).unwrap();
        fs::write(root.join("thing/bar"), b"contents").unwrap();
        fs::hard_link(root.join("thing/bar"), root.join("hardlink")).unwrap();
        std::os::unix::fs::symlink("thing/bar", root.join("symlink")).unwrap();

        let mut stream = Vec::new();
        archive(root, &mut stream).unwrap();

        let entries: Vec<Entry> = Decoder::new(&stream[..]).map(Result::unwrap).collect();
        let dir_mode = fs::metadata(root.join("thing")).unwrap().mode() & 0o7777;
        let file_mode = fs::metadata(root.join("thing/bar")).unwrap().mode() & 0o7777;
        let link_mode = fs::symlink_metadata(root.join("symlink")).unwrap().mode() & 0o7777;

        // "hardlink" sorts before "thing", so it carries the contents
        assert_eq!(
            entries,
            vec![
                Entry::new("hardlink", file_mode, EntryKind::File { size: 8 }),
                Entry::new("symlink", link_mode, EntryKind::Symlink("thing/bar".into())),
                Entry::new("thing", dir_mode, EntryKind::Directory),
                Entry::new("thing/bar", file_mode, EntryKind::Hardlink("hardlink".into())),
            ]
        );
    }

    #[test]
    fn test_callback_can_abort() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a"), b"").unwrap();
        fs::write(tmp.path().join("b"), b"").unwrap();

        let mut stream = Vec::new();
        let err = create_archive(tmp.path(), &mut stream, |path| {
            if path == Path::new("b") {
                bail!("stop at {path:?}");
            }
            Ok(())
        })
        .unwrap_err();
        assert!(err.to_string().contains("stop at"));

        // only the first entry made it into the stream
        let entries: Vec<Entry> = Decoder::new(&stream[..]).map(Result::unwrap).collect();
        assert_eq!(entries.len(), 1);
    }
}
