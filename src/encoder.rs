//! Sequential stream encoder.

use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{bail, Context, Error};

use crate::format::{self, Entry, EntryKind, MAX_PATH_LEN, MODE_PERMISSION_MASK};

/// Writes entries to an output stream.
///
/// The encoder does not check ordering constraints; callers are expected to
/// emit directories before their contents and hardlinks after their target.
pub struct Encoder<W: Write> {
    output: W,
    position: u64,
}

impl<W: Write> Encoder<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            position: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Flush the output and hand it back.
    pub fn finish(mut self) -> Result<W, Error> {
        self.output.flush()?;
        Ok(self.output)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.output.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn write_header(&mut self, kind: u8, path: &Path, mode: u32) -> Result<(), Error> {
        let path = path.as_os_str().as_bytes();
        let path_len = checked_path_len(path).context("bad entry path")?;

        let mut header = [0u8; format::HEADER_SIZE];
        header[0] = kind;
        header[1..5].copy_from_slice(&(mode & MODE_PERMISSION_MASK).to_le_bytes());
        header[5..9].copy_from_slice(&path_len.to_le_bytes());

        self.write_all(&header)?;
        self.write_all(path)?;
        Ok(())
    }

    fn write_target(&mut self, target: &Path) -> Result<(), Error> {
        let target = target.as_os_str().as_bytes();
        let target_len = checked_path_len(target).context("bad link target")?;
        self.write_all(&target_len.to_le_bytes())?;
        self.write_all(target)?;
        Ok(())
    }

    pub fn add_directory(&mut self, path: &Path, mode: u32) -> Result<(), Error> {
        self.write_header(format::KIND_DIRECTORY, path, mode)
    }

    pub fn add_fifo(&mut self, path: &Path, mode: u32) -> Result<(), Error> {
        self.write_header(format::KIND_FIFO, path, mode)
    }

    pub fn add_symlink(&mut self, path: &Path, mode: u32, target: &Path) -> Result<(), Error> {
        self.write_header(format::KIND_SYMLINK, path, mode)?;
        self.write_target(target)
    }

    pub fn add_hardlink(&mut self, path: &Path, mode: u32, target: &Path) -> Result<(), Error> {
        self.write_header(format::KIND_HARDLINK, path, mode)?;
        self.write_target(target)
    }

    /// Start a regular file entry of `size` bytes. Exactly `size` bytes have to be written to
    /// the returned [`FileContents`] before calling [`FileContents::finish`].
    pub fn create_file<'a>(
        &'a mut self,
        path: &Path,
        mode: u32,
        size: u64,
    ) -> Result<FileContents<'a, W>, Error> {
        self.write_header(format::KIND_FILE, path, mode)?;
        self.write_all(&size.to_le_bytes())?;
        Ok(FileContents {
            encoder: self,
            remaining: size,
        })
    }

    /// Encode a complete entry. `payload` is required for regular files and must provide at
    /// least as many bytes as the entry's size, it is ignored for all other kinds.
    pub fn encode(&mut self, entry: &Entry, payload: Option<&mut dyn Read>) -> Result<(), Error> {
        let path = entry.path();
        let mode = entry.mode();
        match entry.kind() {
            EntryKind::Directory => self.add_directory(path, mode),
            EntryKind::Fifo => self.add_fifo(path, mode),
            EntryKind::Symlink(target) => self.add_symlink(path, mode, target),
            EntryKind::Hardlink(target) => self.add_hardlink(path, mode, target),
            EntryKind::File { size } => {
                let payload = match payload {
                    Some(payload) => payload,
                    None => bail!("missing payload for file entry {path:?}"),
                };
                let mut out = self.create_file(path, mode, *size)?;
                io::copy(&mut payload.take(*size), &mut out)
                    .with_context(|| format!("failed to encode contents of {path:?}"))?;
                out.finish()
            }
        }
    }
}

fn checked_path_len(path: &[u8]) -> Result<u32, Error> {
    match u32::try_from(path.len()) {
        Ok(len) if len <= MAX_PATH_LEN => Ok(len),
        _ => bail!(
            "path too long ({} bytes, limit is {})",
            path.len(),
            MAX_PATH_LEN
        ),
    }
}

/// Payload writer of a regular file entry.
pub struct FileContents<'a, W: Write> {
    encoder: &'a mut Encoder<W>,
    remaining: u64,
}

impl<'a, W: Write> FileContents<'a, W> {
    /// Bytes still expected for this entry.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Make sure the announced size was written completely.
    pub fn finish(self) -> Result<(), Error> {
        if self.remaining != 0 {
            bail!(
                "file entry is missing {} bytes of contents",
                self.remaining
            );
        }
        Ok(())
    }
}

impl<'a, W: Write> Write for FileContents<'a, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "file entry contents exceed the announced size",
            ));
        }
        let len = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let written = self.encoder.output.write(&buf[..len])?;
        self.encoder.position += written as u64;
        self.remaining -= written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.output.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_layout() {
        let mut encoder = Encoder::new(Vec::new());
        encoder.add_directory(Path::new("a/b"), 0o40755).unwrap();
        assert_eq!(encoder.position(), 12);
        let data = encoder.finish().unwrap();
        assert_eq!(
            data,
            [format::KIND_DIRECTORY, 0xed, 0x01, 0, 0, 3, 0, 0, 0, b'a', b'/', b'b']
        );
    }

    #[test]
    fn test_file_size_is_enforced() {
        let mut encoder = Encoder::new(Vec::new());
        let mut out = encoder.create_file(Path::new("f"), 0o644, 4).unwrap();
        out.write_all(b"abc").unwrap();
        assert_eq!(out.remaining(), 1);
        assert!(out.write_all(b"de").is_err());
        out.finish().unwrap();

        let mut encoder = Encoder::new(Vec::new());
        let out = encoder.create_file(Path::new("f"), 0o644, 4).unwrap();
        assert!(out.finish().is_err());
    }

    #[test]
    fn test_encode_requires_payload() {
        let mut encoder = Encoder::new(Vec::new());
        let entry = Entry::new("f", 0o644, EntryKind::File { size: 1 });
        assert!(encoder.encode(&entry, None).is_err());

        let mut short: &[u8] = b"";
        assert!(encoder.encode(&entry, Some(&mut short)).is_err());
    }

    #[test]
    fn test_path_limit() {
        let mut encoder = Encoder::new(Vec::new());
        let long = "x".repeat(MAX_PATH_LEN as usize + 1);
        assert!(encoder.add_fifo(Path::new(&long), 0o644).is_err());
    }
}
