//! Sequential stream decoder.

use std::ffi::OsString;
use std::io::{self, Read};
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use anyhow::Error;

use crate::error::ArchiveError;
use crate::format::{self, Entry, EntryKind, MAX_PATH_LEN, MODE_PERMISSION_MASK};

/// Reads entries from a stream in order.
///
/// After [`next_entry`](Decoder::next_entry) returned a regular file, its contents can be read
/// via [`contents`](Decoder::contents). Contents which are not read are skipped when the next
/// entry is requested.
pub struct Decoder<R: Read> {
    input: R,
    payload_remaining: u64,
    position: u64,
    finished: bool,
}

impl<R: Read> Decoder<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            payload_remaining: 0,
            position: 0,
            finished: false,
        }
    }

    /// Number of bytes consumed from the input so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reader for the payload of the current regular file entry, `None` if the current entry
    /// has no (remaining) contents.
    pub fn contents(&mut self) -> Option<Contents<'_, R>> {
        if self.payload_remaining == 0 {
            return None;
        }
        Some(Contents { decoder: self })
    }

    /// Decode the next entry. Returns `Ok(None)` when the input ends on an entry boundary.
    pub fn next_entry(&mut self) -> Result<Option<Entry>, Error> {
        if self.finished {
            return Ok(None);
        }
        match self.read_entry() {
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Ok(Some(entry)) => Ok(Some(entry)),
            Err(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }

    fn read_entry(&mut self) -> Result<Option<Entry>, Error> {
        self.skip_payload()?;

        let mut kind = [0u8; 1];
        loop {
            match self.input.read(&mut kind) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        self.position += 1;
        let kind = kind[0];

        let mut header = [0u8; format::HEADER_SIZE - 1];
        self.read_exact(&mut header, "entry header")?;
        let mode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let path_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if mode & !MODE_PERMISSION_MASK != 0 {
            return Err(ArchiveError::malformed(format!(
                "mode contains illegal bits: 0o{mode:o}"
            ))
            .into());
        }

        let path = self.read_path(path_len, "entry path")?;

        let kind = match kind {
            format::KIND_DIRECTORY => EntryKind::Directory,
            format::KIND_FIFO => EntryKind::Fifo,
            format::KIND_FILE => {
                let mut size = [0u8; 8];
                self.read_exact(&mut size, "file size")?;
                let size = u64::from_le_bytes(size);
                self.payload_remaining = size;
                EntryKind::File { size }
            }
            format::KIND_SYMLINK => EntryKind::Symlink(self.read_target()?),
            format::KIND_HARDLINK => EntryKind::Hardlink(self.read_target()?),
            other => {
                return Err(
                    ArchiveError::malformed(format!("unknown entry type 0x{other:02x}")).into(),
                )
            }
        };

        Ok(Some(Entry { path, mode, kind }))
    }

    fn read_target(&mut self) -> Result<PathBuf, Error> {
        let mut len = [0u8; 4];
        self.read_exact(&mut len, "link target")?;
        self.read_path(u32::from_le_bytes(len), "link target")
    }

    fn read_path(&mut self, len: u32, what: &str) -> Result<PathBuf, Error> {
        if len > MAX_PATH_LEN {
            return Err(ArchiveError::malformed(format!(
                "{what} too long ({len} bytes, limit is {MAX_PATH_LEN})"
            ))
            .into());
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf, what)?;
        Ok(PathBuf::from(OsString::from_vec(buf)))
    }

    fn read_exact(&mut self, buf: &mut [u8], what: &str) -> Result<(), Error> {
        match self.input.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ArchiveError::malformed(format!("truncated {what}")).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn skip_payload(&mut self) -> Result<(), Error> {
        if self.payload_remaining == 0 {
            return Ok(());
        }
        let expected = self.payload_remaining;
        let skipped = io::copy(&mut (&mut self.input).take(expected), &mut io::sink())?;
        self.position += skipped;
        self.payload_remaining -= skipped;
        if skipped != expected {
            return Err(ArchiveError::malformed(format!(
                "truncated file contents ({} of {} bytes missing)",
                expected - skipped,
                expected
            ))
            .into());
        }
        Ok(())
    }
}

impl<R: Read> Iterator for Decoder<R> {
    type Item = Result<Entry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// Bounded reader over the contents of one regular file entry.
///
/// Hitting the end of the input before the announced size is reached yields an
/// [`io::ErrorKind::UnexpectedEof`] error.
pub struct Contents<'a, R: Read> {
    decoder: &'a mut Decoder<R>,
}

impl<'a, R: Read> Contents<'a, R> {
    pub fn remaining(&self) -> u64 {
        self.decoder.payload_remaining
    }
}

impl<'a, R: Read> Read for Contents<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.decoder.payload_remaining;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(remaining.min(usize::MAX as u64) as usize);
        let got = self.decoder.input.read(&mut buf[..len])?;
        if got == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("truncated file contents ({remaining} bytes missing)"),
            ));
        }
        self.decoder.payload_remaining -= got as u64;
        self.decoder.position += got as u64;
        Ok(got)
    }
}
