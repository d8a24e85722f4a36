//! SHA-256 digests of archive streams.

use std::io::{self, Write};
use std::path::Path;

use anyhow::Error;

/// A [`Write`] sink which only hashes and counts what is written to it.
pub struct DigestWriter {
    hasher: openssl::sha::Sha256,
    size: u64,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self {
            hasher: openssl::sha::Sha256::new(),
            size: 0,
        }
    }

    /// Returns the digest and the number of bytes written.
    pub fn finish(self) -> ([u8; 32], u64) {
        (self.hasher.finish(), self.size)
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.hasher.update(buf);
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

/// Calculate the sha256sum of the stream [`archive`](crate::archive) produces for `root`,
/// without storing the stream.
///
/// Two trees have the same digest exactly when they are equivalent in structure, names,
/// types, permission bits, symlink targets, hard-link sharing and file contents.
pub fn tree_digest(root: &Path) -> Result<([u8; 32], u64), Error> {
    let mut writer = DigestWriter::new();
    crate::archive(root, &mut writer)?;
    Ok(writer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_writer() {
        let mut writer = DigestWriter::new();
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (csum, size) = writer.finish();

        assert_eq!(size, 11);
        assert_eq!(csum, openssl::sha::sha256(b"hello world"));
    }

    #[test]
    fn test_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let (csum, size) = tree_digest(dir.path()).unwrap();
        assert_eq!(size, 0);
        assert_eq!(csum, openssl::sha::sha256(b""));
    }
}
