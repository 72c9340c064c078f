//! SHA-256 helpers
//!
//! [`HashingReader`] and [`HashingWriter`] hash bytes as they stream through, so a
//! copy produces both checksums without re-reading either file.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use super::IntegrityError;

const BUFFER_SIZE: usize = 64 * 1024;

/// Hex-encoded SHA-256 of a byte slice
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Blocking checksum of a file, returning `(hex digest, byte count)`
pub fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let file = File::open(path)?;
    let mut reader = HashingReader::new(BufReader::with_capacity(BUFFER_SIZE, file));
    io::copy(&mut reader, &mut io::sink())?;
    let (digest, bytes, _) = reader.finish();
    Ok((digest, bytes))
}

/// Checksum a file on the blocking pool
pub async fn file_checksum(path: impl AsRef<Path>) -> Result<(String, u64), IntegrityError> {
    let path = path.as_ref().to_path_buf();
    let target = path.clone();
    tokio::task::spawn_blocking(move || sha256_file(&target))
        .await?
        .map_err(|e| IntegrityError::io(path, e))
}

/// Reader adapter that hashes everything read through it
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Consume the adapter, returning the digest, the byte count and the inner reader
    pub fn finish(self) -> (String, u64, R) {
        (format!("{:x}", self.hasher.finalize()), self.bytes, self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Writer adapter that hashes everything written through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn finish(self) -> (String, u64, W) {
        (format!("{:x}", self.hasher.finalize()), self.bytes, self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Last known checksum per written file
///
/// Populated by the atomic writer and consulted by the corruption detector to
/// spot files changed outside of it.
#[derive(Debug, Default)]
pub struct ChecksumRegistry {
    entries: DashMap<PathBuf, String>,
}

impl ChecksumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: impl Into<PathBuf>, checksum: impl Into<String>) {
        self.entries.insert(path.into(), checksum.into());
    }

    pub fn get(&self, path: &Path) -> Option<String> {
        self.entries.get(path).map(|entry| entry.value().clone())
    }

    pub fn forget(&self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_hashing_reader_matches_direct_digest() {
        let data = b"{\"name\": \"demo\"}".to_vec();
        let mut reader = HashingReader::new(Cursor::new(data.clone()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        let (digest, bytes, _) = reader.finish();

        assert_eq!(out, data);
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(digest, sha256_bytes(&data));
    }

    #[test]
    fn test_hashing_writer_counts_bytes() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"0123456789").unwrap();
        let (digest, bytes, inner) = writer.finish();

        assert_eq!(bytes, 10);
        assert_eq!(inner, b"0123456789");
        assert_eq!(digest, sha256_bytes(b"0123456789"));
    }

    #[test]
    fn test_registry_record_and_forget() {
        let registry = ChecksumRegistry::new();
        let path = PathBuf::from("/tmp/state.json");
        registry.record(&path, "abc");
        assert_eq!(registry.get(&path).as_deref(), Some("abc"));
        registry.forget(&path);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_file_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, b"[1, 2, 3]").unwrap();

        let (digest, size) = file_checksum(&path).await.unwrap();
        assert_eq!(size, 9);
        assert_eq!(digest, sha256_bytes(b"[1, 2, 3]"));
    }
}
