//! Content hasher: SHA-256 fingerprints of file content.
//!
//! A [`Digest`] is both the per-file identity inside a change-set and the key
//! under which content blobs are stored, so it is always the 64-character
//! lowercase hex form of the hash.

#![allow(missing_docs)]

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::core::errors::{DriftError, Result};

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

const READ_BUF_BYTES: usize = 64 * 1024;

/// Hex-encoded SHA-256 of one file version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse a hex digest, normalizing to lowercase.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == DIGEST_HEX_LEN && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = DriftError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| DriftError::InvalidChangeSet {
            details: format!("not a SHA-256 hex digest: {s:?}"),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = DriftError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

/// Digest of an in-memory byte slice.
pub fn digest(bytes: &[u8]) -> Digest {
    Digest(format!("{:x}", Sha256::digest(bytes)))
}

/// Digest of everything a reader yields.
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..read]);
    }
    Ok(Digest(format!("{:x}", hasher.finalize())))
}

/// Digest of a file's content, streamed in fixed-size chunks.
pub fn digest_file(path: &Path) -> io::Result<Digest> {
    digest_reader(File::open(path)?)
}

/// Pass-through reader that hashes every byte it hands out. Used to copy a
/// file and learn the digest of what was actually copied in one pass.
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

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Digest of the bytes read so far.
    pub fn finish(self) -> Digest {
        Digest(format!("{:x}", self.hasher.finalize()))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_known_input() {
        // SHA-256("abc")
        assert_eq!(
            digest(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_is_fixed_width_hex() {
        let d = digest(b"");
        assert_eq!(d.as_str().len(), DIGEST_HEX_LEN);
        assert!(d.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn reader_and_slice_agree() {
        let data = vec![7u8; READ_BUF_BYTES * 2 + 13];
        assert_eq!(digest(&data), digest_reader(data.as_slice()).unwrap());
    }

    #[test]
    fn file_digest_matches_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.conf");
        std::fs::write(&path, b"listen 80\n").unwrap();
        assert_eq!(digest_file(&path).unwrap(), digest(b"listen 80\n"));
    }

    #[test]
    fn hashing_reader_passes_bytes_through() {
        let mut reader = HashingReader::new(&b"copied content"[..]);
        let mut out = Vec::new();
        io::copy(&mut reader, &mut out).unwrap();
        assert_eq!(out, b"copied content");
        assert_eq!(reader.bytes_read(), 14);
        assert_eq!(reader.finish(), digest(b"copied content"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(digest_file(&dir.path().join("gone")).is_err());
    }

    #[test]
    fn parse_normalizes_case_and_rejects_garbage() {
        let upper = digest(b"x").as_str().to_ascii_uppercase();
        assert_eq!(Digest::parse(&upper), Some(digest(b"x")));
        assert!(Digest::parse("abc").is_none());
        assert!(Digest::parse(&"g".repeat(DIGEST_HEX_LEN)).is_none());
        assert!("nope".parse::<Digest>().is_err());
    }
}
