//! SHA-256 content digests for file integrity.
//!
//! Digests travel on the wire as lowercase hex. Comparison against a
//! peer-supplied checksum is done on the lowercase form.

use crate::{COPY_BUFFER_SIZE, DIGEST_HEX_LEN, DIGEST_SIZE};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Errors produced when parsing a hex digest
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DigestError {
    /// Hex string has the wrong length
    #[error("digest must be {expected} hex characters, got {actual}")]
    InvalidLength {
        /// Expected number of hex characters
        expected: usize,
        /// Actual number of characters
        actual: usize,
    },

    /// Hex string contains a non-hex character
    #[error("digest contains non-hex characters")]
    InvalidHex,
}

/// A 256-bit content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileDigest([u8; DIGEST_SIZE]);

impl FileDigest {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a hex digest (either case)
    pub fn from_hex(s: &str) -> Result<Self, DigestError> {
        if s.len() != DIGEST_HEX_LEN {
            return Err(DigestError::InvalidLength {
                expected: DIGEST_HEX_LEN,
                actual: s.len(),
            });
        }

        let mut bytes = [0u8; DIGEST_SIZE];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| DigestError::InvalidHex)?;
        Ok(Self(bytes))
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering, as carried in frames
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compare against a checksum received from a peer
    ///
    /// The comparison is made between lowercase hex strings, so a peer that
    /// sends uppercase hex still verifies.
    pub fn matches_hex(&self, expected: &str) -> bool {
        self.to_hex() == expected.to_ascii_lowercase()
    }
}

impl fmt::Display for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileDigest({})", self.to_hex())
    }
}

/// Incremental digest that also counts the bytes fed into it
#[derive(Default, Clone)]
pub struct StreamingDigest {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingDigest {
    /// Create an empty digest state
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the digest
    pub fn finalize(self) -> FileDigest {
        FileDigest(self.hasher.finalize().into())
    }
}

/// Digest an in-memory buffer
pub fn digest_bytes(data: &[u8]) -> FileDigest {
    FileDigest(Sha256::digest(data).into())
}

/// Digest everything a reader yields until EOF
///
/// Returns the digest and the number of bytes consumed.
pub async fn digest_reader<R>(reader: &mut R) -> io::Result<(FileDigest, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut state = StreamingDigest::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        state.update(&buf[..n]);
    }

    let bytes = state.bytes();
    Ok((state.finalize(), bytes))
}

/// Digest a file from offset 0
pub async fn digest_file(path: impl AsRef<Path>) -> io::Result<(FileDigest, u64)> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    digest_reader(&mut file).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_known_vectors() {
        assert_eq!(digest_bytes(b"").to_hex(), EMPTY_SHA256);
        assert_eq!(digest_bytes(b"abc").to_hex(), ABC_SHA256);
    }

    #[test]
    fn test_hex_parse() {
        let d = FileDigest::from_hex(ABC_SHA256).unwrap();
        assert_eq!(d, digest_bytes(b"abc"));

        let upper = ABC_SHA256.to_ascii_uppercase();
        assert_eq!(FileDigest::from_hex(&upper).unwrap(), d);

        assert_eq!(
            FileDigest::from_hex("abcd"),
            Err(DigestError::InvalidLength {
                expected: 64,
                actual: 4
            })
        );

        let bad = "z".repeat(64);
        assert_eq!(FileDigest::from_hex(&bad), Err(DigestError::InvalidHex));
    }

    #[test]
    fn test_matches_hex_is_case_insensitive() {
        let d = digest_bytes(b"abc");
        assert!(d.matches_hex(ABC_SHA256));
        assert!(d.matches_hex(&ABC_SHA256.to_ascii_uppercase()));
        assert!(!d.matches_hex(EMPTY_SHA256));
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut state = StreamingDigest::new();
        for chunk in data.chunks(777) {
            state.update(chunk);
        }
        assert_eq!(state.bytes(), data.len() as u64);
        assert_eq!(state.finalize(), digest_bytes(&data));
    }

    #[tokio::test]
    async fn test_digest_file() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"abc").unwrap();
        temp.flush().unwrap();

        let (digest, size) = digest_file(temp.path()).await.unwrap();
        assert_eq!(size, 3);
        assert_eq!(digest.to_hex(), ABC_SHA256);
    }

    #[tokio::test]
    async fn test_digest_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = digest_file(dir.path().join("nope")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
