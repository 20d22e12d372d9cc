//! Blob identity: SHA-256 content hash.

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};

use crate::{Error, Result};

/// Identity of a cached blob: the SHA-256 digest of its contents,
/// rendered as 64 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid {
    bytes: [u8; 32],
}

impl Oid {
    /// Create an id from raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Oid { bytes }
    }

    /// Parse an id from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != 64 {
            return Err(Error::InvalidOid(format!(
                "expected 64 hex chars, got {}",
                hex.len()
            )));
        }

        let bytes = hex::decode(hex).map_err(|e| Error::InvalidOid(e.to_string()))?;

        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Oid { bytes: arr })
    }

    /// Compute the id of an in-memory byte sequence.
    pub fn digest(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        let result = hasher.finalize();

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Oid { bytes }
    }

    /// Compute the id of a stream without buffering it whole.
    ///
    /// Returns the id together with the number of bytes read.
    pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<(Self, u64)> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Ok((Oid { bytes }, size))
    }

    /// Get the id as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// First two hex characters: the cache shard directory name.
    pub fn shard(&self) -> String {
        hex::encode(&self.bytes[..1])
    }

    /// Remaining 62 hex characters: the blob file name inside its shard.
    pub fn rest(&self) -> String {
        self.to_hex().split_off(2)
    }

    /// Get the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

impl std::str::FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Oid::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest() {
        let content = b"Hello, World!";
        let oid = Oid::digest(content);
        // SHA256 of "Hello, World!"
        assert_eq!(
            oid.to_hex(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_digest_reader_matches_digest() {
        let content = b"streamed content that is hashed in chunks";
        let (oid, size) = Oid::digest_reader(&content[..]).unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(oid, Oid::digest(content));
    }

    #[test]
    fn test_from_hex_roundtrip() {
        let hex = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";
        let oid = Oid::from_hex(hex).unwrap();
        assert_eq!(oid.to_hex(), hex);
    }

    #[test]
    fn test_from_hex_invalid() {
        assert!(Oid::from_hex("not valid hex").is_err());
        assert!(Oid::from_hex("abc").is_err()); // too short
    }

    #[test]
    fn test_shard_split() {
        let oid = Oid::digest(b"x");
        let hex = oid.to_hex();
        assert_eq!(oid.shard(), hex[..2].to_string());
        assert_eq!(oid.rest(), hex[2..].to_string());
        assert_eq!(oid.shard().len(), 2);
        assert_eq!(oid.rest().len(), 62);
    }

    #[test]
    fn test_ordering_is_hex_ordering() {
        let a = Oid::digest(b"a");
        let b = Oid::digest(b"b");
        assert_eq!(a < b, a.to_hex() < b.to_hex());
    }
}
