use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::StoreError;

/// A SHA-256 content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
  /// Hash the given bytes.
  pub fn of(bytes: &[u8]) -> Self {
    Self(Sha256::digest(bytes).into())
  }

  /// Parse a 64-character lowercase or uppercase hex string.
  pub fn from_hex(hex_str: &str) -> Result<Self, StoreError> {
    let raw = hex::decode(hex_str)
      .map_err(|e| StoreError::InvalidDigest(format!("{}: {}", hex_str, e)))?;
    let bytes: [u8; 32] = raw
      .try_into()
      .map_err(|_| StoreError::InvalidDigest(format!("{}: expected 32 bytes", hex_str)))?;
    Ok(Self(bytes))
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fingerprint<{}>", self.to_hex())
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl Serialize for Fingerprint {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for Fingerprint {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
  }
}

/// Identifies an immutable blob or directory tree: its hash plus its size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
  pub hash: Fingerprint,
  pub size_bytes: u64,
}

impl Digest {
  pub fn new(hash: Fingerprint, size_bytes: u64) -> Self {
    Self { hash, size_bytes }
  }

  /// Digest of the given content.
  pub fn of_bytes(bytes: &[u8]) -> Self {
    Self {
      hash: Fingerprint::of(bytes),
      size_bytes: bytes.len() as u64,
    }
  }

  /// Digest of zero bytes.
  pub fn empty() -> Self {
    Self::of_bytes(&[])
  }

  /// True if `bytes` is exactly the content this digest identifies.
  pub fn matches(&self, bytes: &[u8]) -> bool {
    bytes.len() as u64 == self.size_bytes && Fingerprint::of(bytes) == self.hash
  }
}

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.hash, self.size_bytes)
  }
}

impl FromStr for Digest {
  type Err = StoreError;

  /// Parses the `{hash}/{size}` form produced by `Display`.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (hash, size) = s
      .split_once('/')
      .ok_or_else(|| StoreError::InvalidDigest(format!("{}: expected <hash>/<size>", s)))?;
    let size_bytes = size
      .parse::<u64>()
      .map_err(|e| StoreError::InvalidDigest(format!("{}: {}", s, e)))?;
    Ok(Self {
      hash: Fingerprint::from_hex(hash)?,
      size_bytes,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_digest_is_well_known() {
    assert_eq!(
      Digest::empty().hash.to_hex(),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(Digest::empty().size_bytes, 0);
  }

  #[test]
  fn test_equal_content_equal_digest() {
    assert_eq!(Digest::of_bytes(b"a\nb\n"), Digest::of_bytes(b"a\nb\n"));
    assert_ne!(Digest::of_bytes(b"a\nb\n"), Digest::of_bytes(b"a\nb\nc\n"));
  }

  #[test]
  fn test_display_parses_back() {
    let digest = Digest::of_bytes(b"hello");
    let parsed: Digest = digest.to_string().parse().unwrap();
    assert_eq!(parsed, digest);
  }

  #[test]
  fn test_from_hex_rejects_short_input() {
    assert!(Fingerprint::from_hex("abcd").is_err());
    assert!(Fingerprint::from_hex("zz").is_err());
  }

  #[test]
  fn test_matches_checks_size_and_hash() {
    let digest = Digest::of_bytes(b"content");
    assert!(digest.matches(b"content"));
    assert!(!digest.matches(b"contenT"));
  }
}
