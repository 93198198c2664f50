//! Directory trees.
//!
//! A tree is a flat, sorted mapping from relative path to file digest. Its
//! canonical JSON encoding is stored as an ordinary blob, and the digest of that
//! blob is the tree digest.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Digest, StoreError};

const TREE_FORMAT_VERSION: u32 = 1;

/// A file entry in a [`DirectoryTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileNode {
  pub digest: Digest,
  #[serde(default)]
  pub is_executable: bool,
}

/// An immutable snapshot of a directory's files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DirectoryTree {
  files: BTreeMap<String, FileNode>,
  directories: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
struct EncodedTree {
  kiln_tree: u32,
  files: BTreeMap<String, FileNode>,
  #[serde(default)]
  directories: BTreeSet<String>,
}

impl DirectoryTree {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a file, replacing any existing entry at the same path.
  pub fn insert_file(&mut self, path: impl AsRef<Path>, node: FileNode) -> Result<(), StoreError> {
    let key = normalize(path.as_ref())?;
    self.files.insert(key, node);
    Ok(())
  }

  /// Record an (possibly empty) directory so it is recreated on materialization.
  pub fn insert_directory(&mut self, path: impl AsRef<Path>) -> Result<(), StoreError> {
    let key = normalize(path.as_ref())?;
    self.directories.insert(key);
    Ok(())
  }

  pub fn files(&self) -> impl Iterator<Item = (&str, &FileNode)> {
    self.files.iter().map(|(path, node)| (path.as_str(), node))
  }

  pub fn directories(&self) -> impl Iterator<Item = &str> {
    self.directories.iter().map(String::as_str)
  }

  pub fn get(&self, path: &str) -> Option<&FileNode> {
    self.files.get(path)
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty() && self.directories.is_empty()
  }

  /// Digests of every file in the tree.
  pub fn file_digests(&self) -> impl Iterator<Item = Digest> + '_ {
    self.files.values().map(|node| node.digest)
  }

  /// Merge another tree into this one.
  ///
  /// Fails if both trees hold different content at the same path.
  pub fn merge(&mut self, other: &DirectoryTree) -> Result<(), StoreError> {
    for (path, node) in &other.files {
      match self.files.get(path) {
        Some(existing) if existing != node => {
          return Err(StoreError::InvalidPath {
            path: PathBuf::from(path),
            message: format!(
              "conflicting content while merging ({} vs {})",
              existing.digest, node.digest
            ),
          });
        }
        _ => {
          self.files.insert(path.clone(), *node);
        }
      }
    }
    self.directories.extend(other.directories.iter().cloned());
    Ok(())
  }

  /// Keep only the entries under `prefix` and strip it from their paths.
  pub fn subtree(&self, prefix: &str) -> DirectoryTree {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
      return self.clone();
    }
    let with_slash = format!("{}/", prefix);
    DirectoryTree {
      files: self
        .files
        .iter()
        .filter_map(|(path, node)| {
          path
            .strip_prefix(&with_slash)
            .map(|rest| (rest.to_string(), *node))
        })
        .collect(),
      directories: self
        .directories
        .iter()
        .filter_map(|dir| dir.strip_prefix(&with_slash).map(str::to_string))
        .collect(),
    }
  }

  /// Canonical encoding of the tree.
  pub fn encode(&self) -> Result<Bytes, StoreError> {
    let encoded = EncodedTree {
      kiln_tree: TREE_FORMAT_VERSION,
      files: self.files.clone(),
      directories: self.directories.clone(),
    };
    Ok(Bytes::from(serde_json::to_vec(&encoded)?))
  }

  /// Decode a tree blob. Fails for blobs that are not trees.
  pub fn decode(digest: Digest, bytes: &[u8]) -> Result<Self, StoreError> {
    let encoded: EncodedTree =
      serde_json::from_slice(bytes).map_err(|_| StoreError::NotATree(digest))?;
    if encoded.kiln_tree != TREE_FORMAT_VERSION {
      return Err(StoreError::NotATree(digest));
    }
    Ok(Self {
      files: encoded.files,
      directories: encoded.directories,
    })
  }

  /// Cheap check used when walking the store: only blobs with the tree header
  /// are worth decoding.
  pub fn looks_like_tree(bytes: &[u8]) -> bool {
    bytes.starts_with(b"{\"kiln_tree\":")
  }

  /// Digest of the canonical encoding.
  pub fn digest(&self) -> Result<Digest, StoreError> {
    Ok(Digest::of_bytes(&self.encode()?))
  }
}

/// Normalize a relative path into the `a/b/c` key form used by trees.
pub(crate) fn normalize(path: &Path) -> Result<String, StoreError> {
  let mut parts = Vec::new();
  for component in path.components() {
    match component {
      Component::Normal(part) => {
        let part = part.to_str().ok_or_else(|| StoreError::InvalidPath {
          path: path.to_path_buf(),
          message: "path is not valid UTF-8".to_string(),
        })?;
        parts.push(part);
      }
      Component::CurDir => {}
      _ => {
        return Err(StoreError::InvalidPath {
          path: path.to_path_buf(),
          message: "must be relative and must not contain '..'".to_string(),
        });
      }
    }
  }
  if parts.is_empty() {
    return Err(StoreError::InvalidPath {
      path: path.to_path_buf(),
      message: "path is empty".to_string(),
    });
  }
  Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn node(content: &[u8]) -> FileNode {
    FileNode {
      digest: Digest::of_bytes(content),
      is_executable: false,
    }
  }

  #[test]
  fn test_insertion_order_does_not_change_digest() {
    let mut a = DirectoryTree::new();
    a.insert_file("src/lib.rs", node(b"lib")).unwrap();
    a.insert_file("README", node(b"readme")).unwrap();

    let mut b = DirectoryTree::new();
    b.insert_file("README", node(b"readme")).unwrap();
    b.insert_file("./src/lib.rs", node(b"lib")).unwrap();

    assert_eq!(a.digest().unwrap(), b.digest().unwrap());
  }

  #[test]
  fn test_rejects_escaping_paths() {
    let mut tree = DirectoryTree::new();
    assert!(tree.insert_file("../etc/passwd", node(b"x")).is_err());
    assert!(tree.insert_file("/abs", node(b"x")).is_err());
  }

  #[test]
  fn test_decode_round_trip_and_non_tree() {
    let mut tree = DirectoryTree::new();
    tree.insert_file("a.txt", node(b"a")).unwrap();
    tree.insert_directory("empty").unwrap();
    let bytes = tree.encode().unwrap();
    assert!(DirectoryTree::looks_like_tree(&bytes));
    let digest = Digest::of_bytes(&bytes);
    assert_eq!(DirectoryTree::decode(digest, &bytes).unwrap(), tree);

    let plain = Digest::of_bytes(b"plain text");
    assert!(matches!(
      DirectoryTree::decode(plain, b"plain text"),
      Err(StoreError::NotATree(_))
    ));
  }

  #[test]
  fn test_merge_conflict() {
    let mut a = DirectoryTree::new();
    a.insert_file("x", node(b"1")).unwrap();
    let mut b = DirectoryTree::new();
    b.insert_file("x", node(b"2")).unwrap();
    assert!(a.merge(&b).is_err());

    let mut c = DirectoryTree::new();
    c.insert_file("y", node(b"3")).unwrap();
    a.merge(&c).unwrap();
    assert_eq!(a.len(), 2);
  }

  #[test]
  fn test_subtree_strips_prefix() {
    let mut tree = DirectoryTree::new();
    tree.insert_file("out/bin/tool", node(b"t")).unwrap();
    tree.insert_file("other", node(b"o")).unwrap();
    let sub = tree.subtree("out");
    assert!(sub.get("bin/tool").is_some());
    assert_eq!(sub.len(), 1);
  }
}
