use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::{ByteStore, Fingerprint, StoreError};

const TMP_DIR: &str = "tmp";

/// Filesystem-based blob store.
///
/// Blobs are stored as files sharded by the first two hex characters of
/// their fingerprint:
/// ```text
/// {root}/
/// ├── tmp/          (in-progress writes)
/// └── e3/
///     └── e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855
/// ```
/// Writes go to `tmp/` first and are renamed into place, so readers never
/// observe a partially written blob.
pub struct FsByteStore {
  root: PathBuf,
}

impl FsByteStore {
  /// Create a new filesystem store rooted at the given directory.
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn blob_path(&self, fingerprint: Fingerprint) -> PathBuf {
    let hex = fingerprint.to_hex();
    self.root.join(&hex[..2]).join(hex)
  }
}

#[async_trait]
impl ByteStore for FsByteStore {
  async fn load(&self, fingerprint: Fingerprint) -> Result<Option<Bytes>, StoreError> {
    match fs::read(self.blob_path(fingerprint)).await {
      Ok(content) => Ok(Some(Bytes::from(content))),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(StoreError::Io(e)),
    }
  }

  async fn store(&self, fingerprint: Fingerprint, bytes: Bytes) -> Result<(), StoreError> {
    let path = self.blob_path(fingerprint);
    if fs::try_exists(&path).await? {
      return Ok(());
    }

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }
    let tmp_dir = self.root.join(TMP_DIR);
    fs::create_dir_all(&tmp_dir).await?;

    let tmp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());
    let mut file = File::create(&tmp_path).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    // A concurrent writer of the same content may win the rename; both
    // produce identical files so either outcome is fine.
    if let Err(e) = fs::rename(&tmp_path, &path).await {
      let _ = fs::remove_file(&tmp_path).await;
      if !fs::try_exists(&path).await? {
        return Err(StoreError::Io(e));
      }
    }
    Ok(())
  }

  async fn exists(&self, fingerprint: Fingerprint) -> Result<bool, StoreError> {
    Ok(fs::try_exists(self.blob_path(fingerprint)).await?)
  }

  async fn remove(&self, fingerprint: Fingerprint) -> Result<bool, StoreError> {
    match fs::remove_file(self.blob_path(fingerprint)).await {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(StoreError::Io(e)),
    }
  }

  async fn list(&self) -> Result<Vec<(Fingerprint, u64)>, StoreError> {
    let mut blobs = Vec::new();
    if !fs::try_exists(&self.root).await? {
      return Ok(blobs);
    }

    let mut shards = fs::read_dir(&self.root).await?;
    while let Some(shard) = shards.next_entry().await? {
      let name = shard.file_name();
      let Some(name) = name.to_str() else {
        continue;
      };
      if name == TMP_DIR || !shard.file_type().await?.is_dir() {
        continue;
      }

      let mut entries = fs::read_dir(shard.path()).await?;
      while let Some(entry) = entries.next_entry().await? {
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
          continue;
        };
        if let Ok(fingerprint) = Fingerprint::from_hex(&file_name) {
          let size = entry.metadata().await?.len();
          blobs.push((fingerprint, size));
        }
      }
    }

    Ok(blobs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_store_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsByteStore::new(dir.path());
    let fingerprint = Fingerprint::of(b"hello");

    store
      .store(fingerprint, Bytes::from_static(b"hello"))
      .await
      .unwrap();

    let loaded = store.load(fingerprint).await.unwrap();
    assert_eq!(loaded.as_deref(), Some(&b"hello"[..]));

    let hex = fingerprint.to_hex();
    assert!(dir.path().join(&hex[..2]).join(&hex).exists());
  }

  #[tokio::test]
  async fn test_missing_blob_loads_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsByteStore::new(dir.path());
    assert!(store.load(Fingerprint::of(b"nope")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_list_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsByteStore::new(dir.path());
    let a = Fingerprint::of(b"a");
    let b = Fingerprint::of(b"bb");
    store.store(a, Bytes::from_static(b"a")).await.unwrap();
    store.store(b, Bytes::from_static(b"bb")).await.unwrap();

    let mut listed = store.list().await.unwrap();
    listed.sort();
    let mut expected = vec![(a, 1), (b, 2)];
    expected.sort();
    assert_eq!(listed, expected);

    assert!(store.remove(a).await.unwrap());
    assert!(!store.remove(a).await.unwrap());
    assert!(!store.exists(a).await.unwrap());
  }
}
