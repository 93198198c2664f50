use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{ByteStore, Fingerprint, StoreError};

/// In-memory blob store, used for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryByteStore {
  blobs: RwLock<HashMap<Fingerprint, Bytes>>,
}

impl MemoryByteStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Overwrite a blob regardless of its fingerprint. Only useful for
  /// simulating corruption in tests.
  pub fn insert_raw(&self, fingerprint: Fingerprint, bytes: Bytes) {
    let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
    blobs.insert(fingerprint, bytes);
  }

  pub fn len(&self) -> usize {
    self.blobs.read().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl ByteStore for MemoryByteStore {
  async fn load(&self, fingerprint: Fingerprint) -> Result<Option<Bytes>, StoreError> {
    let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
    Ok(blobs.get(&fingerprint).cloned())
  }

  async fn store(&self, fingerprint: Fingerprint, bytes: Bytes) -> Result<(), StoreError> {
    let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
    blobs.entry(fingerprint).or_insert(bytes);
    Ok(())
  }

  async fn exists(&self, fingerprint: Fingerprint) -> Result<bool, StoreError> {
    let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
    Ok(blobs.contains_key(&fingerprint))
  }

  async fn remove(&self, fingerprint: Fingerprint) -> Result<bool, StoreError> {
    let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
    Ok(blobs.remove(&fingerprint).is_some())
  }

  async fn list(&self) -> Result<Vec<(Fingerprint, u64)>, StoreError> {
    let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
    Ok(
      blobs
        .iter()
        .map(|(fingerprint, bytes)| (*fingerprint, bytes.len() as u64))
        .collect(),
    )
  }
}
