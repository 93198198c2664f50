use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use super::{RemoteError, RemoteStore};
use crate::Digest;

/// In-memory remote store.
///
/// Intended for tests: failures can be queued with [`fail_next`] and every
/// operation is counted.
///
/// [`fail_next`]: MemoryRemoteStore::fail_next
#[derive(Default)]
pub struct MemoryRemoteStore {
  blobs: RwLock<HashMap<Digest, Bytes>>,
  actions: RwLock<HashMap<Digest, Digest>>,
  faults: RwLock<VecDeque<RemoteError>>,
  loads: AtomicUsize,
  uploads: AtomicUsize,
}

impl MemoryRemoteStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make the next operation fail with `error`. Queued errors are consumed in
  /// order, one per operation.
  pub fn fail_next(&self, error: RemoteError) {
    let mut faults = self.faults.write().unwrap_or_else(|e| e.into_inner());
    faults.push_back(error);
  }

  /// Number of blob loads served, including misses.
  pub fn load_count(&self) -> usize {
    self.loads.load(Ordering::SeqCst)
  }

  /// Number of blob uploads received.
  pub fn upload_count(&self) -> usize {
    self.uploads.load(Ordering::SeqCst)
  }

  pub fn contains(&self, digest: &Digest) -> bool {
    let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
    blobs.contains_key(digest)
  }

  fn take_fault(&self) -> Result<(), RemoteError> {
    let mut faults = self.faults.write().unwrap_or_else(|e| e.into_inner());
    match faults.pop_front() {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
  async fn load(&self, digest: Digest) -> Result<Option<Bytes>, RemoteError> {
    self.take_fault()?;
    self.loads.fetch_add(1, Ordering::SeqCst);
    // Yield so concurrent callers overlap the way a network fetch would.
    tokio::task::yield_now().await;
    let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
    Ok(blobs.get(&digest).cloned())
  }

  async fn store(&self, digest: Digest, bytes: Bytes) -> Result<(), RemoteError> {
    self.take_fault()?;
    if !digest.matches(&bytes) {
      return Err(RemoteError::Rejected(format!(
        "content does not match digest {}",
        digest
      )));
    }
    self.uploads.fetch_add(1, Ordering::SeqCst);
    let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
    blobs.insert(digest, bytes);
    Ok(())
  }

  async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, RemoteError> {
    self.take_fault()?;
    let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
    Ok(
      digests
        .iter()
        .filter(|digest| !blobs.contains_key(digest))
        .copied()
        .collect(),
    )
  }

  async fn get_action(&self, action: Digest) -> Result<Option<Digest>, RemoteError> {
    self.take_fault()?;
    let actions = self.actions.read().unwrap_or_else(|e| e.into_inner());
    Ok(actions.get(&action).copied())
  }

  async fn put_action(&self, action: Digest, result: Digest) -> Result<(), RemoteError> {
    self.take_fault()?;
    let mut actions = self.actions.write().unwrap_or_else(|e| e.into_inner());
    actions.insert(action, result);
    Ok(())
  }
}
