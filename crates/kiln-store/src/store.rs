use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::tree::normalize;
use crate::{
  ByteStore, Digest, DirectoryTree, FileNode, FsByteStore, MemoryByteStore, RemoteError,
  RemoteStore, StoreError,
};

/// Files above this size are materialized writable.
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 512 * 1024;

const MATERIALIZE_CONCURRENCY: usize = 16;

type RemoteFetch = Shared<BoxFuture<'static, Result<Option<Bytes>, RemoteError>>>;
type RemoteUpload = Shared<BoxFuture<'static, Result<(), RemoteError>>>;

/// The remote half of a [`Store`], with its read/write switches and a
/// concurrency limit shared by every remote operation.
pub struct RemoteTier {
  store: Arc<dyn RemoteStore>,
  read: bool,
  write: bool,
  fanout: usize,
  limit: Arc<Semaphore>,
}

impl RemoteTier {
  pub fn new(store: Arc<dyn RemoteStore>, fanout: usize) -> Self {
    let fanout = fanout.max(1);
    Self {
      store,
      read: true,
      write: true,
      fanout,
      limit: Arc::new(Semaphore::new(fanout)),
    }
  }

  pub fn with_read(mut self, enabled: bool) -> Self {
    self.read = enabled;
    self
  }

  pub fn with_write(mut self, enabled: bool) -> Self {
    self.write = enabled;
    self
  }

  pub fn store(&self) -> &Arc<dyn RemoteStore> {
    &self.store
  }

  pub fn fanout(&self) -> usize {
    self.fanout
  }

  pub fn can_read(&self) -> bool {
    self.read
  }

  pub fn can_write(&self) -> bool {
    self.write
  }

  /// Wait for a slot under the remote fan-out limit.
  pub async fn permit(&self) -> Result<OwnedSemaphorePermit, RemoteError> {
    self
      .limit
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| RemoteError::Unavailable("remote tier is shut down".to_string()))
  }
}

/// Outcome of a garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
  pub kept: usize,
  pub removed: usize,
  pub reclaimed_bytes: u64,
}

/// Content-addressed store over a local [`ByteStore`] and an optional remote
/// tier.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct Store {
  inner: Arc<Inner>,
}

struct Inner {
  local: Arc<dyn ByteStore>,
  remote: Option<RemoteTier>,
  downloads: Mutex<HashMap<Digest, RemoteFetch>>,
  uploads: Mutex<HashMap<Digest, RemoteUpload>>,
  leases: Mutex<HashMap<Digest, usize>>,
  large_file_threshold: u64,
}

impl Store {
  pub fn new(
    local: Arc<dyn ByteStore>,
    remote: Option<RemoteTier>,
    large_file_threshold: u64,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        local,
        remote,
        downloads: Mutex::new(HashMap::new()),
        uploads: Mutex::new(HashMap::new()),
        leases: Mutex::new(HashMap::new()),
        large_file_threshold,
      }),
    }
  }

  /// A local-only store persisted under `root`.
  pub fn open(root: impl Into<PathBuf>) -> Self {
    Self::new(
      Arc::new(FsByteStore::new(root)),
      None,
      DEFAULT_LARGE_FILE_THRESHOLD,
    )
  }

  /// A local-only store held in memory.
  pub fn in_memory() -> Self {
    Self::new(
      Arc::new(MemoryByteStore::new()),
      None,
      DEFAULT_LARGE_FILE_THRESHOLD,
    )
  }

  pub fn remote(&self) -> Option<&RemoteTier> {
    self.inner.remote.as_ref()
  }

  pub fn large_file_threshold(&self) -> u64 {
    self.inner.large_file_threshold
  }

  /// Store a blob locally and return its digest.
  pub async fn store_bytes(&self, bytes: Bytes) -> Result<Digest, StoreError> {
    let digest = Digest::of_bytes(&bytes);
    if digest.size_bytes > 0 {
      self.inner.local.store(digest.hash, bytes).await?;
    }
    debug!(digest = %digest, "blob stored");
    Ok(digest)
  }

  pub async fn contains_local(&self, digest: Digest) -> Result<bool, StoreError> {
    if digest.size_bytes == 0 {
      return Ok(true);
    }
    self.inner.local.exists(digest.hash).await
  }

  /// Load a blob, trying the local tier first and then the remote tier.
  ///
  /// Content that does not hash to `digest` is never returned: a corrupt local
  /// blob is deleted and treated as a miss.
  pub async fn load_bytes(&self, digest: Digest) -> Result<Option<Bytes>, StoreError> {
    if digest.size_bytes == 0 {
      return Ok(Some(Bytes::new()));
    }
    if let Some(bytes) = self.load_local(digest).await? {
      return Ok(Some(bytes));
    }
    self.fetch_remote(digest).await
  }

  pub async fn load_bytes_required(&self, digest: Digest) -> Result<Bytes, StoreError> {
    self
      .load_bytes(digest)
      .await?
      .ok_or(StoreError::NotFound(digest))
  }

  async fn load_local(&self, digest: Digest) -> Result<Option<Bytes>, StoreError> {
    let Some(bytes) = self.inner.local.load(digest.hash).await? else {
      return Ok(None);
    };
    if digest.matches(&bytes) {
      return Ok(Some(bytes));
    }

    let error = StoreError::Corrupt {
      digest,
      actual: Digest::of_bytes(&bytes),
    };
    warn!(error = %error, "corrupt blob discarded");
    self.inner.local.remove(digest.hash).await?;
    Ok(None)
  }

  /// Fetch from the remote tier, sharing one in-flight fetch per digest.
  async fn fetch_remote(&self, digest: Digest) -> Result<Option<Bytes>, StoreError> {
    let Some(remote) = self.inner.remote.as_ref().filter(|r| r.read) else {
      return Ok(None);
    };

    let fetch = {
      let mut downloads = self.inner.downloads.lock().unwrap_or_else(|e| e.into_inner());
      downloads
        .entry(digest)
        .or_insert_with(|| {
          let store = remote.store.clone();
          let limit = remote.limit.clone();
          async move {
            let _permit = limit
              .acquire_owned()
              .await
              .map_err(|_| RemoteError::Unavailable("remote tier is shut down".to_string()))?;
            store.load(digest).await
          }
          .boxed()
          .shared()
        })
        .clone()
    };

    let result = fetch.await;
    {
      let mut downloads = self.inner.downloads.lock().unwrap_or_else(|e| e.into_inner());
      downloads.remove(&digest);
    }

    let bytes = match result {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return Ok(None),
      Err(e) => {
        warn!(digest = %digest, error = %e, "remote fetch failed");
        return Ok(None);
      }
    };

    if !digest.matches(&bytes) {
      warn!(digest = %digest, "remote blob corrupt");
      return Ok(None);
    }

    self.inner.local.store(digest.hash, bytes.clone()).await?;
    debug!(digest = %digest, "remote blob fetched");
    Ok(Some(bytes))
  }

  pub async fn store_tree(&self, tree: &DirectoryTree) -> Result<Digest, StoreError> {
    self.store_bytes(tree.encode()?).await
  }

  pub async fn load_tree(&self, digest: Digest) -> Result<DirectoryTree, StoreError> {
    let bytes = self.load_bytes_required(digest).await?;
    DirectoryTree::decode(digest, &bytes)
  }

  /// Capture files and directories under `root` into a stored tree.
  ///
  /// Each path is relative to `root`; `.` captures the whole root. Directories
  /// are walked recursively. Symlinks are never followed or captured.
  #[instrument(name = "store_snapshot", skip(self, root, paths), fields(root = %root.display()))]
  pub async fn snapshot_paths(
    &self,
    root: &Path,
    paths: &[PathBuf],
  ) -> Result<(Digest, DirectoryTree), StoreError> {
    let mut tree = DirectoryTree::new();
    for relative in paths {
      let is_root = relative.components().all(|c| c == Component::CurDir);
      let absolute = if is_root {
        root.to_path_buf()
      } else {
        root.join(normalize(relative)?)
      };

      let metadata = if is_root {
        tokio::fs::metadata(&absolute).await?
      } else {
        tokio::fs::symlink_metadata(&absolute).await?
      };
      if metadata.is_symlink() {
        debug!(path = %absolute.display(), "skipping symlink");
        continue;
      }
      if metadata.is_dir() {
        self.snapshot_dir(root, &absolute, &mut tree).await?;
      } else {
        self.snapshot_file(root, &absolute, &mut tree).await?;
      }
    }

    let digest = self.store_tree(&tree).await?;
    debug!(digest = %digest, files = tree.len(), "snapshot captured");
    Ok((digest, tree))
  }

  async fn snapshot_dir(
    &self,
    root: &Path,
    dir: &Path,
    tree: &mut DirectoryTree,
  ) -> Result<(), StoreError> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
      if current != root {
        tree.insert_directory(relative_to(root, &current)?)?;
      }
      let mut entries = tokio::fs::read_dir(&current).await?;
      while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;
        if file_type.is_symlink() {
          debug!(path = %path.display(), "skipping symlink");
        } else if file_type.is_dir() {
          pending.push(path);
        } else {
          self.snapshot_file(root, &path, tree).await?;
        }
      }
    }
    Ok(())
  }

  async fn snapshot_file(
    &self,
    root: &Path,
    path: &Path,
    tree: &mut DirectoryTree,
  ) -> Result<(), StoreError> {
    let metadata = tokio::fs::metadata(path).await?;
    let content = tokio::fs::read(path).await?;
    let digest = self.store_bytes(Bytes::from(content)).await?;
    tree.insert_file(
      relative_to(root, path)?,
      FileNode {
        digest,
        is_executable: is_executable(&metadata),
      },
    )
  }

  /// Permission bits for a materialized file.
  pub fn file_mode(&self, node: &FileNode) -> u32 {
    if node.is_executable {
      0o755
    } else if node.digest.size_bytes > self.inner.large_file_threshold {
      0o644
    } else {
      0o444
    }
  }

  /// Write the tree `digest` out under `dest`.
  ///
  /// Small files are made read-only, files above the large file threshold stay
  /// writable, and executables keep their execute bit.
  #[instrument(name = "store_materialize", skip(self, dest), fields(dest = %dest.display()))]
  pub async fn materialize_directory(&self, digest: Digest, dest: &Path) -> Result<(), StoreError> {
    let tree = self.load_tree(digest).await?;
    tokio::fs::create_dir_all(dest).await?;
    for dir in tree.directories() {
      tokio::fs::create_dir_all(dest.join(dir)).await?;
    }

    let files: Vec<(PathBuf, FileNode)> = tree
      .files()
      .map(|(path, node)| (dest.join(path), *node))
      .collect();
    futures::stream::iter(files)
      .map(|(target, node)| self.materialize_file(target, node))
      .buffer_unordered(MATERIALIZE_CONCURRENCY)
      .try_collect::<Vec<()>>()
      .await?;
    Ok(())
  }

  async fn materialize_file(&self, target: PathBuf, node: FileNode) -> Result<(), StoreError> {
    let bytes = self.load_bytes_required(node.digest).await?;
    if let Some(parent) = target.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::try_exists(&target).await? {
      tokio::fs::remove_file(&target).await?;
    }
    tokio::fs::write(&target, &bytes).await?;
    set_mode(&target, self.file_mode(&node)).await
  }

  /// Every digest reachable from `roots`, walking into locally stored trees.
  pub async fn closure(&self, roots: &[Digest]) -> Result<Vec<Digest>, StoreError> {
    let mut seen = HashSet::new();
    let mut pending: Vec<Digest> = roots.to_vec();
    while let Some(digest) = pending.pop() {
      if !seen.insert(digest) {
        continue;
      }
      if let Some(bytes) = self.load_local(digest).await?
        && DirectoryTree::looks_like_tree(&bytes)
        && let Ok(tree) = DirectoryTree::decode(digest, &bytes)
      {
        pending.extend(tree.file_digests());
      }
    }
    Ok(seen.into_iter().collect())
  }

  /// Upload whatever the remote tier is missing from the closure of `roots`.
  /// Returns the number of blobs uploaded.
  pub async fn ensure_remote_has(&self, roots: &[Digest]) -> Result<usize, StoreError> {
    let Some(remote) = self.inner.remote.as_ref().filter(|r| r.write) else {
      return Ok(0);
    };

    let closure = self.closure(roots).await?;
    let missing = {
      let _permit = remote.permit().await?;
      remote.store.find_missing(&closure).await?
    };

    let uploaded = missing.len();
    futures::stream::iter(missing)
      .map(|digest| self.upload(remote, digest))
      .buffer_unordered(remote.fanout)
      .try_collect::<Vec<()>>()
      .await?;

    if uploaded > 0 {
      info!(uploaded, "remote upload completed");
    }
    Ok(uploaded)
  }

  async fn upload(&self, remote: &RemoteTier, digest: Digest) -> Result<(), StoreError> {
    let bytes = self.load_bytes_required(digest).await?;
    let upload = {
      let mut uploads = self.inner.uploads.lock().unwrap_or_else(|e| e.into_inner());
      uploads
        .entry(digest)
        .or_insert_with(|| {
          let store = remote.store.clone();
          let limit = remote.limit.clone();
          async move {
            let _permit = limit
              .acquire_owned()
              .await
              .map_err(|_| RemoteError::Unavailable("remote tier is shut down".to_string()))?;
            store.store(digest, bytes).await
          }
          .boxed()
          .shared()
        })
        .clone()
    };

    let result = upload.await;
    {
      let mut uploads = self.inner.uploads.lock().unwrap_or_else(|e| e.into_inner());
      uploads.remove(&digest);
    }
    result.map_err(StoreError::from)
  }

  /// Mark `digest` as referenced. Leased digests survive garbage collection.
  pub fn lease(&self, digest: Digest) {
    let mut leases = self.inner.leases.lock().unwrap_or_else(|e| e.into_inner());
    *leases.entry(digest).or_insert(0) += 1;
  }

  /// Drop one reference taken by [`Store::lease`].
  pub fn release(&self, digest: Digest) {
    let mut leases = self.inner.leases.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(count) = leases.get_mut(&digest) {
      *count -= 1;
      if *count == 0 {
        leases.remove(&digest);
      }
    }
  }

  pub fn lease_count(&self, digest: Digest) -> usize {
    let leases = self.inner.leases.lock().unwrap_or_else(|e| e.into_inner());
    leases.get(&digest).copied().unwrap_or(0)
  }

  pub fn leased(&self) -> Vec<Digest> {
    let leases = self.inner.leases.lock().unwrap_or_else(|e| e.into_inner());
    leases.keys().copied().collect()
  }

  /// Remove every local blob not reachable from a lease or `extra_roots`.
  ///
  /// Must not run concurrently with writers that have not yet leased what
  /// they stored.
  #[instrument(name = "store_gc", skip(self, extra_roots))]
  pub async fn garbage_collect(&self, extra_roots: &[Digest]) -> Result<GcReport, StoreError> {
    let mut roots = self.leased();
    roots.extend_from_slice(extra_roots);
    let live: HashSet<_> = self
      .closure(&roots)
      .await?
      .into_iter()
      .map(|digest| digest.hash)
      .collect();

    let mut report = GcReport::default();
    for (fingerprint, size) in self.inner.local.list().await? {
      if live.contains(&fingerprint) {
        report.kept += 1;
      } else if self.inner.local.remove(fingerprint).await? {
        report.removed += 1;
        report.reclaimed_bytes += size;
      }
    }

    info!(
      kept = report.kept,
      removed = report.removed,
      reclaimed_bytes = report.reclaimed_bytes,
      "store gc completed"
    );
    Ok(report)
  }
}

fn relative_to(root: &Path, path: &Path) -> Result<String, StoreError> {
  let relative = path
    .strip_prefix(root)
    .map_err(|_| StoreError::InvalidPath {
      path: path.to_path_buf(),
      message: format!("not under {}", root.display()),
    })?;
  normalize(relative)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
  false
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<(), StoreError> {
  use std::os::unix::fs::PermissionsExt;
  tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
  Ok(())
}

#[cfg(not(unix))]
async fn set_mode(path: &Path, mode: u32) -> Result<(), StoreError> {
  let mut permissions = tokio::fs::metadata(path).await?.permissions();
  permissions.set_readonly(mode & 0o200 == 0);
  tokio::fs::set_permissions(path, permissions).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Fingerprint, MemoryRemoteStore};

  fn store_with_remote(remote: Arc<MemoryRemoteStore>) -> (Store, Arc<MemoryByteStore>) {
    let local = Arc::new(MemoryByteStore::new());
    let store = Store::new(
      local.clone(),
      Some(RemoteTier::new(remote, 4)),
      DEFAULT_LARGE_FILE_THRESHOLD,
    );
    (store, local)
  }

  #[tokio::test]
  async fn test_store_twice_keeps_one_copy() {
    let local = Arc::new(MemoryByteStore::new());
    let store = Store::new(local.clone(), None, DEFAULT_LARGE_FILE_THRESHOLD);

    let a = store.store_bytes(Bytes::from_static(b"same")).await.unwrap();
    let b = store.store_bytes(Bytes::from_static(b"same")).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(local.len(), 1);
    assert_eq!(store.load_bytes_required(a).await.unwrap(), &b"same"[..]);
  }

  #[tokio::test]
  async fn test_corrupt_blob_is_a_miss() {
    let local = Arc::new(MemoryByteStore::new());
    let store = Store::new(local.clone(), None, DEFAULT_LARGE_FILE_THRESHOLD);
    let digest = store.store_bytes(Bytes::from_static(b"good")).await.unwrap();

    local.insert_raw(digest.hash, Bytes::from_static(b"evil"));
    assert!(store.load_bytes(digest).await.unwrap().is_none());
    assert!(local.is_empty());
  }

  #[tokio::test]
  async fn test_remote_fallback_populates_local() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let digest = Digest::of_bytes(b"remote only");
    remote
      .store(digest, Bytes::from_static(b"remote only"))
      .await
      .unwrap();

    let (store, local) = store_with_remote(remote.clone());
    assert_eq!(store.load_bytes_required(digest).await.unwrap(), &b"remote only"[..]);
    assert_eq!(local.len(), 1);

    store.load_bytes_required(digest).await.unwrap();
    assert_eq!(remote.load_count(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_remote_fetches_are_deduplicated() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let digest = Digest::of_bytes(b"shared");
    remote.store(digest, Bytes::from_static(b"shared")).await.unwrap();

    let (store, _) = store_with_remote(remote.clone());
    let (a, b) = tokio::join!(store.load_bytes(digest), store.load_bytes(digest));
    assert!(a.unwrap().is_some());
    assert!(b.unwrap().is_some());
    assert_eq!(remote.load_count(), 1);
  }

  #[tokio::test]
  async fn test_remote_errors_are_misses() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.fail_next(RemoteError::Unavailable("down".to_string()));
    let (store, _) = store_with_remote(remote);
    assert!(store.load_bytes(Digest::of_bytes(b"x")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_ensure_remote_has_uploads_tree_closure_once() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (store, _) = store_with_remote(remote.clone());

    let file = store.store_bytes(Bytes::from_static(b"main")).await.unwrap();
    let mut tree = DirectoryTree::new();
    tree
      .insert_file(
        "main.c",
        FileNode {
          digest: file,
          is_executable: false,
        },
      )
      .unwrap();
    let root = store.store_tree(&tree).await.unwrap();

    assert_eq!(store.ensure_remote_has(&[root]).await.unwrap(), 2);
    assert!(remote.contains(&file));
    assert_eq!(store.ensure_remote_has(&[root]).await.unwrap(), 0);
    assert_eq!(remote.upload_count(), 2);
  }

  #[tokio::test]
  async fn test_gc_keeps_leased_trees_and_their_files() {
    let local = Arc::new(MemoryByteStore::new());
    let store = Store::new(local.clone(), None, DEFAULT_LARGE_FILE_THRESHOLD);

    let kept_file = store.store_bytes(Bytes::from_static(b"kept")).await.unwrap();
    let garbage = store.store_bytes(Bytes::from_static(b"garbage!")).await.unwrap();
    let mut tree = DirectoryTree::new();
    tree
      .insert_file(
        "kept.txt",
        FileNode {
          digest: kept_file,
          is_executable: false,
        },
      )
      .unwrap();
    let root = store.store_tree(&tree).await.unwrap();
    store.lease(root);

    let report = store.garbage_collect(&[]).await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.reclaimed_bytes, garbage.size_bytes);
    assert!(store.contains_local(kept_file).await.unwrap());
    assert!(!store.contains_local(garbage).await.unwrap());

    store.release(root);
    assert_eq!(store.lease_count(root), 0);
    let report = store.garbage_collect(&[]).await.unwrap();
    assert_eq!(report.removed, 2);
    assert!(local.is_empty());
  }

  #[test]
  fn test_file_modes() {
    let store = Store::new(Arc::new(MemoryByteStore::new()), None, 10);
    let small = FileNode {
      digest: Digest::new(Fingerprint([0; 32]), 5),
      is_executable: false,
    };
    let large = FileNode {
      digest: Digest::new(Fingerprint([0; 32]), 11),
      is_executable: false,
    };
    let tool = FileNode {
      digest: small.digest,
      is_executable: true,
    };
    assert_eq!(store.file_mode(&small), 0o444);
    assert_eq!(store.file_mode(&large), 0o644);
    assert_eq!(store.file_mode(&tool), 0o755);
  }
}
