//! Kiln Store
//!
//! This crate provides the content-addressed storage for kiln. Blobs and
//! directory trees are immutable and identified by their [`Digest`]; storing
//! the same content twice is a no-op.
//!
//! The [`ByteStore`] trait defines the local backend layer (filesystem or
//! memory). [`Store`] layers verification, the optional [`RemoteStore`] tier,
//! deduplicated fetches, directory snapshots and garbage collection on top.
//! [`ActionCache`] maps process request digests to result digests.

mod action_cache;
mod digest;
mod fs;
mod memory;
pub mod remote;
mod store;
mod tree;

pub use action_cache::{ActionCache, ActionEntry, MemoryActionCache, SqliteActionCache};
pub use digest::{Digest, Fingerprint};
pub use fs::FsByteStore;
pub use memory::MemoryByteStore;
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteError, RemoteStore};
pub use store::{DEFAULT_LARGE_FILE_THRESHOLD, GcReport, RemoteTier, Store};
pub use tree::{DirectoryTree, FileNode};

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

/// Error type for content store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested blob is in neither the local nor the remote tier.
  #[error("blob not found: {0}")]
  NotFound(Digest),

  /// Stored content does not hash to its digest.
  #[error("blob {digest} is corrupt (content hashes to {actual})")]
  Corrupt { digest: Digest, actual: Digest },

  /// A digest string could not be parsed.
  #[error("invalid digest: {0}")]
  InvalidDigest(String),

  /// A blob expected to be a directory tree is not one.
  #[error("blob {0} is not a directory tree")]
  NotATree(Digest),

  /// A path escapes its root or is otherwise unusable in a tree.
  #[error("invalid path '{}': {message}", path.display())]
  InvalidPath { path: PathBuf, message: String },

  /// The remote tier failed.
  #[error("remote store error: {0}")]
  Remote(#[from] RemoteError),

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// Tree or cache entry (de)serialization failed.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// The action cache database failed.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("database migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),
}

/// Local blob storage backend.
///
/// Implementations store raw bytes under their fingerprint. They do not verify
/// content; [`Store`] does that on every load.
#[async_trait]
pub trait ByteStore: Send + Sync {
  /// Load a blob, or `None` if it is not present.
  async fn load(&self, fingerprint: Fingerprint) -> Result<Option<Bytes>, StoreError>;

  /// Store a blob. Storing a fingerprint that already exists is a no-op.
  async fn store(&self, fingerprint: Fingerprint, bytes: Bytes) -> Result<(), StoreError>;

  /// Check whether a blob is present.
  async fn exists(&self, fingerprint: Fingerprint) -> Result<bool, StoreError>;

  /// Remove a blob. Returns whether anything was removed.
  async fn remove(&self, fingerprint: Fingerprint) -> Result<bool, StoreError>;

  /// List every stored blob with its size.
  async fn list(&self) -> Result<Vec<(Fingerprint, u64)>, StoreError>;
}
