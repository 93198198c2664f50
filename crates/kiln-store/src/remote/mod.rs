//! Remote cache tier.
//!
//! The remote tier is content-addressed like the local store: blobs are fetched
//! and uploaded by digest, and the remote action cache maps a process request
//! digest to the digest of its serialized result.

mod http;
mod memory;

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Digest;

/// Errors reported by a remote service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
  /// The service could not be reached or asked us to come back later.
  #[error("remote unavailable: {0}")]
  Unavailable(String),

  /// The service is overloaded or out of quota.
  #[error("remote resource exhausted: {0}")]
  ResourceExhausted(String),

  /// The service returned a response we could not use.
  #[error("invalid remote response: {0}")]
  InvalidResponse(String),

  /// The service rejected the request permanently.
  #[error("remote request rejected: {0}")]
  Rejected(String),
}

impl RemoteError {
  /// Transient errors are worth retrying with backoff.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Unavailable(_) | Self::ResourceExhausted(_))
  }
}

/// A remote content store plus action cache.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Fetch a blob, or `None` if the remote does not have it.
  async fn load(&self, digest: Digest) -> Result<Option<Bytes>, RemoteError>;

  /// Upload a blob.
  async fn store(&self, digest: Digest, bytes: Bytes) -> Result<(), RemoteError>;

  /// Return the subset of `digests` the remote does not have.
  async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, RemoteError>;

  /// Look up the result digest recorded for an action.
  async fn get_action(&self, action: Digest) -> Result<Option<Digest>, RemoteError>;

  /// Record the result digest for an action.
  async fn put_action(&self, action: Digest, result: Digest) -> Result<(), RemoteError>;
}
