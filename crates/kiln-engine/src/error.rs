//! Error types for engine setup and requests.

use kiln_config::ConfigError;
use kiln_graph::{Cause, Failure, Frame};
use kiln_process::ProcessError;
use kiln_rules::ResolveError;
use kiln_store::{RemoteError, StoreError};
use kiln_watch::WatchError;
use thiserror::Error;

/// Errors returned by the [`Engine`](crate::Engine).
#[derive(Debug, Error)]
pub enum EngineError {
  /// The request has no unambiguous plan. Nothing ran.
  #[error("cannot resolve {query}: {source}")]
  Resolve {
    query: String,
    #[source]
    source: ResolveError,
  },

  /// A rule on the request's path failed. The failure lists every rule from
  /// the request down to the one that failed.
  #[error("{query} failed: {failure}")]
  Failed { query: String, failure: Failure },

  /// The caller cancelled the request.
  #[error("{query} cancelled")]
  Cancelled { query: String },

  /// The engine could not be assembled from its configuration.
  #[error("invalid engine setup: {message}")]
  Setup { message: String },

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Remote(#[from] RemoteError),

  #[error(transparent)]
  Watch(#[from] WatchError),
}

impl EngineError {
  pub(crate) fn from_failure(query: String, failure: Failure) -> Self {
    if failure.is_cancelled() {
      return Self::Cancelled { query };
    }
    match failure.cause() {
      Cause::Resolve(source) if failure.frames().is_empty() => Self::Resolve {
        query,
        source: source.clone(),
      },
      _ => Self::Failed { query, failure },
    }
  }

  /// The rules between the request and the failing node, outermost first.
  pub fn frames(&self) -> &[Frame] {
    match self {
      Self::Failed { failure, .. } => failure.frames(),
      _ => &[],
    }
  }

  pub fn failure(&self) -> Option<&Failure> {
    match self {
      Self::Failed { failure, .. } => Some(failure),
      _ => None,
    }
  }

  /// The process error at the root of a failed request, if a process caused
  /// it.
  pub fn process_error(&self) -> Option<&ProcessError> {
    self.failure()?.downcast_source::<ProcessError>()
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled { .. })
  }
}
