use std::path::PathBuf;

use thiserror::Error;

/// Errors from the filesystem watcher.
#[derive(Debug, Error)]
pub enum WatchError {
  /// The workspace root could not be resolved.
  #[error("cannot watch {}: {source}", path.display())]
  Root {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The platform watcher failed.
  #[error("watcher error: {0}")]
  Notify(#[from] notify::Error),
}
