use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings for the remote cache and remote execution tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the HTTP cache (`{store_url}/cas/{hash}`, `{store_url}/ac/{hash}`).
  pub store_url: String,
  /// Read results and blobs from the remote cache.
  #[serde(default = "default_true")]
  pub cache_read: bool,
  /// Write results and blobs to the remote cache.
  #[serde(default = "default_true")]
  pub cache_write: bool,
  /// Dispatch processes to a remote executor when one is available.
  #[serde(default)]
  pub execution: bool,
  /// Attempt ceiling for transient remote failures.
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_initial_backoff_ms")]
  pub initial_backoff_ms: u64,
  #[serde(default = "default_max_backoff_ms")]
  pub max_backoff_ms: u64,
  /// Maximum number of concurrent remote operations.
  #[serde(default = "default_fanout")]
  pub fanout: usize,
  /// Per-request timeout for remote store calls.
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,
}

impl RemoteConfig {
  /// Remote settings pointing at `store_url` with every other field defaulted.
  pub fn new(store_url: impl Into<String>) -> Self {
    Self {
      store_url: store_url.into(),
      cache_read: true,
      cache_write: true,
      execution: false,
      max_attempts: default_max_attempts(),
      initial_backoff_ms: default_initial_backoff_ms(),
      max_backoff_ms: default_max_backoff_ms(),
      fanout: default_fanout(),
      request_timeout_ms: default_request_timeout_ms(),
    }
  }

  pub(crate) fn validate(&self) -> Result<(), ConfigError> {
    if self.store_url.trim().is_empty() {
      return Err(ConfigError::invalid("remote.store_url", "must not be empty"));
    }
    if self.max_attempts == 0 {
      return Err(ConfigError::invalid(
        "remote.max_attempts",
        "must be at least 1",
      ));
    }
    if self.fanout == 0 {
      return Err(ConfigError::invalid("remote.fanout", "must be at least 1"));
    }
    if self.initial_backoff_ms > self.max_backoff_ms {
      return Err(ConfigError::invalid(
        "remote.initial_backoff_ms",
        "must not exceed max_backoff_ms",
      ));
    }
    Ok(())
  }
}

fn default_true() -> bool {
  true
}

fn default_max_attempts() -> u32 {
  3
}

fn default_initial_backoff_ms() -> u64 {
  100
}

fn default_max_backoff_ms() -> u64 {
  2_000
}

fn default_fanout() -> usize {
  16
}

fn default_request_timeout_ms() -> u64 {
  30_000
}
