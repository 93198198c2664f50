use std::fmt;
use std::time::Duration;

use kiln_store::Digest;
use serde::{Deserialize, Serialize};

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultSource {
  Ran,
  HitLocally,
  HitRemotely,
}

impl fmt::Display for ResultSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ResultSource::Ran => "ran",
      ResultSource::HitLocally => "hit_locally",
      ResultSource::HitRemotely => "hit_remotely",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessResultMetadata {
  /// Wall time of the run that produced the result.
  pub total_elapsed: Duration,
  pub source: ResultSource,
  /// The run that produced the result, which for a cache hit is an earlier
  /// one.
  pub source_run_id: u64,
  /// `local`, `workspace` or `remote`.
  pub environment: String,
}

/// The outcome of a process that ran to completion, whatever its exit code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FallibleProcessResult {
  pub exit_code: i32,
  pub stdout_digest: Digest,
  pub stderr_digest: Digest,
  /// Tree of the captured output files and directories.
  pub output_digest: Digest,
  pub metadata: ProcessResultMetadata,
}

impl FallibleProcessResult {
  pub fn succeeded(&self) -> bool {
    self.exit_code == 0
  }

  /// Every digest the result references.
  pub fn digests(&self) -> [Digest; 3] {
    [self.stdout_digest, self.stderr_digest, self.output_digest]
  }

  pub(crate) fn with_source(mut self, source: ResultSource) -> Self {
    self.metadata.source = source;
    self
  }
}
