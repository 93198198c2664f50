use kiln_store::StoreError;

/// Errors from running a process.
///
/// A program that runs and exits non-zero is not an error at this layer; it
/// is a [`FallibleProcessResult`](crate::FallibleProcessResult) with that exit
/// code. `NonZeroExit` exists for callers that require success.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
  #[error("process '{description}' exited with {exit_code}: {stderr}")]
  NonZeroExit {
    description: String,
    exit_code: i32,
    stderr: String,
  },

  #[error("process '{description}' timed out after {timeout_ms}ms")]
  Timeout { description: String, timeout_ms: u64 },

  #[error("could not set up sandbox for '{description}': {message}")]
  SandboxSetup { description: String, message: String },

  #[error("remote execution of '{description}' unavailable after {attempts} attempts: {message}")]
  RemoteUnavailable {
    description: String,
    attempts: u32,
    message: String,
  },

  #[error("remote execution of '{description}' failed: {message}")]
  RemoteFailed { description: String, message: String },

  #[error("store error: {0}")]
  Store(#[from] StoreError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}
