use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use kiln_store::{Digest, RemoteError, Store};
use tracing::{info, instrument, warn};

use crate::{
  CommandRunner, ExecutionMode, FallibleProcessResult, ProcessError, ProcessRequest,
  ResultSource, RunContext,
};

/// Exponential backoff between attempts at a transiently failing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_backoff: Duration::from_millis(100),
      max_backoff: Duration::from_millis(2000),
    }
  }
}

impl RetryPolicy {
  /// How long to wait after failed attempt number `attempt` (1-based).
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self
      .initial_backoff
      .saturating_mul(factor)
      .min(self.max_backoff)
  }
}

/// A remote execution service.
///
/// The request and its inputs are referenced by digest; the service returns
/// the digest of a serialized [`FallibleProcessResult`] whose blobs it has
/// written to the shared store.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
  async fn execute(&self, action: Digest, request: Digest) -> Result<Digest, RemoteError>;
}

/// Dispatches processes to a [`RemoteExecutor`], retrying transient failures
/// with backoff and falling back to a local runner when the remote cannot
/// help.
///
/// Executions in flight count against the remote tier's fan-out limit. The
/// local runner is only bounded by whatever wraps it.
pub struct RemoteRunner {
  executor: Arc<dyn RemoteExecutor>,
  store: Store,
  local: Arc<dyn CommandRunner>,
  policy: RetryPolicy,
  fallback: bool,
}

impl RemoteRunner {
  pub fn new(
    executor: Arc<dyn RemoteExecutor>,
    store: Store,
    local: Arc<dyn CommandRunner>,
    policy: RetryPolicy,
  ) -> Self {
    Self {
      executor,
      store,
      local,
      policy,
      fallback: true,
    }
  }

  /// Fail instead of running locally when remote execution is unavailable.
  pub fn without_fallback(mut self) -> Self {
    self.fallback = false;
    self
  }

  async fn dispatch(
    &self,
    request: &ProcessRequest,
    context: RunContext,
  ) -> Result<FallibleProcessResult, RemoteError> {
    let started = Instant::now();
    let action = request.digest().map_err(|e| RemoteError::Rejected(e.to_string()))?;
    let encoded = serde_json::to_vec(request).map_err(|e| RemoteError::Rejected(e.to_string()))?;
    let request_digest = self
      .store
      .store_bytes(Bytes::from(encoded))
      .await
      .map_err(|e| RemoteError::Rejected(e.to_string()))?;

    // Only blobs the remote is missing are uploaded.
    let mut roots = vec![request_digest];
    roots.extend(request.input_digest);
    self.store.ensure_remote_has(&roots).await.map_err(as_remote)?;

    let result_digest = {
      let _permit = match self.store.remote() {
        Some(remote) => Some(remote.permit().await?),
        None => None,
      };
      self.executor.execute(action, request_digest).await?
    };
    let bytes = self
      .store
      .load_bytes(result_digest)
      .await
      .map_err(as_remote)?
      .ok_or_else(|| RemoteError::InvalidResponse(format!("result {} not found", result_digest)))?;
    let mut result: FallibleProcessResult = serde_json::from_slice(&bytes)
      .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
    result.metadata.source = ResultSource::Ran;
    result.metadata.source_run_id = context.run_id;
    result.metadata.environment = "remote".to_string();
    if result.metadata.total_elapsed.is_zero() {
      result.metadata.total_elapsed = started.elapsed();
    }
    Ok(result)
  }

  async fn fall_back(
    &self,
    request: &ProcessRequest,
    context: RunContext,
    error: ProcessError,
  ) -> Result<FallibleProcessResult, ProcessError> {
    if !self.fallback {
      return Err(error);
    }
    warn!(error = %error, "remote execution failed, running locally");
    self.local.run(request, context).await
  }
}

fn as_remote(error: kiln_store::StoreError) -> RemoteError {
  match error {
    kiln_store::StoreError::Remote(remote) => remote,
    other => RemoteError::Unavailable(other.to_string()),
  }
}

#[async_trait]
impl CommandRunner for RemoteRunner {
  #[instrument(
    name = "process_remote",
    skip(self, request, context),
    fields(description = %request.description)
  )]
  async fn run(
    &self,
    request: &ProcessRequest,
    context: RunContext,
  ) -> Result<FallibleProcessResult, ProcessError> {
    if request.execution_mode == ExecutionMode::Workspace {
      return self.local.run(request, context).await;
    }
    request.validate()?;

    let mut attempt = 0;
    loop {
      attempt += 1;
      let error = match self.dispatch(request, context).await {
        Ok(result) => return Ok(result),
        Err(error) => error,
      };

      if !error.is_transient() {
        let error = ProcessError::RemoteFailed {
          description: request.description.clone(),
          message: error.to_string(),
        };
        return self.fall_back(request, context, error).await;
      }
      if attempt >= self.policy.max_attempts {
        let error = ProcessError::RemoteUnavailable {
          description: request.description.clone(),
          attempts: attempt,
          message: error.to_string(),
        };
        return self.fall_back(request, context, error).await;
      }

      let delay = self.policy.backoff(attempt);
      info!(
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "remote retry"
      );
      tokio::time::sleep(delay).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy {
      max_attempts: 5,
      initial_backoff: Duration::from_millis(100),
      max_backoff: Duration::from_millis(300),
    };
    assert_eq!(policy.backoff(1), Duration::from_millis(100));
    assert_eq!(policy.backoff(2), Duration::from_millis(200));
    assert_eq!(policy.backoff(3), Duration::from_millis(300));
    assert_eq!(policy.backoff(40), Duration::from_millis(300));
  }
}
