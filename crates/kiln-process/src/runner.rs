use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{FallibleProcessResult, ProcessError, ProcessRequest};

const MEMORY_UNIT: u64 = 1024 * 1024;

/// Per-call information a runner needs besides the request itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunContext {
  /// Recorded as `source_run_id` on results produced by this call.
  pub run_id: u64,
}

/// Something that can execute a [`ProcessRequest`].
///
/// Runners compose: a caching runner wraps a bounded runner, which wraps a
/// remote runner, which falls back to a local one.
#[async_trait]
pub trait CommandRunner: Send + Sync {
  async fn run(
    &self,
    request: &ProcessRequest,
    context: RunContext,
  ) -> Result<FallibleProcessResult, ProcessError>;
}

/// Limits how many processes run at once, and optionally how much declared
/// memory they may claim together.
pub struct BoundedRunner {
  inner: Arc<dyn CommandRunner>,
  slots: Arc<Semaphore>,
  memory: Option<(Arc<Semaphore>, u32)>,
}

impl BoundedRunner {
  pub fn new(inner: Arc<dyn CommandRunner>, concurrency: usize) -> Self {
    Self {
      inner,
      slots: Arc::new(Semaphore::new(concurrency.max(1))),
      memory: None,
    }
  }

  /// Admit processes only while the sum of their `memory_limit_bytes` stays
  /// within `bytes`. Requests without a limit are not counted.
  pub fn with_memory_budget(mut self, bytes: u64) -> Self {
    let units = u32::try_from((bytes / MEMORY_UNIT).max(1)).unwrap_or(u32::MAX);
    self.memory = Some((Arc::new(Semaphore::new(units as usize)), units));
    self
  }

  pub fn available_slots(&self) -> usize {
    self.slots.available_permits()
  }
}

#[async_trait]
impl CommandRunner for BoundedRunner {
  async fn run(
    &self,
    request: &ProcessRequest,
    context: RunContext,
  ) -> Result<FallibleProcessResult, ProcessError> {
    let _memory = match (&self.memory, request.memory_limit_bytes) {
      (Some((budget, total)), Some(bytes)) => {
        let units = u32::try_from(bytes.div_ceil(MEMORY_UNIT))
          .unwrap_or(u32::MAX)
          .clamp(1, *total);
        Some(
          budget
            .clone()
            .acquire_many_owned(units)
            .await
            .map_err(|_| request.setup_error("memory budget closed"))?,
        )
      }
      _ => None,
    };
    let _slot = self
      .slots
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| request.setup_error("process slots closed"))?;
    debug!(description = %request.description, "process slot acquired");
    self.inner.run(request, context).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  use kiln_store::Digest;

  use crate::{ProcessResultMetadata, ResultSource};

  #[derive(Default)]
  struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
  }

  #[async_trait]
  impl CommandRunner for Gauge {
    async fn run(
      &self,
      _request: &ProcessRequest,
      context: RunContext,
    ) -> Result<FallibleProcessResult, ProcessError> {
      let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.running.fetch_sub(1, Ordering::SeqCst);
      Ok(FallibleProcessResult {
        exit_code: 0,
        stdout_digest: Digest::empty(),
        stderr_digest: Digest::empty(),
        output_digest: Digest::empty(),
        metadata: ProcessResultMetadata {
          total_elapsed: Duration::ZERO,
          source: ResultSource::Ran,
          source_run_id: context.run_id,
          environment: "test".to_string(),
        },
      })
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrency_is_bounded() {
    let gauge = Arc::new(Gauge::default());
    let runner = BoundedRunner::new(gauge.clone(), 2);
    let request = ProcessRequest::new(["/bin/true"]);

    let runs = (0..6).map(|_| runner.run(&request, RunContext::default()));
    for result in futures::future::join_all(runs).await {
      result.unwrap();
    }
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_memory_budget_limits_admission() {
    let gauge = Arc::new(Gauge::default());
    let runner = BoundedRunner::new(gauge.clone(), 8).with_memory_budget(100 * MEMORY_UNIT);
    let request = ProcessRequest::new(["/bin/true"]).with_memory_limit(60 * MEMORY_UNIT);

    let runs = (0..3).map(|_| runner.run(&request, RunContext::default()));
    for result in futures::future::join_all(runs).await {
      result.unwrap();
    }
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
  }
}
