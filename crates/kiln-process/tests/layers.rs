use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kiln_process::{
  CacheScope, CachingRunner, CommandRunner, FallibleProcessResult, ProcessError, ProcessRequest,
  ProcessResultMetadata, RemoteExecutor, RemoteRunner, ResultSource, RetryPolicy, RunContext,
};
use kiln_store::{
  ActionCache, DEFAULT_LARGE_FILE_THRESHOLD, Digest, MemoryActionCache, MemoryByteStore,
  MemoryRemoteStore, RemoteError, RemoteTier, Store,
};

/// Pretends to run a process: echoes the argv to stdout and exits with a
/// fixed code.
struct FakeRunner {
  store: Store,
  exit_code: i32,
  timeout: bool,
  runs: AtomicUsize,
}

impl FakeRunner {
  fn new(store: &Store) -> Arc<Self> {
    Self::exiting(store, 0)
  }

  fn exiting(store: &Store, exit_code: i32) -> Arc<Self> {
    Arc::new(Self {
      store: store.clone(),
      exit_code,
      timeout: false,
      runs: AtomicUsize::new(0),
    })
  }

  fn timing_out(store: &Store) -> Arc<Self> {
    Arc::new(Self {
      store: store.clone(),
      exit_code: 0,
      timeout: true,
      runs: AtomicUsize::new(0),
    })
  }

  fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl CommandRunner for FakeRunner {
  async fn run(
    &self,
    request: &ProcessRequest,
    context: RunContext,
  ) -> Result<FallibleProcessResult, ProcessError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    if self.timeout {
      return Err(ProcessError::Timeout {
        description: request.description.clone(),
        timeout_ms: 10,
      });
    }
    let stdout = Bytes::from(format!("{}\n", request.argv.join(" ")));
    let stdout_digest = self.store.store_bytes(stdout).await?;
    let output_digest = self.store.store_tree(&Default::default()).await?;
    Ok(FallibleProcessResult {
      exit_code: self.exit_code,
      stdout_digest,
      stderr_digest: Digest::empty(),
      output_digest,
      metadata: ProcessResultMetadata {
        total_elapsed: Duration::from_millis(1),
        source: ResultSource::Ran,
        source_run_id: context.run_id,
        environment: "local".to_string(),
      },
    })
  }
}

fn cached(inner: Arc<FakeRunner>, store: &Store) -> CachingRunner {
  let actions: Arc<dyn ActionCache> = Arc::new(MemoryActionCache::new());
  CachingRunner::new(inner, store.clone(), Some(actions))
}

fn shared_remote_store(remote: &Arc<MemoryRemoteStore>) -> Store {
  let tier = RemoteTier::new(remote.clone(), 4)
    .with_read(true)
    .with_write(true);
  Store::new(
    Arc::new(MemoryByteStore::new()),
    Some(tier),
    DEFAULT_LARGE_FILE_THRESHOLD,
  )
}

fn fast_retries() -> RetryPolicy {
  RetryPolicy {
    max_attempts: 3,
    initial_backoff: Duration::from_millis(1),
    max_backoff: Duration::from_millis(5),
  }
}

#[tokio::test]
async fn test_second_run_is_a_local_hit() {
  let store = Store::in_memory();
  let fake = FakeRunner::new(&store);
  let runner = cached(fake.clone(), &store);
  let request = ProcessRequest::new(["echo", "hi"]);

  let first = runner.run(&request, RunContext { run_id: 1 }).await.unwrap();
  let second = runner.run(&request, RunContext { run_id: 2 }).await.unwrap();

  assert_eq!(fake.runs(), 1);
  assert_eq!(first.metadata.source, ResultSource::Ran);
  assert_eq!(second.metadata.source, ResultSource::HitLocally);
  assert_eq!(second.metadata.source_run_id, 1);
  assert_eq!(second.stdout_digest, first.stdout_digest);
}

#[tokio::test]
async fn test_description_does_not_split_the_cache() {
  let store = Store::in_memory();
  let fake = FakeRunner::new(&store);
  let runner = cached(fake.clone(), &store);

  let request = ProcessRequest::new(["echo", "hi"]);
  runner.run(&request, RunContext::default()).await.unwrap();
  let renamed = request.clone().with_description("say hi");
  let hit = runner.run(&renamed, RunContext::default()).await.unwrap();

  assert_eq!(fake.runs(), 1);
  assert_eq!(hit.metadata.source, ResultSource::HitLocally);
}

#[tokio::test]
async fn test_failures_are_cached_only_when_always() {
  let store = Store::in_memory();
  let fake = FakeRunner::exiting(&store, 1);
  let runner = cached(fake.clone(), &store);

  let request = ProcessRequest::new(["false"]);
  runner.run(&request, RunContext::default()).await.unwrap();
  let again = runner.run(&request, RunContext::default()).await.unwrap();
  assert_eq!(fake.runs(), 2);
  assert_eq!(again.metadata.source, ResultSource::Ran);

  let always = request.with_cache_scope(CacheScope::Always);
  runner.run(&always, RunContext::default()).await.unwrap();
  let hit = runner.run(&always, RunContext::default()).await.unwrap();
  assert_eq!(fake.runs(), 3);
  assert_eq!(hit.metadata.source, ResultSource::HitLocally);
  assert_eq!(hit.exit_code, 1);
}

#[tokio::test]
async fn test_session_and_never_scopes_skip_the_persistent_cache() {
  let store = Store::in_memory();
  let fake = FakeRunner::new(&store);
  let runner = cached(fake.clone(), &store);

  for scope in [CacheScope::PerSession, CacheScope::Never] {
    let request = ProcessRequest::new(["date"]).with_cache_scope(scope);
    runner.run(&request, RunContext::default()).await.unwrap();
    runner.run(&request, RunContext::default()).await.unwrap();
  }
  assert_eq!(fake.runs(), 4);
}

#[tokio::test]
async fn test_workspace_results_are_not_cached() {
  let store = Store::in_memory();
  let fake = FakeRunner::new(&store);
  let runner = cached(fake.clone(), &store);

  let request = ProcessRequest::new(["make"]).in_workspace();
  runner.run(&request, RunContext::default()).await.unwrap();
  runner.run(&request, RunContext::default()).await.unwrap();
  assert_eq!(fake.runs(), 2);
}

#[tokio::test]
async fn test_timeouts_are_not_cached() {
  let store = Store::in_memory();
  let fake = FakeRunner::timing_out(&store);
  let runner = cached(fake.clone(), &store);
  let request = ProcessRequest::new(["sleep", "5"]).with_timeout(Duration::from_millis(10));

  for _ in 0..2 {
    let error = runner
      .run(&request, RunContext::default())
      .await
      .unwrap_err();
    assert!(matches!(error, ProcessError::Timeout { .. }));
  }
  assert_eq!(fake.runs(), 2);
}

#[tokio::test]
async fn test_remote_cache_is_shared_between_stores() {
  let remote = Arc::new(MemoryRemoteStore::new());
  let request = ProcessRequest::new(["echo", "shared"]);

  let first_store = shared_remote_store(&remote);
  let first_fake = FakeRunner::new(&first_store);
  let first = cached(first_fake.clone(), &first_store);
  let produced = first.run(&request, RunContext::default()).await.unwrap();
  assert!(remote.contains(&produced.stdout_digest));

  let second_store = shared_remote_store(&remote);
  let second_fake = FakeRunner::new(&second_store);
  let second = cached(second_fake.clone(), &second_store);
  let hit = second.run(&request, RunContext::default()).await.unwrap();
  assert_eq!(second_fake.runs(), 0);
  assert_eq!(hit.metadata.source, ResultSource::HitRemotely);

  let stdout = second_store
    .load_bytes_required(hit.stdout_digest)
    .await
    .unwrap();
  assert_eq!(&stdout[..], b"echo shared\n");

  // Recorded locally on the way through.
  let again = second.run(&request, RunContext::default()).await.unwrap();
  assert_eq!(again.metadata.source, ResultSource::HitLocally);
}

#[tokio::test]
async fn test_remote_cache_outage_is_a_miss() {
  let remote = Arc::new(MemoryRemoteStore::new());
  let store = shared_remote_store(&remote);
  let fake = FakeRunner::new(&store);
  let runner = CachingRunner::new(fake.clone(), store.clone(), None);

  remote.fail_next(RemoteError::Unavailable("down".to_string()));
  let result = runner
    .run(&ProcessRequest::new(["true"]), RunContext::default())
    .await
    .unwrap();
  assert_eq!(result.metadata.source, ResultSource::Ran);
  assert_eq!(fake.runs(), 1);
}

struct FailingExecutor {
  error: RemoteError,
  calls: AtomicUsize,
}

impl FailingExecutor {
  fn new(error: RemoteError) -> Arc<Self> {
    Arc::new(Self {
      error,
      calls: AtomicUsize::new(0),
    })
  }

  fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl RemoteExecutor for FailingExecutor {
  async fn execute(&self, _action: Digest, _request: Digest) -> Result<Digest, RemoteError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    Err(self.error.clone())
  }
}

#[tokio::test]
async fn test_unavailable_remote_retries_then_runs_locally() {
  let store = Store::in_memory();
  let fake = FakeRunner::new(&store);
  let executor = FailingExecutor::new(RemoteError::Unavailable("no workers".to_string()));
  let runner = RemoteRunner::new(executor.clone(), store.clone(), fake.clone(), fast_retries());

  let result = runner
    .run(&ProcessRequest::new(["echo", "x"]), RunContext::default())
    .await
    .unwrap();
  assert_eq!(executor.calls(), 3);
  assert_eq!(fake.runs(), 1);
  assert_eq!(result.metadata.environment, "local");
}

#[tokio::test]
async fn test_rejected_remote_falls_back_immediately() {
  let store = Store::in_memory();
  let fake = FakeRunner::new(&store);
  let executor = FailingExecutor::new(RemoteError::Rejected("bad action".to_string()));
  let runner = RemoteRunner::new(executor.clone(), store.clone(), fake.clone(), fast_retries());

  runner
    .run(&ProcessRequest::new(["echo", "x"]), RunContext::default())
    .await
    .unwrap();
  assert_eq!(executor.calls(), 1);
  assert_eq!(fake.runs(), 1);
}

#[tokio::test]
async fn test_without_fallback_surfaces_remote_errors() {
  let store = Store::in_memory();
  let fake = FakeRunner::new(&store);
  let request = ProcessRequest::new(["echo", "x"]);

  let rejected = FailingExecutor::new(RemoteError::Rejected("bad action".to_string()));
  let runner = RemoteRunner::new(rejected, store.clone(), fake.clone(), fast_retries())
    .without_fallback();
  let error = runner
    .run(&request, RunContext::default())
    .await
    .unwrap_err();
  assert!(matches!(error, ProcessError::RemoteFailed { .. }));

  let busy = FailingExecutor::new(RemoteError::ResourceExhausted("queue full".to_string()));
  let runner =
    RemoteRunner::new(busy.clone(), store.clone(), fake.clone(), fast_retries()).without_fallback();
  let error = runner
    .run(&request, RunContext::default())
    .await
    .unwrap_err();
  assert!(matches!(error, ProcessError::RemoteUnavailable { attempts: 3, .. }));
  assert_eq!(busy.calls(), 3);
  assert_eq!(fake.runs(), 0);
}

/// Executes on a "worker" with its own local store, exchanging blobs with
/// the client only through the shared remote store.
struct LoopbackExecutor {
  store: Store,
  worker: Arc<dyn CommandRunner>,
}

fn invalid(error: impl std::fmt::Display) -> RemoteError {
  RemoteError::InvalidResponse(error.to_string())
}

#[async_trait]
impl RemoteExecutor for LoopbackExecutor {
  async fn execute(&self, _action: Digest, request: Digest) -> Result<Digest, RemoteError> {
    let bytes = self
      .store
      .load_bytes_required(request)
      .await
      .map_err(invalid)?;
    let request: ProcessRequest = serde_json::from_slice(&bytes).map_err(invalid)?;
    let result = self
      .worker
      .run(&request, RunContext::default())
      .await
      .map_err(|e| RemoteError::Rejected(e.to_string()))?;

    let encoded = serde_json::to_vec(&result).map_err(invalid)?;
    let digest = self
      .store
      .store_bytes(Bytes::from(encoded))
      .await
      .map_err(invalid)?;
    let mut roots = vec![digest];
    roots.extend(result.digests());
    self
      .store
      .ensure_remote_has(&roots)
      .await
      .map_err(invalid)?;
    Ok(digest)
  }
}

#[tokio::test]
async fn test_remote_execution_round_trip() {
  let remote = Arc::new(MemoryRemoteStore::new());
  let client = shared_remote_store(&remote);
  let worker_store = shared_remote_store(&remote);
  let worker = FakeRunner::new(&worker_store);
  let executor = Arc::new(LoopbackExecutor {
    store: worker_store,
    worker: worker.clone(),
  });

  let local = FakeRunner::new(&client);
  let runner = RemoteRunner::new(executor, client.clone(), local.clone(), fast_retries());
  let result = runner
    .run(&ProcessRequest::new(["echo", "far"]), RunContext { run_id: 9 })
    .await
    .unwrap();

  assert_eq!(worker.runs(), 1);
  assert_eq!(local.runs(), 0);
  assert_eq!(result.metadata.environment, "remote");
  assert_eq!(result.metadata.source_run_id, 9);
  let stdout = client.load_bytes_required(result.stdout_digest).await.unwrap();
  assert_eq!(&stdout[..], b"echo far\n");
}

/// Answers every execution with the same stored result, tracking how many
/// executions overlap.
struct GaugeExecutor {
  result: Digest,
  current: AtomicUsize,
  peak: AtomicUsize,
}

#[async_trait]
impl RemoteExecutor for GaugeExecutor {
  async fn execute(&self, _action: Digest, _request: Digest) -> Result<Digest, RemoteError> {
    let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(20)).await;
    self.current.fetch_sub(1, Ordering::SeqCst);
    Ok(self.result)
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_executions_respect_fanout_limit() {
  let tier = RemoteTier::new(Arc::new(MemoryRemoteStore::new()), 2)
    .with_read(true)
    .with_write(true);
  let store = Store::new(
    Arc::new(MemoryByteStore::new()),
    Some(tier),
    DEFAULT_LARGE_FILE_THRESHOLD,
  );
  let local = FakeRunner::new(&store);
  let canned = local
    .run(&ProcessRequest::new(["echo", "canned"]), RunContext::default())
    .await
    .unwrap();
  let result = store
    .store_bytes(Bytes::from(serde_json::to_vec(&canned).unwrap()))
    .await
    .unwrap();

  let executor = Arc::new(GaugeExecutor {
    result,
    current: AtomicUsize::new(0),
    peak: AtomicUsize::new(0),
  });
  let runner = Arc::new(RemoteRunner::new(
    executor.clone(),
    store.clone(),
    local.clone(),
    fast_retries(),
  ));

  let mut tasks = tokio::task::JoinSet::new();
  for n in 0..6 {
    let runner = runner.clone();
    tasks.spawn(async move {
      let request = ProcessRequest::new(["echo".to_string(), n.to_string()]);
      runner.run(&request, RunContext::default()).await
    });
  }
  while let Some(outcome) = tasks.join_next().await {
    assert_eq!(outcome.unwrap().unwrap().metadata.environment, "remote");
  }

  assert!(executor.peak.load(Ordering::SeqCst) <= 2);
  assert_eq!(local.runs(), 1);
}
