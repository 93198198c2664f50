//! The engine: request API over the scheduler, with the content store,
//! process runners and invalidation wired in.

use std::any::Any;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use kiln_config::EngineConfig;
use kiln_graph::{
  CompositeNotifier, ExecutionEvent, ExecutionNotifier, RuleFn, Scheduler, SchedulerConfig,
  SessionId,
};
use kiln_process::{
  BoundedRunner, CachingRunner, CommandRunner, FallibleProcessResult, LocalRunner, NamedCaches,
  RemoteExecutor, RemoteRunner, RetryPolicy,
};
use kiln_rules::{Params, Query, Rule, RuleRegistry, TypeKey, Value};
use kiln_store::{
  ActionCache, FsByteStore, GcReport, HttpRemoteStore, RemoteStore, RemoteTier,
  SqliteActionCache, Store,
};
use kiln_watch::{ChangeTracker, FsWatcher, InvalidationTracker, SourceEvent};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::intrinsics;
use crate::leases::LeaseNotifier;

const WATCH_BUFFER: usize = 1024;

/// Assembles an [`Engine`]: configuration, rules, and optional collaborators.
///
/// Registration closes when [`EngineBuilder::build`] runs; the rule set of a
/// built engine never changes.
pub struct EngineBuilder {
  config: EngineConfig,
  registry: RuleRegistry<RuleFn>,
  queries: Vec<Query>,
  notifier: Option<Arc<dyn ExecutionNotifier>>,
  remote_store: Option<Arc<dyn RemoteStore>>,
  remote_executor: Option<Arc<dyn RemoteExecutor>>,
  action_cache: Option<Arc<dyn ActionCache>>,
}

impl EngineBuilder {
  pub fn new(config: EngineConfig) -> Self {
    Self {
      config,
      registry: RuleRegistry::new(),
      queries: Vec::new(),
      notifier: None,
      remote_store: None,
      remote_executor: None,
      action_cache: None,
    }
  }

  pub fn rule(mut self, rule: Rule<RuleFn>) -> Self {
    self.registry.register(rule);
    self
  }

  pub fn rules(mut self, rules: impl IntoIterator<Item = Rule<RuleFn>>) -> Self {
    for rule in rules {
      self.registry.register(rule);
    }
    self
  }

  /// Resolve `query` when the engine is built, so a request shape that can
  /// never succeed fails at startup.
  pub fn validate_query(mut self, query: Query) -> Self {
    self.queries.push(query);
    self
  }

  /// Receive execution events.
  pub fn notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }

  /// Use `store` as the remote tier instead of the configured HTTP cache.
  /// The remote configuration still decides what the tier is used for.
  pub fn remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
    self.remote_store = Some(store);
    self
  }

  /// The service processes are dispatched to when remote execution is
  /// enabled.
  pub fn remote_executor(mut self, executor: Arc<dyn RemoteExecutor>) -> Self {
    self.remote_executor = Some(executor);
    self
  }

  /// Use `cache` instead of the SQLite action cache under the store
  /// directory.
  pub fn action_cache(mut self, cache: Arc<dyn ActionCache>) -> Self {
    self.action_cache = Some(cache);
    self
  }

  /// Open the store and caches and close rule registration.
  ///
  /// Must be called from within a tokio runtime, which the engine then uses
  /// for everything it spawns.
  pub async fn build(self) -> Result<Engine, EngineError> {
    let Self {
      config,
      mut registry,
      queries,
      notifier,
      remote_store,
      remote_executor,
      action_cache,
    } = self;
    config.validate()?;

    let remote_tier = match (&config.remote, remote_store) {
      (Some(remote), store) => {
        let store = match store {
          Some(store) => store,
          None => Arc::new(HttpRemoteStore::new(
            &remote.store_url,
            Duration::from_millis(remote.request_timeout_ms),
            remote.fanout,
          )?) as Arc<dyn RemoteStore>,
        };
        // Remote execution needs the inputs uploaded.
        Some(
          RemoteTier::new(store, remote.fanout)
            .with_read(remote.cache_read)
            .with_write(remote.cache_write || remote.execution),
        )
      }
      (None, Some(_)) => {
        return Err(EngineError::Setup {
          message: "a remote store was provided without a remote configuration".to_string(),
        });
      }
      (None, None) => None,
    };
    let store = Store::new(
      Arc::new(FsByteStore::new(&config.store_dir)),
      remote_tier,
      config.large_file_threshold_bytes,
    );

    let actions = if config.local_cache {
      Some(match action_cache {
        Some(cache) => cache,
        None => Arc::new(SqliteActionCache::open(&config.action_cache_path()).await?)
          as Arc<dyn ActionCache>,
      })
    } else {
      None
    };

    let runner = build_runner(&config, &store, actions.clone(), remote_executor)?;
    let changes = Arc::new(ChangeTracker::new(&config.workspace_root));

    registry
      .register(intrinsics::run_process(runner))
      .register(intrinsics::run_successful_process(store.clone()))
      .register(intrinsics::read_source(
        store.clone(),
        config.workspace_root.clone(),
        changes.clone(),
      ))
      .register(intrinsics::snapshot_paths(
        store.clone(),
        config.workspace_root.clone(),
      ))
      .register(intrinsics::environment_vars(config.env_passthrough.clone()));
    let rule_count = registry.len();
    let rules = registry.build().map_err(|source| EngineError::Resolve {
      query: "rule registration".to_string(),
      source,
    })?;

    let mut composite = CompositeNotifier::new().with(Arc::new(LeaseNotifier::new(store.clone())));
    if let Some(notifier) = notifier {
      composite = composite.with(notifier);
    }
    let notifier: Arc<dyn ExecutionNotifier> = Arc::new(composite);

    let scheduler = Scheduler::new(
      rules,
      SchedulerConfig {
        max_invalidation_retries: config.max_invalidation_retries as usize,
      },
      notifier.clone(),
    );
    for query in &queries {
      scheduler
        .rule_graph()
        .resolve(query)
        .map_err(|source| EngineError::Resolve {
          query: query.to_string(),
          source,
        })?;
    }

    let tracker = InvalidationTracker::new(changes.clone(), Arc::new(scheduler.clone()));
    let session = scheduler.new_session();
    info!(
      rules = rule_count,
      store = %config.store_dir.display(),
      workspace = %config.workspace_root.display(),
      remote = config.remote.is_some(),
      "engine started"
    );

    Ok(Engine {
      config,
      scheduler,
      store,
      actions,
      changes,
      tracker,
      notifier,
      session: RwLock::new(session),
      collecting: tokio::sync::RwLock::new(()),
      handle: Handle::current(),
    })
  }
}

fn build_runner(
  config: &EngineConfig,
  store: &Store,
  actions: Option<Arc<dyn ActionCache>>,
  executor: Option<Arc<dyn RemoteExecutor>>,
) -> Result<Arc<dyn CommandRunner>, EngineError> {
  // Only local processes count against the concurrency limit; remote
  // executions are bounded by the remote tier's fan-out.
  let local: Arc<dyn CommandRunner> = Arc::new(BoundedRunner::new(
    Arc::new(LocalRunner::new(
      store.clone(),
      NamedCaches::new(config.named_caches_dir.clone()),
      config.workspace_root.clone(),
    )),
    config.process_concurrency,
  ));

  let dispatch = match (&config.remote, executor) {
    (Some(remote), Some(executor)) if remote.execution => {
      let policy = RetryPolicy {
        max_attempts: remote.max_attempts,
        initial_backoff: Duration::from_millis(remote.initial_backoff_ms),
        max_backoff: Duration::from_millis(remote.max_backoff_ms),
      };
      Arc::new(RemoteRunner::new(executor, store.clone(), local, policy)) as Arc<dyn CommandRunner>
    }
    (Some(remote), None) if remote.execution => {
      return Err(EngineError::Setup {
        message: "remote execution is enabled but no remote executor was provided".to_string(),
      });
    }
    (_, Some(_)) => {
      warn!("remote executor provided but remote execution is disabled");
      local
    }
    (_, None) => local,
  };

  Ok(Arc::new(CachingRunner::new(dispatch, store.clone(), actions)))
}

/// Serves typed requests against a closed rule set.
///
/// Requests run concurrently; identical nodes are shared between them and
/// memoized until a source they read changes.
pub struct Engine {
  config: EngineConfig,
  scheduler: Scheduler,
  store: Store,
  actions: Option<Arc<dyn ActionCache>>,
  changes: Arc<ChangeTracker>,
  tracker: InvalidationTracker,
  notifier: Arc<dyn ExecutionNotifier>,
  session: RwLock<SessionId>,
  /// Held shared by requests and exclusively by garbage collection, so blobs
  /// a request stored but has not yet leased are never collected.
  collecting: tokio::sync::RwLock<()>,
  handle: Handle,
}

impl Engine {
  pub fn builder(config: EngineConfig) -> EngineBuilder {
    EngineBuilder::new(config)
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn scheduler(&self) -> &Scheduler {
    &self.scheduler
  }

  /// The session new requests run in.
  pub fn session(&self) -> SessionId {
    *self.session.read().unwrap_or_else(|e| e.into_inner())
  }

  /// Start a new session. Session-scoped results from earlier sessions are
  /// recomputed when next requested.
  pub fn new_session(&self) -> SessionId {
    let session = self.scheduler.new_session();
    *self.session.write().unwrap_or_else(|e| e.into_inner()) = session;
    debug!(session = %session, "session started");
    session
  }

  /// Compute a `T` from `params`.
  pub async fn execute<T: Any + Send + Sync>(&self, params: Params) -> Result<Arc<T>, EngineError> {
    let output = TypeKey::of::<T>();
    let query = describe(output, &params);
    let value = self
      .execute_value(output, params, CancellationToken::new())
      .await?;
    value.downcast::<T>().ok_or_else(|| EngineError::Failed {
      query,
      failure: kiln_graph::Failure::new(kiln_graph::Cause::TypeMismatch {
        expected: output,
        actual: value.type_key(),
      }),
    })
  }

  /// Compute `output` from `params`, giving up when `cancel` fires.
  ///
  /// Cancelling withdraws this request only; nodes other requests are still
  /// waiting for keep running.
  #[instrument(name = "engine_execute", skip(self, params, cancel), fields(output = %output))]
  pub async fn execute_value(
    &self,
    output: TypeKey,
    params: Params,
    cancel: CancellationToken,
  ) -> Result<Value, EngineError> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let query = describe(output, &params);
    let session = self.session();
    self.notifier.notify(ExecutionEvent::RequestStarted {
      request_id: request_id.clone(),
      query: query.clone(),
    });

    let started = Instant::now();
    let _running = self.collecting.read().await;
    let result = tokio::select! {
      result = self.scheduler.request(output, params, session) => {
        result.map_err(|failure| EngineError::from_failure(query.clone(), failure))
      }
      _ = cancel.cancelled() => Err(EngineError::Cancelled { query: query.clone() }),
    };

    match &result {
      Ok(_) => {
        let elapsed = started.elapsed();
        info!(
          request_id = %request_id,
          elapsed_ms = elapsed.as_millis() as u64,
          "request completed"
        );
        self.notifier.notify(ExecutionEvent::RequestCompleted {
          request_id,
          elapsed,
        });
      }
      Err(e) => {
        warn!(request_id = %request_id, error = %e, "request failed");
        self.notifier.notify(ExecutionEvent::RequestFailed {
          request_id,
          error: e.to_string(),
        });
      }
    }
    result
  }

  /// [`Engine::execute`] for callers outside the runtime. Panics if called
  /// from within an async context.
  pub fn execute_blocking<T: Any + Send + Sync>(
    &self,
    params: Params,
  ) -> Result<Arc<T>, EngineError> {
    self.handle.block_on(self.execute::<T>(params))
  }

  /// Apply a batch of source changes. Returns how many nodes were
  /// invalidated.
  pub async fn invalidate(&self, events: &[SourceEvent]) -> usize {
    self.tracker.apply(events).await
  }

  /// Drop every memoized node.
  pub fn invalidate_all(&self) -> usize {
    self.scheduler.invalidate_all()
  }

  /// Watch the workspace and invalidate as files change, until `cancel`
  /// fires or the returned handle is dropped.
  pub fn watch(
    &self,
    debounce: Duration,
    cancel: CancellationToken,
  ) -> Result<WatchHandle, EngineError> {
    let (sender, receiver) = mpsc::channel(WATCH_BUFFER);
    let watcher = FsWatcher::start(&self.config.workspace_root, debounce, sender)?;
    let tracker = InvalidationTracker::new(self.changes.clone(), Arc::new(self.scheduler.clone()));
    let task = self.handle.spawn(tracker.run(receiver, cancel));
    info!(root = %watcher.root().display(), "watching workspace");
    Ok(WatchHandle {
      _watcher: watcher,
      task,
    })
  }

  /// Remove local blobs that no memoized node and no action cache entry
  /// references.
  ///
  /// Waits for requests in flight to finish; requests made meanwhile wait for
  /// the collection.
  pub async fn garbage_collect(&self) -> Result<GcReport, EngineError> {
    let _exclusive = self.collecting.write().await;
    debug!("garbage collection started");
    let mut roots = Vec::new();
    if let Some(actions) = &self.actions {
      for entry in actions.entries().await? {
        roots.push(entry.result);
        let Some(bytes) = self.store.load_bytes(entry.result).await? else {
          continue;
        };
        match serde_json::from_slice::<FallibleProcessResult>(&bytes) {
          Ok(result) => roots.extend(result.digests()),
          Err(e) => warn!(action = %entry.action, error = %e, "action cache entry undecodable"),
        }
      }
    }
    Ok(self.store.garbage_collect(&roots).await?)
  }
}

/// A running workspace watch.
pub struct WatchHandle {
  _watcher: FsWatcher,
  task: JoinHandle<()>,
}

impl WatchHandle {
  /// Wait for the watch to end, after its cancellation token fires.
  pub async fn stopped(self) {
    let Self { _watcher, task } = self;
    if let Err(e) = task.await {
      warn!(error = %e, "watch task ended abnormally");
    }
  }
}

fn describe(output: TypeKey, params: &Params) -> String {
  format!("{}({})", output, params)
}
