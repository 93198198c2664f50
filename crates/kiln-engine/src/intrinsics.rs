//! Rules every engine provides: running processes, reading sources,
//! snapshotting paths and reading the environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use kiln_graph::{Cause, ExecutionEvent, Failure, RuleFn, rule};
use kiln_process::{
  CacheScope, CommandRunner, ExecutionMode, FallibleProcessResult, ProcessError, ProcessRequest,
  ProcessResultMetadata, RunContext,
};
use kiln_rules::{Rule, TypeKey, Value};
use kiln_store::{Digest, Store};
use kiln_watch::{ChangeTracker, LineRange};
use tracing::debug;

/// How much of stderr a failed process reports.
const STDERR_EXCERPT_BYTES: usize = 4096;

/// The result of a process that exited with status 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessResult {
  pub stdout_digest: Digest,
  pub stderr_digest: Digest,
  pub output_digest: Digest,
  pub metadata: ProcessResultMetadata,
}

/// A workspace file, or a block of its lines, to read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceFile {
  /// Relative to the workspace root.
  pub path: PathBuf,
  /// Zero-based, half-open. `None` reads the whole file.
  pub lines: Option<LineRange>,
}

impl SourceFile {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      lines: None,
    }
  }

  pub fn lines(path: impl Into<PathBuf>, lines: LineRange) -> Self {
    Self {
      path: path.into(),
      lines: Some(lines),
    }
  }
}

/// What was read for a [`SourceFile`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileContent {
  pub path: PathBuf,
  pub digest: Digest,
  pub content: Bytes,
}

impl FileContent {
  pub fn text(&self) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(&self.content)
  }
}

/// Workspace paths to capture into one tree. Directories are captured
/// recursively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSnapshotRequest {
  pub paths: Vec<PathBuf>,
}

impl PathSnapshotRequest {
  pub fn new<I, P>(paths: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
  {
    let mut paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
    paths.sort();
    paths.dedup();
    Self { paths }
  }
}

/// A captured directory tree, usable as a process input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Snapshot {
  pub digest: Digest,
  files: Vec<String>,
  directories: Vec<String>,
}

impl Snapshot {
  pub fn files(&self) -> &[String] {
    &self.files
  }

  pub fn directories(&self) -> &[String] {
    &self.directories
  }
}

/// Environment variables to copy from the engine's environment. Only
/// allow-listed names may be requested; an empty request means the whole
/// allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EnvironmentVarsRequest {
  pub names: Vec<String>,
}

impl EnvironmentVarsRequest {
  pub fn new<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
    names.sort();
    names.dedup();
    Self { names }
  }

  pub fn allowed() -> Self {
    Self::default()
  }
}

/// Variables that were set, by name. Unset names are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EnvironmentVars(pub BTreeMap<String, String>);

impl EnvironmentVars {
  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(name).map(String::as_str)
  }

  /// Add every variable to `request`'s environment.
  pub fn apply(&self, mut request: ProcessRequest) -> ProcessRequest {
    for (name, value) in &self.0 {
      request = request.with_env(name.clone(), value.clone());
    }
    request
  }
}

/// Digests a memoized value keeps alive in the store.
pub(crate) fn referenced_digests(value: &Value) -> Vec<Digest> {
  if let Some(result) = value.downcast_ref::<FallibleProcessResult>() {
    return result.digests().to_vec();
  }
  if let Some(result) = value.downcast_ref::<ProcessResult>() {
    return vec![
      result.stdout_digest,
      result.stderr_digest,
      result.output_digest,
    ];
  }
  if let Some(content) = value.downcast_ref::<FileContent>() {
    return vec![content.digest];
  }
  if let Some(snapshot) = value.downcast_ref::<Snapshot>() {
    return vec![snapshot.digest];
  }
  Vec::new()
}

fn failed(message: String, error: impl std::error::Error + Send + Sync + 'static) -> Failure {
  Failure::new(Cause::Failed {
    message,
    source: Some(Arc::new(error)),
  })
}

/// `ProcessRequest -> FallibleProcessResult`. A non-zero exit is a value.
pub(crate) fn run_process(runner: Arc<dyn CommandRunner>) -> Rule<RuleFn> {
  rule::<FallibleProcessResult, _, _>("process_run", move |ctx| {
    let runner = runner.clone();
    async move {
      let request = ctx.input::<ProcessRequest>()?;
      let session_only = matches!(
        request.cache_scope,
        CacheScope::PerSession | CacheScope::Never
      ) || request.execution_mode == ExecutionMode::Workspace;
      if session_only {
        ctx.set_session_scoped();
      }

      let context = RunContext {
        run_id: ctx.session().as_u64(),
      };
      let result = runner
        .run(&request, context)
        .await
        .map_err(Failure::from_error)?;
      ctx.notify(ExecutionEvent::ProcessFinished {
        description: request.description.clone(),
        source: result.metadata.source.to_string(),
        exit_code: result.exit_code,
        elapsed: result.metadata.total_elapsed,
      });
      Ok(result)
    }
  })
  .input(TypeKey::of::<ProcessRequest>())
}

/// `ProcessRequest -> ProcessResult`. A non-zero exit fails with the tail of
/// stderr.
pub(crate) fn run_successful_process(store: Store) -> Rule<RuleFn> {
  rule::<ProcessResult, _, _>("process_run_successful", move |ctx| {
    let store = store.clone();
    async move {
      let request = ctx.input::<ProcessRequest>()?;
      let result = ctx.input::<FallibleProcessResult>()?;
      if result.succeeded() {
        return Ok(ProcessResult {
          stdout_digest: result.stdout_digest,
          stderr_digest: result.stderr_digest,
          output_digest: result.output_digest,
          metadata: result.metadata.clone(),
        });
      }

      let stderr = match store.load_bytes(result.stderr_digest).await {
        Ok(Some(bytes)) => excerpt(&bytes),
        Ok(None) => String::new(),
        Err(e) => {
          debug!(error = %e, "stderr unavailable");
          String::new()
        }
      };
      Err(Failure::from_error(ProcessError::NonZeroExit {
        description: request.description.clone(),
        exit_code: result.exit_code,
        stderr,
      }))
    }
  })
  .input(TypeKey::of::<ProcessRequest>())
  .input(TypeKey::of::<FallibleProcessResult>())
}

fn excerpt(bytes: &[u8]) -> String {
  let start = bytes.len().saturating_sub(STDERR_EXCERPT_BYTES);
  let text = String::from_utf8_lossy(&bytes[start..]);
  text.trim_end().to_string()
}

/// `SourceFile -> FileContent`. Declares the file, or just the block, as a
/// source of the reading node.
pub(crate) fn read_source(
  store: Store,
  workspace_root: PathBuf,
  changes: Arc<ChangeTracker>,
) -> Rule<RuleFn> {
  rule::<FileContent, _, _>("source_read", move |ctx| {
    let store = store.clone();
    let workspace_root = workspace_root.clone();
    let changes = changes.clone();
    async move {
      let source = ctx.input::<SourceFile>()?;
      // Declared before reading so an edit racing the read still reaches us.
      ctx.declare_source(&source.path, source.lines);

      let absolute = workspace_root.join(&source.path);
      let bytes = tokio::fs::read(&absolute)
        .await
        .map_err(|e| failed(format!("reading {}: {}", source.path.display(), e), e))?;

      let content = match source.lines {
        None => Bytes::from(bytes),
        Some(block) => {
          let text = String::from_utf8_lossy(&bytes);
          changes.remember(&source.path, &text);
          Bytes::from(select_lines(&text, block))
        }
      };
      let digest = store
        .store_bytes(content.clone())
        .await
        .map_err(|e| failed(format!("storing {}: {}", source.path.display(), e), e))?;

      Ok(FileContent {
        path: source.path.clone(),
        digest,
        content,
      })
    }
  })
  .input(TypeKey::of::<SourceFile>())
}

fn select_lines(text: &str, block: LineRange) -> String {
  text
    .split_inclusive('\n')
    .enumerate()
    .filter(|(index, _)| block.contains(*index))
    .map(|(_, line)| line)
    .collect()
}

/// `PathSnapshotRequest -> Snapshot`. Every captured file becomes a source
/// of the snapshotting node.
pub(crate) fn snapshot_paths(store: Store, workspace_root: PathBuf) -> Rule<RuleFn> {
  rule::<Snapshot, _, _>("path_snapshot", move |ctx| {
    let store = store.clone();
    let workspace_root = workspace_root.clone();
    async move {
      let request = ctx.input::<PathSnapshotRequest>()?;
      for path in &request.paths {
        ctx.declare_source(path, None);
      }

      let (digest, tree) = store
        .snapshot_paths(&workspace_root, &request.paths)
        .await
        .map_err(|e| failed(format!("snapshotting: {}", e), e))?;
      let files: Vec<String> = tree.files().map(|(path, _)| path.to_string()).collect();
      for file in &files {
        ctx.declare_source(&PathBuf::from(file), None);
      }

      Ok(Snapshot {
        digest,
        files,
        directories: tree.directories().map(str::to_string).collect(),
      })
    }
  })
  .input(TypeKey::of::<PathSnapshotRequest>())
}

/// `EnvironmentVarsRequest -> EnvironmentVars`, restricted to `allowed`.
/// Results only live for the session that read them.
pub(crate) fn environment_vars(allowed: Vec<String>) -> Rule<RuleFn> {
  let allowed = Arc::new(allowed);
  rule::<EnvironmentVars, _, _>("environment_vars", move |ctx| {
    let allowed = allowed.clone();
    async move {
      let request = ctx.input::<EnvironmentVarsRequest>()?;
      ctx.set_session_scoped();

      let names: Vec<&String> = if request.names.is_empty() {
        allowed.iter().collect()
      } else {
        request.names.iter().collect()
      };
      let mut vars = BTreeMap::new();
      for name in names {
        if !allowed.contains(name) {
          return Err(Failure::msg(format!(
            "environment variable {} is not in the passthrough list",
            name
          )));
        }
        if let Ok(value) = std::env::var(name) {
          vars.insert(name.clone(), value);
        }
      }
      Ok(EnvironmentVars(vars))
    }
  })
  .input(TypeKey::of::<EnvironmentVarsRequest>())
}
