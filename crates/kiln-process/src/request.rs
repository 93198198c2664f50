use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use kiln_store::Digest;
use serde::{Deserialize, Serialize};

use crate::ProcessError;

/// Which results of a process may be reused, and for how long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheScope {
  /// Cache every completed result, including non-zero exits.
  Always,
  /// Cache only results that exited with status 0.
  #[default]
  Successful,
  /// Reuse within the current session only. Never persisted.
  PerSession,
  /// Run every time it is requested.
  Never,
}

impl CacheScope {
  /// Whether a result with `exit_code` may be written to the persistent
  /// caches.
  pub fn persists(&self, exit_code: i32) -> bool {
    match self {
      CacheScope::Always => true,
      CacheScope::Successful => exit_code == 0,
      CacheScope::PerSession | CacheScope::Never => false,
    }
  }
}

/// Where a process runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
  /// In a fresh directory holding only the declared inputs.
  #[default]
  Sandboxed,
  /// Directly in the workspace. Outputs are not isolated, so results are
  /// never persisted.
  Workspace,
}

/// An immutable description of one subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessRequest {
  pub argv: Vec<String>,
  pub env: BTreeMap<String, String>,
  /// Tree materialized as the sandbox root. `None` starts empty.
  pub input_digest: Option<Digest>,
  /// Files to capture, relative to the working directory.
  pub output_files: BTreeSet<PathBuf>,
  /// Directories to capture recursively, relative to the working directory.
  pub output_directories: BTreeSet<PathBuf>,
  /// Relative to the sandbox root.
  pub working_directory: Option<PathBuf>,
  pub timeout: Option<Duration>,
  /// Memory the process is expected to need. Used for admission, not
  /// enforced.
  pub memory_limit_bytes: Option<u64>,
  pub description: String,
  /// Named caches to mount: cache name to path relative to the sandbox root.
  pub append_only_caches: BTreeMap<String, PathBuf>,
  pub cache_scope: CacheScope,
  pub execution_mode: ExecutionMode,
}

/// The fields that determine a process's output. Description and cache
/// policy are deliberately absent.
#[derive(Serialize)]
struct CacheKey<'a> {
  argv: &'a [String],
  env: &'a BTreeMap<String, String>,
  input_digest: &'a Option<Digest>,
  output_files: &'a BTreeSet<PathBuf>,
  output_directories: &'a BTreeSet<PathBuf>,
  working_directory: &'a Option<PathBuf>,
  timeout: &'a Option<Duration>,
  append_only_caches: &'a BTreeMap<String, PathBuf>,
}

impl ProcessRequest {
  pub fn new<I, S>(argv: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
    let description = argv.join(" ");
    Self {
      argv,
      env: BTreeMap::new(),
      input_digest: None,
      output_files: BTreeSet::new(),
      output_directories: BTreeSet::new(),
      working_directory: None,
      timeout: None,
      memory_limit_bytes: None,
      description,
      append_only_caches: BTreeMap::new(),
      cache_scope: CacheScope::default(),
      execution_mode: ExecutionMode::default(),
    }
  }

  pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  pub fn with_input(mut self, digest: Digest) -> Self {
    self.input_digest = Some(digest);
    self
  }

  pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
    self.output_files.insert(path.into());
    self
  }

  pub fn with_output_directory(mut self, path: impl Into<PathBuf>) -> Self {
    self.output_directories.insert(path.into());
    self
  }

  pub fn with_working_directory(mut self, path: impl Into<PathBuf>) -> Self {
    self.working_directory = Some(path.into());
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_memory_limit(mut self, bytes: u64) -> Self {
    self.memory_limit_bytes = Some(bytes);
    self
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn with_append_only_cache(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
    self.append_only_caches.insert(name.into(), path.into());
    self
  }

  pub fn with_cache_scope(mut self, scope: CacheScope) -> Self {
    self.cache_scope = scope;
    self
  }

  pub fn in_workspace(mut self) -> Self {
    self.execution_mode = ExecutionMode::Workspace;
    self
  }

  /// The digest identifying this request in the action cache.
  pub fn digest(&self) -> Result<Digest, ProcessError> {
    let key = CacheKey {
      argv: &self.argv,
      env: &self.env,
      input_digest: &self.input_digest,
      output_files: &self.output_files,
      output_directories: &self.output_directories,
      working_directory: &self.working_directory,
      timeout: &self.timeout,
      append_only_caches: &self.append_only_caches,
    };
    Ok(Digest::of_bytes(&serde_json::to_vec(&key)?))
  }

  /// Whether results of this request may be written to persistent caches at
  /// all.
  pub fn is_persistable(&self) -> bool {
    self.execution_mode == ExecutionMode::Sandboxed
      && matches!(self.cache_scope, CacheScope::Always | CacheScope::Successful)
  }

  /// Check that every declared path stays inside the sandbox.
  pub fn validate(&self) -> Result<(), ProcessError> {
    if self.argv.is_empty() {
      return Err(self.setup_error("argv is empty"));
    }
    let paths = self
      .output_files
      .iter()
      .chain(&self.output_directories)
      .chain(&self.working_directory)
      .chain(self.append_only_caches.values());
    for path in paths {
      if !is_contained(path) {
        return Err(self.setup_error(format!("path '{}' escapes the sandbox", path.display())));
      }
    }
    Ok(())
  }

  pub(crate) fn setup_error(&self, message: impl Into<String>) -> ProcessError {
    ProcessError::SandboxSetup {
      description: self.description.clone(),
      message: message.into(),
    }
  }
}

fn is_contained(path: &Path) -> bool {
  path
    .components()
    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
