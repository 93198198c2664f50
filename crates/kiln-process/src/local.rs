use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use kiln_store::{Digest, Store};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::named_caches::CacheLease;
use crate::{
  CommandRunner, ExecutionMode, FallibleProcessResult, NamedCaches, ProcessError,
  ProcessRequest, ProcessResultMetadata, ResultSource, RunContext,
};

/// Runs processes as local subprocesses.
///
/// A sandboxed process gets a fresh temporary directory holding exactly its
/// input tree, an empty environment apart from what the request sets, and
/// its named caches linked in. Declared outputs are captured into the store
/// before the sandbox is removed.
pub struct LocalRunner {
  store: Store,
  named_caches: NamedCaches,
  workspace_root: PathBuf,
  sandbox_base: Option<PathBuf>,
  keep_sandboxes: bool,
}

impl LocalRunner {
  pub fn new(store: Store, named_caches: NamedCaches, workspace_root: impl Into<PathBuf>) -> Self {
    Self {
      store,
      named_caches,
      workspace_root: workspace_root.into(),
      sandbox_base: None,
      keep_sandboxes: false,
    }
  }

  /// Create sandboxes under `base` instead of the system temp directory.
  pub fn with_sandbox_base(mut self, base: impl Into<PathBuf>) -> Self {
    self.sandbox_base = Some(base.into());
    self
  }

  /// Leave sandboxes on disk after the run, for debugging.
  pub fn keep_sandboxes(mut self, keep: bool) -> Self {
    self.keep_sandboxes = keep;
    self
  }

  async fn prepare_sandbox(&self, request: &ProcessRequest) -> Result<tempfile::TempDir, ProcessError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("kiln-sandbox-");
    let sandbox = match &self.sandbox_base {
      Some(base) => {
        tokio::fs::create_dir_all(base)
          .await
          .map_err(|e| request.setup_error(e.to_string()))?;
        builder.tempdir_in(base)
      }
      None => builder.tempdir(),
    }
    .map_err(|e| request.setup_error(format!("creating sandbox: {}", e)))?;

    if let Some(input) = request.input_digest {
      self
        .store
        .materialize_directory(input, sandbox.path())
        .await
        .map_err(|e| request.setup_error(format!("materializing inputs: {}", e)))?;
    }
    Ok(sandbox)
  }

  async fn mount_caches(
    &self,
    request: &ProcessRequest,
    root: &Path,
  ) -> Result<Vec<CacheLease>, ProcessError> {
    let mut leases = Vec::with_capacity(request.append_only_caches.len());
    for (name, relative) in &request.append_only_caches {
      let lease = self.named_caches.acquire(name).await?;
      let link = root.join(relative);
      if let Some(parent) = link.parent() {
        tokio::fs::create_dir_all(parent)
          .await
          .map_err(|e| request.setup_error(e.to_string()))?;
      }
      symlink(lease.path(), &link)
        .await
        .map_err(|e| request.setup_error(format!("mounting cache {}: {}", name, e)))?;
      leases.push(lease);
    }
    Ok(leases)
  }

  async fn capture_outputs(&self, request: &ProcessRequest, cwd: &Path) -> Result<Digest, ProcessError> {
    let mut present = Vec::new();
    for path in request.output_files.iter().chain(&request.output_directories) {
      match tokio::fs::symlink_metadata(cwd.join(path)).await {
        Ok(_) => present.push(path.clone()),
        Err(_) => debug!(path = %path.display(), "declared output missing"),
      }
    }
    let (digest, _) = self.store.snapshot_paths(cwd, &present).await?;
    Ok(digest)
  }
}

#[async_trait]
impl CommandRunner for LocalRunner {
  #[instrument(
    name = "process_run",
    skip(self, request, context),
    fields(description = %request.description, run_id = context.run_id)
  )]
  async fn run(
    &self,
    request: &ProcessRequest,
    context: RunContext,
  ) -> Result<FallibleProcessResult, ProcessError> {
    request.validate()?;
    let started = Instant::now();

    let (sandbox, root, environment) = match request.execution_mode {
      ExecutionMode::Sandboxed => {
        let sandbox = self.prepare_sandbox(request).await?;
        let root = sandbox.path().to_path_buf();
        (Some(sandbox), root, "local")
      }
      ExecutionMode::Workspace => (None, self.workspace_root.clone(), "workspace"),
    };
    let leases = self.mount_caches(request, &root).await?;
    let cwd = match &request.working_directory {
      Some(dir) => root.join(dir),
      None => root.clone(),
    };

    let mut command = Command::new(&request.argv[0]);
    command
      .args(&request.argv[1..])
      .env_clear()
      .envs(&request.env)
      .current_dir(&cwd)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    let child = command
      .spawn()
      .map_err(|e| request.setup_error(format!("spawning {}: {}", request.argv[0], e)))?;
    debug!(pid = child.id(), "process spawned");

    let output = match request.timeout {
      Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(output) => output,
        Err(_) => {
          warn!(timeout_ms = limit.as_millis() as u64, "process timed out");
          return Err(ProcessError::Timeout {
            description: request.description.clone(),
            timeout_ms: limit.as_millis() as u64,
          });
        }
      },
      None => child.wait_with_output().await,
    }
    .map_err(|e| request.setup_error(format!("waiting for process: {}", e)))?;
    drop(leases);

    // Killed by a signal: no exit code. Report it the way shells do.
    let exit_code = output.status.code().unwrap_or_else(|| signal_exit_code(&output.status));
    let output_digest = self.capture_outputs(request, &cwd).await?;
    let stdout_digest = self.store.store_bytes(Bytes::from(output.stdout)).await?;
    let stderr_digest = self.store.store_bytes(Bytes::from(output.stderr)).await?;

    if let Some(sandbox) = sandbox
      && self.keep_sandboxes
    {
      let kept = sandbox.keep();
      debug!(sandbox = %kept.display(), "sandbox kept");
    }

    let total_elapsed = started.elapsed();
    debug!(exit_code, elapsed_ms = total_elapsed.as_millis() as u64, "process finished");
    Ok(FallibleProcessResult {
      exit_code,
      stdout_digest,
      stderr_digest,
      output_digest,
      metadata: ProcessResultMetadata {
        total_elapsed,
        source: ResultSource::Ran,
        source_run_id: context.run_id,
        environment: environment.to_string(),
      },
    })
  }
}

#[cfg(unix)]
fn signal_exit_code(status: &std::process::ExitStatus) -> i32 {
  use std::os::unix::process::ExitStatusExt;
  status.signal().map_or(-1, |signal| 128 + signal)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &std::process::ExitStatus) -> i32 {
  -1
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
  tokio::fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
  Err(std::io::Error::new(
    std::io::ErrorKind::Unsupported,
    "named caches need symlink support",
  ))
}
