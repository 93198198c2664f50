use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kiln_config::EngineConfig;
use kiln_engine::{Engine, EnvironmentVars, EnvironmentVarsRequest};
use kiln_process::{FallibleProcessResult, ProcessRequest};
use kiln_rules::{Params, TypeKey};
use kiln_store::Digest;

/// Kiln - an incremental, memoizing build engine
#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.kiln)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Engine configuration file (default: <data-dir>/config.json if present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Workspace root (default: the current directory)
  #[arg(long, global = true)]
  workspace: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Inspect and maintain the content store
  Store {
    #[command(subcommand)]
    action: StoreAction,
  },

  /// Run one process through the engine and print its stdout
  Run {
    /// Kill the process after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Run in the workspace instead of a sandbox (never cached)
    #[arg(long)]
    in_workspace: bool,

    /// Program and arguments
    #[arg(trailing_var_arg = true, required = true)]
    argv: Vec<String>,
  },
}

#[derive(Subcommand)]
enum StoreAction {
  /// Store a file and print its digest
  Put { file: PathBuf },

  /// Write the blob with the given digest (<hash>/<size>) to stdout
  Cat { digest: String },

  /// Remove blobs nothing references
  Gc,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".kiln")
  });
  let workspace = match cli.workspace {
    Some(workspace) => workspace,
    None => std::env::current_dir().context("failed to determine current directory")?,
  };
  let config = load_config(cli.config.as_deref(), &data_dir, workspace)?;

  let Some(command) = cli.command else {
    println!("kiln - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(config.worker_threads)
    .enable_all()
    .build()?;
  rt.block_on(async {
    let engine = Engine::builder(config)
      .build()
      .await
      .context("failed to start engine")?;
    match command {
      Commands::Store { action } => store(&engine, action).await,
      Commands::Run {
        timeout_ms,
        in_workspace,
        argv,
      } => run(&engine, argv, timeout_ms, in_workspace).await,
    }
  })
}

fn load_config(explicit: Option<&Path>, data_dir: &Path, workspace: PathBuf) -> Result<EngineConfig> {
  if let Some(path) = explicit {
    return EngineConfig::load(path)
      .with_context(|| format!("failed to load config: {}", path.display()));
  }
  let default_path = data_dir.join("config.json");
  if default_path.exists() {
    return EngineConfig::load(&default_path)
      .with_context(|| format!("failed to load config: {}", default_path.display()));
  }
  Ok(EngineConfig::default_for(data_dir, workspace))
}

async fn store(engine: &Engine, action: StoreAction) -> Result<()> {
  match action {
    StoreAction::Put { file } => {
      let content = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read file: {}", file.display()))?;
      let digest = engine
        .store()
        .store_bytes(Bytes::from(content))
        .await
        .context("failed to store file")?;
      println!("{}", digest);
    }
    StoreAction::Cat { digest } => {
      let digest: Digest = digest
        .parse()
        .with_context(|| format!("invalid digest: {}", digest))?;
      let bytes = engine
        .store()
        .load_bytes_required(digest)
        .await
        .with_context(|| format!("failed to load {}", digest))?;
      std::io::stdout().write_all(&bytes)?;
    }
    StoreAction::Gc => {
      let report = engine
        .garbage_collect()
        .await
        .context("garbage collection failed")?;
      let output = serde_json::json!({
        "kept": report.kept,
        "removed": report.removed,
        "reclaimed_bytes": report.reclaimed_bytes,
      });
      println!("{}", serde_json::to_string_pretty(&output)?);
    }
  }
  Ok(())
}

async fn run(
  engine: &Engine,
  argv: Vec<String>,
  timeout_ms: Option<u64>,
  in_workspace: bool,
) -> Result<()> {
  let env = engine
    .execute::<EnvironmentVars>(Params::of(EnvironmentVarsRequest::allowed()))
    .await
    .context("failed to read environment")?;

  let mut request = env
    .apply(ProcessRequest::new(argv.clone()))
    .with_description(argv.join(" "));
  if let Some(timeout_ms) = timeout_ms {
    request = request.with_timeout(Duration::from_millis(timeout_ms));
  }
  if in_workspace {
    request = request.in_workspace();
  }

  let cancel = CancellationToken::new();
  let interrupt = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      interrupt.cancel();
    }
  });

  let value = engine
    .execute_value(
      TypeKey::of::<FallibleProcessResult>(),
      Params::of(request),
      cancel,
    )
    .await
    .context("process execution failed")?;
  let result = value
    .downcast_ref::<FallibleProcessResult>()
    .context("unexpected result type")?;

  let stdout = engine
    .store()
    .load_bytes_required(result.stdout_digest)
    .await
    .context("failed to load stdout")?;
  std::io::stdout().write_all(&stdout)?;

  eprintln!(
    "exit code {} ({}, {} ms)",
    result.exit_code,
    result.metadata.source,
    result.metadata.total_elapsed.as_millis()
  );
  let output = serde_json::json!({
    "exit_code": result.exit_code,
    "stdout": result.stdout_digest.to_string(),
    "stderr": result.stderr_digest.to_string(),
    "output": result.output_digest.to_string(),
  });
  eprintln!("{}", serde_json::to_string_pretty(&output)?);

  if !result.succeeded() {
    std::process::exit(result.exit_code);
  }
  Ok(())
}
