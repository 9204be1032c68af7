// src/main.rs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use modelget::lock::JobLock;
use modelget::prelude::*;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Set in the environment of a background child.
const ENV_DETACHED: &str = "MODELGET_DETACHED";

const EXIT_FAILED: u8 = 1;
const EXIT_FILES_FAILED: u8 = 3;
const EXIT_NOT_FOUND: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

/// Resumable, parallel downloader for model repositories.
#[derive(Parser, Debug)]
#[command(name = "modelget", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every file of a model into a directory.
    Download(DownloadArgs),
    /// Show the progress of a model download.
    Status {
        model_id: String,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Drop the status record of a model. Downloaded files are kept.
    Forget { model_id: String },
}

#[derive(Args, Debug, Clone)]
struct DownloadArgs {
    /// Model id, e.g. "qwen/Qwen2-7B".
    model_id: String,
    /// Directory the model files are written to.
    save_dir: PathBuf,
    /// Maximum number of concurrent transfers.
    #[arg(long)]
    max_workers: Option<usize>,
    /// Retries per chunk and extra rounds per file on checksum mismatch.
    #[arg(long)]
    retry: Option<u32>,
    /// Chunk size in bytes.
    #[arg(long)]
    chunk_size: Option<u64>,
    /// Accept files without checking their SHA-256.
    #[arg(long)]
    no_verify: bool,
    /// Run in a detached process and return immediately.
    #[arg(long)]
    background: bool,
}

impl DownloadArgs {
    fn apply(&self, config: &mut DownloaderConfig) {
        if let Some(workers) = self.max_workers {
            config.max_workers = workers;
        }
        if let Some(retry) = self.retry {
            config.retry_limit = retry;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if self.no_verify {
            config.verify = false;
        }
    }

    /// Arguments that replay this download in the foreground.
    fn foreground_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "download".into(),
            self.model_id.clone().into(),
            self.save_dir.clone().into_os_string(),
        ];
        if let Some(workers) = self.max_workers {
            args.extend(["--max-workers".into(), workers.to_string().into()]);
        }
        if let Some(retry) = self.retry {
            args.extend(["--retry".into(), retry.to_string().into()]);
        }
        if let Some(chunk_size) = self.chunk_size {
            args.extend(["--chunk-size".into(), chunk_size.to_string().into()]);
        }
        if self.no_verify {
            args.push("--no-verify".into());
        }
        args
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let detached = std::env::var_os(ENV_DETACHED).is_some();
    init_tracing(detached);

    let config = DownloaderConfig::from_env();
    let outcome = match cli.command {
        Command::Download(args) => download(config, args).await,
        Command::Status { model_id, json } => status(config, &model_id, json).await,
        Command::Forget { model_id } => forget(config, &model_id).await,
    };
    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_FAILED)
        }
    }
}

fn init_tracing(detached: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(!detached)
        .init();
}

async fn download(mut config: DownloaderConfig, args: DownloadArgs) -> Result<ExitCode> {
    args.apply(&mut config);
    let lock_path = config.lock_path(&args.model_id);
    if args.background {
        // The child takes the lock for itself; this only refuses early.
        drop(JobLock::acquire(&lock_path, &args.model_id)?);
        return spawn_detached(&config, &args);
    }
    let _lock = JobLock::acquire(&lock_path, &args.model_id)?;

    let store = Arc::new(
        SqliteStatusStore::open(&config.status_db_path())
            .await
            .context("opening status store")?,
    );
    let catalog = Arc::new(HubCatalog::new(config.endpoint.clone())?);
    let transport = Arc::new(HttpTransport::new(config.idle_timeout)?);
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let manager = DownloadManager::new(catalog, transport, store, cancel);
    let job = config.job(&args.model_id, args.save_dir.clone());
    let result = manager.run(job).await?;

    println!(
        "{}: {} of {} file(s) completed, {} failed",
        result.model_id,
        result.completed_count(),
        result.files.len(),
        result.failed_count()
    );
    for file in result.files.iter().filter(|f| f.is_failed()) {
        if let Some(e) = &file.error {
            eprintln!("  {}: {}", file.path, e);
        }
    }

    Ok(match result.state {
        JobState::Completed => ExitCode::SUCCESS,
        JobState::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
        JobState::Failed | JobState::Running => ExitCode::from(EXIT_FILES_FAILED),
    })
}

/// Re-runs this download as a detached child writing to a per-model log.
fn spawn_detached(config: &DownloaderConfig, args: &DownloadArgs) -> Result<ExitCode> {
    std::fs::create_dir_all(&config.status_dir)
        .with_context(|| format!("creating {}", config.status_dir.display()))?;
    let log_path = config.log_path(&args.model_id);
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;
    let log_err = log.try_clone()?;

    let exe = std::env::current_exe().context("locating the modelget executable")?;
    let mut command = std::process::Command::new(exe);
    command
        .args(args.foreground_args())
        .env(ENV_DETACHED, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command.spawn().context("starting background download")?;
    info!(pid = child.id(), log = %log_path.display(), "download continues in the background");
    println!(
        "started {} in the background (pid {}), log: {}",
        args.model_id,
        child.id(),
        log_path.display()
    );
    println!("check progress with: modelget status {}", args.model_id);
    Ok(ExitCode::SUCCESS)
}

async fn status(config: DownloaderConfig, model_id: &str, json: bool) -> Result<ExitCode> {
    let db_path = config.status_db_path();
    if !db_path.exists() {
        eprintln!("no download recorded for {}", model_id);
        return Ok(ExitCode::from(EXIT_NOT_FOUND));
    }
    let store = Arc::new(SqliteStatusStore::open(&db_path).await?);
    match StatusQuery::new(store).status(model_id).await {
        Ok(mut summary) => {
            if !JobLock::is_held(&config.lock_path(model_id))? {
                summary = summary.without_live_run();
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(StatusError::NotFound(_)) => {
            eprintln!("no download recorded for {}", model_id);
            Ok(ExitCode::from(EXIT_NOT_FOUND))
        }
        Err(e) => Err(e.into()),
    }
}

async fn forget(config: DownloaderConfig, model_id: &str) -> Result<ExitCode> {
    let db_path = config.status_db_path();
    if !db_path.exists() {
        eprintln!("no download recorded for {}", model_id);
        return Ok(ExitCode::from(EXIT_NOT_FOUND));
    }
    let store = SqliteStatusStore::open(&db_path).await?;
    if store.delete(model_id).await? {
        println!("forgot {}; files on disk were left in place", model_id);
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("no download recorded for {}", model_id);
        Ok(ExitCode::from(EXIT_NOT_FOUND))
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown().await;
        warn!("interrupt received, stopping after in-flight writes");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
