//! Operator CLI for the Crucible execution service
//!
//! Runs a single snippet, sweeps orphaned containers, lists the language
//! catalog, or stays resident as a periodic reaper until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crucible_core::config::ConfigLoader;
use crucible_core::{ExecutionOrchestrator, ExecutionRequest, SandboxConfig};
use log::LevelFilter;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Crucible - run untrusted code in throwaway containers")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "YAML configuration file; defaults plus CRUCIBLE_* environment variables when omitted")]
    config: Option<PathBuf>,

    #[clap(long, help = "Log level (error, warn, info, debug, trace)")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a snippet and print its output
    Exec {
        #[clap(long, short)]
        language: String,

        #[clap(long, short, conflicts_with = "code", help = "Read the source from this file")]
        file: Option<PathBuf>,

        #[clap(long, help = "Inline source code")]
        code: Option<String>,

        #[clap(long, short, help = "Timeout in seconds")]
        timeout: Option<u64>,

        #[clap(long, short, help = "Host directory mounted read-write at /data")]
        workspace: Option<PathBuf>,

        #[clap(long, help = "Print the full result as JSON")]
        json: bool,
    },
    /// Remove orphaned execution containers
    Sweep,
    /// List supported languages and their images
    Languages,
    /// Sweep on startup, periodically, and again on shutdown
    Daemon {
        #[clap(long, help = "Seconds between sweeps [default: reaper.interval_secs, else 60]")]
        sweep_interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::from_file(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigLoader::from_env().context("Failed to load configuration")?,
    };

    init_logging(cli.log_level.as_deref(), &config);

    match cli.command {
        Commands::Exec {
            language,
            file,
            code,
            timeout,
            workspace,
            json,
        } => {
            let success = run_exec(&config, language, file, code, timeout, workspace, json).await?;
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Sweep => run_sweep(&config).await,
        Commands::Languages => {
            list_languages(&config);
            Ok(())
        }
        Commands::Daemon { sweep_interval } => run_daemon(&config, sweep_interval).await,
    }
}

fn init_logging(cli_level: Option<&str>, config: &SandboxConfig) {
    let mut builder = env_logger::Builder::from_default_env();
    let level = cli_level.or_else(|| {
        // RUST_LOG wins over the config file when no flag was given
        if std::env::var_os("RUST_LOG").is_some() {
            None
        } else {
            Some(config.logging.level.as_str())
        }
    });
    if let Some(level) = level {
        builder.filter_level(level.parse().unwrap_or(LevelFilter::Info));
    }
    builder.init();
}

async fn run_exec(
    config: &SandboxConfig,
    language: String,
    file: Option<PathBuf>,
    code: Option<String>,
    timeout: Option<u64>,
    workspace: Option<PathBuf>,
    json: bool,
) -> Result<bool> {
    let code = match (file, code) {
        (Some(path), _) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, Some(code)) => code,
        (None, None) => anyhow::bail!("Either --file or --code is required"),
    };

    let orchestrator = ExecutionOrchestrator::connect(config).await?;
    let language = orchestrator.catalog().resolve_language(&language)?;

    let mut request = ExecutionRequest::new(code, language);
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }
    if let Some(dir) = workspace {
        let dir = dir
            .canonicalize()
            .with_context(|| format!("Workspace {} is not accessible", dir.display()))?;
        request = request.with_workspace(dir);
    }

    let result = orchestrator.run(request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.output);
        if !result.output.is_empty() && !result.output.ends_with('\n') {
            println!();
        }
        if let Some(error) = &result.error {
            eprintln!("{}", error);
        }
        log::info!("Finished in {:.2}s", result.execution_time.as_secs_f64());
    }

    Ok(result.success)
}

async fn run_sweep(config: &SandboxConfig) -> Result<()> {
    let mut config = config.clone();
    // The explicit sweep below reports its own counts
    config.reaper.sweep_on_startup = false;

    let orchestrator = ExecutionOrchestrator::connect(&config).await?;
    let report = orchestrator.sweep().await?;
    println!(
        "Removed {} container(s), {} failed",
        report.removed, report.failed
    );
    Ok(())
}

fn list_languages(config: &SandboxConfig) {
    match crucible_core::executors::RuntimeCatalog::from_config(config) {
        Ok(catalog) => {
            for language in catalog.languages() {
                let runtime = catalog.get(language);
                println!(
                    "{:<12} {:<28} {}",
                    language.as_str(),
                    runtime.image,
                    runtime.command_for(&runtime.source_file_name()).join(" ")
                );
            }
        }
        Err(e) => eprintln!("{}", e),
    }
}

async fn run_daemon(config: &SandboxConfig, sweep_interval: Option<u64>) -> Result<()> {
    let interval = sweep_interval
        .or(config.reaper.interval_secs)
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    if interval == 0 {
        anyhow::bail!("--sweep-interval must be greater than zero");
    }

    let orchestrator = ExecutionOrchestrator::connect(config).await?;
    let reaper = orchestrator
        .reaper()
        .ok_or_else(|| anyhow::anyhow!("Container runtime is not available"))?;

    log::info!("Sweeping orphaned containers every {}s", interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = reaper.spawn_interval(Duration::from_secs(interval), shutdown_rx);

    shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        log::warn!("Sweeper task ended abnormally: {}", e);
    }

    match orchestrator.sweep().await {
        Ok(report) => log::info!(
            "Shutdown sweep removed {} container(s), {} failed",
            report.removed,
            report.failed
        ),
        Err(e) => log::warn!("Shutdown sweep failed: {}", e),
    }
    log::info!("Crucible daemon shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
