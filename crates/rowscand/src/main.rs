use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rowscand::config::Config;
use rowscand::ipc::CaptureRequest;
use rowscand::manager::FleetManager;
use rowscand::shutdown::{ParentWatch, ShutdownToken};
use rowscand::worker;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rowscand", about = "Multi-camera point cloud capture daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fleet, reading capture commands as JSON lines on stdin (default)
    Run,
    /// Camera worker process; spawned by `run`
    #[command(hide = true)]
    Worker,
}

fn main() -> Result<()> {
    // stdout carries worker events; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(run(Config::from_env()))
        }
        Commands::Worker => run_worker(),
    }
}

fn run_worker() -> Result<()> {
    let config = match Config::from_worker_env().context("invalid worker configuration")? {
        Some(config) => config,
        None => Config::from_env(),
    };
    let parent = ParentWatch::current();
    let token = ShutdownToken::new();
    token
        .register_signals()
        .context("failed to install signal handlers")?;
    tracing::info!(pid = std::process::id(), "worker starting");

    let stdin = std::io::BufReader::new(std::io::stdin());
    worker::run_worker(
        &config,
        config.backend(),
        stdin,
        std::io::stdout().lock(),
        &token,
        Some(parent),
    )?;
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    tracing::info!(
        pointcloud_dir = %config.pointcloud_dir.display(),
        calibration_dir = %config.calibration_dir.display(),
        "rowscand starting"
    );
    let mut manager = FleetManager::new(config);
    let cameras = manager.start().await?;
    if cameras.is_empty() {
        tracing::warn!("no cameras came up; captures will be empty");
    }
    tracing::info!(cameras = cameras.len(), "rowscand ready");

    let mut terminate = signal(SignalKind::terminate()).context("failed to watch SIGTERM")?;
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let input_closed = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break false;
            }
            _ = terminate.recv() => {
                tracing::info!("terminated");
                break false;
            }
            line = commands.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match serde_json::from_str::<CaptureRequest>(&line) {
                    Ok(request) => {
                        if let Err(err) = manager.submit(request).await {
                            tracing::error!(error = %err, "command not queued");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "malformed command ignored"),
                },
                Ok(None) => {
                    tracing::info!("command input closed");
                    break true;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "command input failed");
                    break false;
                }
            },
        }
    };

    tracing::info!("rowscand shutting down");
    let exit = if input_closed {
        manager.finish().await
    } else {
        manager.shutdown().await
    };
    tracing::info!(?exit, "rowscand stopped");
    Ok(())
}
