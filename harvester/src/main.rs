use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use harvester::config::HarvesterConfig;
use harvester::control::ControlClient;
use harvester::logging::init_logging;
use harvester::services::ServiceContainer;

/// Extra time `stop` waits beyond the drain deadline.
const STOP_GRACE: Duration = Duration::from_secs(30);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "harvester", version, about = "Job queue and dataset pipeline daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground
    Start,
    /// Ask a running daemon to shut down and wait for it to exit
    Stop {
        /// Override the configured drain deadline
        #[arg(long)]
        drain_secs: Option<u64>,
    },
    /// Stop the daemon if it is running, then start it
    Restart,
    /// Interrupt all workers without draining, then start
    ForceRestart,
    /// Print the daemon's status report
    Status {
        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = HarvesterConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Start => start(config).await,
        Commands::Stop { drain_secs } => {
            if !stop(&config, drain_secs.map(Duration::from_secs)).await? {
                bail!("harvester is not running");
            }
            println!("harvester stopped");
            Ok(())
        }
        Commands::Restart => {
            stop(&config, None).await?;
            start(config).await
        }
        Commands::ForceRestart => {
            stop(&config, Some(Duration::ZERO)).await?;
            start(config).await
        }
        Commands::Status { json } => status(&config, json).await,
    }
}

async fn start(config: HarvesterConfig) -> anyhow::Result<()> {
    let client = ControlClient::new(&config.api.bind)?;
    if client.is_running().await {
        bail!("harvester is already running on {}", config.api.bind);
    }

    let (logging, _log_guard) = init_logging(&config.log_dir)?;
    let pid_file = config.pid_file();

    let container = ServiceContainer::connect(config)
        .await
        .context("failed to open the database")?;
    tokio::fs::write(&pid_file, std::process::id().to_string())
        .await
        .with_context(|| format!("failed to write {}", pid_file.display()))?;

    let registry = container.registry(Some(logging.clone()))?;
    let manager = container.manager(registry);
    let handle = manager.handle();

    let background = CancellationToken::new();
    logging.start_retention_cleanup(background.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            handle.shutdown();
        }
    });

    info!(pid = std::process::id(), "harvester started");
    let result = manager.run().await;

    background.cancel();
    container.shutdown().await;
    if let Err(e) = tokio::fs::remove_file(&pid_file).await {
        warn!(path = %pid_file.display(), error = %e, "Failed to remove pid file");
    }

    let report = result?;
    info!(
        total_workers = report.total_workers,
        graceful_stops = report.graceful_stops,
        forced_terminations = report.forced_terminations,
        "harvester stopped"
    );
    Ok(())
}

/// Returns `false` when no daemon was running.
async fn stop(config: &HarvesterConfig, drain: Option<Duration>) -> anyhow::Result<bool> {
    let client = ControlClient::new(&config.api.bind)?;
    if !client.is_running().await {
        return Ok(false);
    }

    client
        .shutdown(drain)
        .await
        .context("failed to request shutdown")?;

    let drain =
        drain.unwrap_or_else(|| Duration::from_secs(config.manager.drain_timeout_secs));
    wait_for_exit(&config.pid_file(), drain + STOP_GRACE).await?;
    Ok(true)
}

async fn wait_for_exit(pid_file: &Path, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::fs::try_exists(pid_file).await.unwrap_or(false) {
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "harvester did not exit within {}s ({} still exists)",
                timeout.as_secs(),
                pid_file.display()
            );
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
    Ok(())
}

async fn status(config: &HarvesterConfig, json: bool) -> anyhow::Result<()> {
    let client = ControlClient::new(&config.api.bind)?;
    let report = client
        .status()
        .await
        .context("harvester is not running")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("workers:  {}", report.workers);
    println!("jobs:     {}", report.jobs);
    println!(
        "datasets: {} (last {}s)",
        report.datasets, report.recent_window_secs
    );
    println!("queries:  {}", report.queries);
    for (jobtype, live) in &report.live_by_type {
        println!("  {jobtype:<24} {live}");
    }
    Ok(())
}
