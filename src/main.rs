use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hivecount::config::{HivecountConfig, LogFormat};
use hivecount::ratelimit::{BackendRegistry, MultiBackend, StrategyKind};
use hivecount::HivecountError;

/// Rate limit counters with health-aware failover across backends.
#[derive(Debug, Parser)]
#[command(name = "hivecount", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "hivecount.yaml")]
    config: PathBuf,

    /// Log output format, overrides the configuration file
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Failover strategy, overrides the configuration file
    #[arg(long)]
    strategy: Option<StrategyKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add a hit to a key and print the new count
    Increment {
        key: String,
        /// Window length in seconds
        #[arg(long, default_value_t = 60)]
        window_secs: u64,
    },
    /// Print the current count of a key
    Count { key: String },
    /// Print when the current window of a key ends
    ResetTime { key: String },
    /// Clear a key
    Reset { key: String },
    /// Check every backend and print its health
    Status,
    /// Check every backend and print aggregate statistics
    Stats,
    /// Print statistics periodically until interrupted
    Watch {
        #[arg(long, default_value_t = 5)]
        every_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = HivecountConfig::from_file(&cli.config)?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(strategy) = cli.strategy {
        config.strategy = strategy;
    }

    init_tracing(&config);

    info!("Starting Hivecount");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let registry = BackendRegistry::builtin();
    let counter = MultiBackend::from_config(&config, &registry).await?;

    let result = run(&counter, cli.command).await;
    if let Err(HivecountError::AllBackendsFailed { operation, failures }) = &result {
        for failure in failures {
            error!(operation = %operation, backend = %failure.backend, error = %failure.error, "Backend failed");
        }
    }
    result?;

    Ok(())
}

fn init_tracing(config: &HivecountConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    // Logs go to stderr so stdout stays machine readable
    match config.logging.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn run(counter: &MultiBackend, command: Command) -> hivecount::Result<()> {
    let output = match command {
        Command::Increment { key, window_secs } => {
            let count = counter
                .increment(&key, Duration::from_secs(window_secs))
                .await?;
            serde_json::json!({ "key": key, "count": count })
        }
        Command::Count { key } => {
            let count = counter.get_count(&key).await?;
            serde_json::json!({ "key": key, "count": count })
        }
        Command::ResetTime { key } => {
            let reset_at = counter.get_reset_time(&key).await?;
            serde_json::json!({ "key": key, "reset_at": reset_at })
        }
        Command::Reset { key } => {
            counter.reset(&key).await?;
            serde_json::json!({ "key": key, "reset": true })
        }
        Command::Status => {
            counter.refresh_health().await;
            serde_json::json!(counter.get_backend_status())
        }
        Command::Stats => {
            counter.refresh_health().await;
            serde_json::json!(counter.get_stats())
        }
        Command::Watch { every_secs } => {
            watch(counter, Duration::from_secs(every_secs.max(1))).await;
            return Ok(());
        }
    };

    println!("{}", output);
    Ok(())
}

/// Print stats on every tick until a shutdown signal arrives.
async fn watch(counter: &MultiBackend, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                counter.refresh_health().await;
                println!("{}", serde_json::json!({
                    "stats": counter.get_stats(),
                    "backends": counter.get_backend_status(),
                }));
            }
            _ = &mut shutdown => break,
        }
    }

    info!("Hivecount watch stopped");
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
