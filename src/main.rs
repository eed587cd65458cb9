use anyhow::Context;
use clap::Parser;
use snapshot_worker::{redact_url, setup_logging, Cli, CliRunner, Commands, Config};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting snapshot-worker v{}", env!("CARGO_PKG_VERSION"));

    // `validate` reads its own file argument and needs no effective config.
    let config = if matches!(args.command, Commands::Validate { .. }) {
        Config::default()
    } else {
        load_config(&args)?
    };

    let cli_runner = CliRunner::new(config);

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = cli_runner.run(args.command, shutdown_rx).await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("snapshot-worker stopped");
    Ok(())
}

fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    // Override with CLI arguments
    args.apply_overrides(&mut config);

    config.validate().context("invalid configuration")?;

    info!("Configuration loaded successfully");
    info!("Broker: {}", redact_url(&config.broker.url));
    info!(
        "Queues: consume {}, publish {}",
        config.consume_queue, config.publish_queue
    );
    info!(
        "Reconnect: {} every {:?}",
        config.broker.retry, config.broker.retry_interval
    );

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to create SIGINT handler: {}", e);
                return std::future::pending().await;
            }
        };
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to create SIGTERM handler: {}", e);
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
