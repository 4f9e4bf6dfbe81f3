use clap::Parser;
use routewatch::adapters::{HttpMonitoringClient, KubeRestStore};
use routewatch::cli::{self, Cli, Commands};
use routewatch::config::AppConfig;
use routewatch::controller::{Operator, RuntimeSettings};
use routewatch::error::{OperatorError, Result};
use routewatch::services::{HealthServer, HealthState, Metrics};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple, shutdown_signal};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Derive {
            file,
            default_interval,
        } => {
            init_logging_simple();
            let rendered = cli::derive_from_file(file, default_interval.as_deref())?;
            print!("{}", rendered);
        }
        Commands::CheckConfig => {
            init_logging_simple();
            match cli::check_config(&cli.config) {
                Ok(config) => {
                    println!("Configuration OK");
                    println!("  monitoring.base_url = {}", config.monitoring.base_url);
                    println!("  kube.api_url        = {}", config.kube.api_url);
                    println!("  controller.workers  = {}", config.controller.workers);
                }
                Err(e) => {
                    eprintln!("Configuration invalid: {}", e);
                    return Err(e);
                }
            }
        }
        Commands::Run { dry_run } => {
            let mut config = AppConfig::load_from(&cli.config)?;
            config.monitoring.dry_run |= *dry_run;
            init_logging(&config.logging, cli.json);

            if let Err(errors) = config.validate() {
                for problem in &errors {
                    error!("Config: {}", problem);
                }
                return Err(OperatorError::InvalidConfig(errors.join("; ")));
            }
            run_operator(config).await?;
        }
    }

    Ok(())
}

async fn run_operator(config: AppConfig) -> Result<()> {
    info!(
        dry_run = config.monitoring.dry_run,
        workers = config.controller.workers,
        "Starting routewatch"
    );

    let metrics = Arc::new(Metrics::new());
    let health = Arc::new(HealthState::new(Arc::clone(&metrics)));
    let cancel = CancellationToken::new();

    let store = Arc::new(KubeRestStore::from_config(
        &config.kube,
        config.controller.namespace.clone(),
    )?);
    let service = Arc::new(HttpMonitoringClient::from_config(&config.monitoring)?);

    if let Some(port) = config.health_port {
        let server = HealthServer::new(Arc::clone(&health), port);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(cancel).await {
                error!("Health server failed: {}", e);
            }
        });
    }

    let operator = Operator {
        routes: store.clone(),
        monitors: store.clone(),
        watch: store,
        service,
        metrics: Arc::clone(&metrics),
        health: Some(Arc::clone(&health)),
        retry_count: config.monitoring.retry_count,
        settings: RuntimeSettings::from_config(&config.controller),
    };
    let handle = operator.start(cancel.clone()).await?;
    info!("Controllers running");

    let status_metrics = Arc::clone(&metrics);
    let status_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = status_cancel.cancelled() => break,
                _ = ticker.tick() => status_metrics.log_status(),
            }
        }
    });

    shutdown_signal().await;
    warn!("Shutdown signal received, draining workers");
    handle.shutdown().await;
    metrics.log_status();
    info!("routewatch stopped");

    Ok(())
}
