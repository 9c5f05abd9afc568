//! renderflow-broker: topic exchange daemon for the render pipeline.
//!
//! Hosts durable queues in memory and serves them to service nodes over a
//! ZeroMQ ROUTER socket. Optionally exposes queue depths on `GET /metrics`.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (tcp://127.0.0.1:5672, no auth)
//! renderflow-broker
//!
//! # From a config file, overriding the metrics port
//! renderflow-broker --config renderflow.toml --metrics-port 9090
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use renderflow_bus::{BrokerServer, BusConfig, MemoryBroker, MetricsCollector};

/// Topic exchange daemon for the render pipeline.
#[derive(Parser, Debug)]
#[command(name = "renderflow-broker", version, about)]
struct Cli {
    /// Path to the TOML config; defaults plus environment when absent.
    #[arg(long, env = "RENDERFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Endpoint to bind, overriding `broker.endpoint`.
    #[arg(long, env = "RENDERFLOW_BROKER_BIND")]
    endpoint: Option<String>,

    /// HTTP port for the `/metrics` JSON endpoint (0 = disabled).
    #[arg(long, env = "RENDERFLOW_METRICS_PORT", default_value_t = 0)]
    metrics_port: u16,

    /// Ready messages per queue above which publishers see backpressure.
    #[arg(long, default_value_t = renderflow_bus::memory::DEFAULT_HIGH_WATER_MARK)]
    high_water_mark: usize,

    /// Interval in seconds between queue depth log lines (0 = disabled).
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting renderflow-broker");

    let mut config = match &cli.config {
        Some(path) => BusConfig::from_file(path)?,
        None => BusConfig::from_env()?,
    };
    if let Some(endpoint) = &cli.endpoint {
        config.broker.endpoint = endpoint.clone();
        config.validate()?;
    }
    let metrics_port = match cli.metrics_port {
        0 => config.broker.metrics_port,
        port => Some(port),
    };

    let collector = MetricsCollector::new();
    let broker = MemoryBroker::new()
        .with_high_water_mark(cli.high_water_mark)
        .with_metrics(collector.clone());

    let server =
        BrokerServer::bind(&config.broker_transport()?, broker.clone(), config.credentials())
            .await?
            .with_session_timeout(config.session_timeout());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let metrics_handle = metrics_port.map(|port| {
        renderflow_bus::metrics::spawn_metrics_server(
            port,
            collector.clone(),
            broker.clone(),
            shutdown_rx,
        )
    });

    if cli.stats_interval > 0 {
        renderflow_bus::metrics::spawn_stats_logger(
            collector.clone(),
            broker.clone(),
            Duration::from_secs(cli.stats_interval),
        );
    }

    let stop = server.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        stop.notify_one();
    });

    server.run().await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("renderflow-broker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
