//! DKG Relay Service
//!
//! HTTP service relaying DKG protocol messages between operator nodes.

mod routes;

use anyhow::Result;
use clap::Parser;
use dkg_relay::{Relay, RelayConfig, DEFAULT_TOPIC};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;
use tracing::{info, Level};

/// Relay service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "dkg-relay-svc")]
#[command(about = "Message relay for multi-operator DKG runs")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(short, long, env = "DKG_RELAY_LISTEN", default_value = "0.0.0.0:3000")]
    listen: String,

    /// Topic every operator registers on
    #[arg(long, env = "DKG_RELAY_DEFAULT_TOPIC", default_value = DEFAULT_TOPIC)]
    default_topic: String,

    /// Capacity of the shared inbound queue
    #[arg(long, env = "DKG_RELAY_INBOUND_CAPACITY", default_value = "50")]
    inbound_capacity: usize,

    /// Capacity of each subscriber's outbound queue
    #[arg(long, env = "DKG_RELAY_OUTBOUND_CAPACITY", default_value = "50")]
    outbound_capacity: usize,

    /// Capacity of the job request queue
    #[arg(long, env = "DKG_RELAY_JOB_QUEUE_CAPACITY", default_value = "10")]
    job_queue_capacity: usize,

    /// Retries per payload after the first delivery attempt
    #[arg(long, env = "DKG_RELAY_MAX_RETRIES", default_value = "10")]
    max_retries: u32,

    /// Linear retry backoff unit in milliseconds
    #[arg(long, env = "DKG_RELAY_RETRY_BACKOFF_MS", default_value = "1000")]
    retry_backoff_ms: u64,

    /// Timeout for a single delivery in seconds
    #[arg(long, env = "DKG_RELAY_DELIVERY_TIMEOUT", default_value = "10")]
    delivery_timeout: u64,

    /// Payload hashes tracked per subscriber for retry counting
    #[arg(long, env = "DKG_RELAY_RETRY_LEDGER_CAPACITY", default_value = "4096")]
    retry_ledger_capacity: usize,

    /// Run result TTL in seconds
    #[arg(long, env = "DKG_RELAY_RESULT_TTL", default_value = "86400")]
    result_ttl: u64,

    /// Result cleanup interval in seconds
    #[arg(long, env = "DKG_RELAY_CLEANUP_INTERVAL", default_value = "60")]
    cleanup_interval: u64,

    /// Emit logs as JSON
    #[arg(long, env = "DKG_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            job_queue_capacity: self.job_queue_capacity,
            default_topic: self.default_topic.clone(),
            ..RelayConfig::default()
        }
        .with_queue_capacity(self.inbound_capacity, self.outbound_capacity)
        .with_max_retries(self.max_retries)
        .with_retry_backoff(Duration::from_millis(self.retry_backoff_ms))
        .with_delivery_timeout(Duration::from_secs(self.delivery_timeout))
        .with_retry_ledger_capacity(self.retry_ledger_capacity)
        .with_result_ttl(Duration::from_secs(self.result_ttl))
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.relay_config();
    info!(
        listen = %args.listen,
        default_topic = %config.default_topic,
        max_retries = config.max_retries,
        retry_backoff = ?config.retry_backoff,
        "Starting DKG relay service"
    );

    let metrics = PrometheusBuilder::new().install_recorder()?;
    let relay = Relay::start(config).await?;

    // Expire old run results
    let cleanup_relay = relay.clone();
    let upkeep = metrics.clone();
    let cleanup_interval = Duration::from_secs(args.cleanup_interval.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        loop {
            interval.tick().await;
            cleanup_relay.results().cleanup();
            upkeep.run_upkeep();
        }
    });

    let app = routes::router(relay.clone(), metrics);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
