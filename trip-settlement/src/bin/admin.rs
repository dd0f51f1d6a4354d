use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use message_bus::{NatsClient, Publisher, PublisherConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use trip_settlement::{
    config::Config, telemetry::init_tracing, BalanceStore, Error, Reconciler, RedisBackend,
    TripCompletedEvent,
};

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "settlement-admin",
    about = "Operator commands for the trip settlement pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a completed-trip document from a JSON file
    Publish {
        /// Path to the trip document
        file: PathBuf,
    },
    /// Print a driver's balance summed over every name casing
    Balance {
        /// Driver name, any casing
        driver: String,
    },
    /// Run one balance key reconciliation pass
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().map_err(Error::Config)?;

    match cli.command {
        Commands::Publish { file } => publish(&config, file).await,
        Commands::Balance { driver } => balance(&config, &driver).await,
        Commands::Reconcile => reconcile(&config).await,
    }
}

async fn balance_store(config: &Config) -> anyhow::Result<Arc<BalanceStore<RedisBackend>>> {
    let backend = RedisBackend::connect(
        &config.redis.url,
        config.redis_command_timeout(),
        config.redis.max_idle_connections,
    )
    .await
    .context("Failed to connect to Redis")?;

    Ok(Arc::new(BalanceStore::new(
        backend,
        config.balance_store_config(),
    )))
}

async fn publish(config: &Config, file: PathBuf) -> anyhow::Result<()> {
    let payload = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    // Refuse documents the consumer would drop
    let event = TripCompletedEvent::from_slice(&payload)
        .with_context(|| format!("{} is not a valid trip document", file.display()))?;

    let nats = Arc::new(
        NatsClient::connect(&config.nats_config())
            .await
            .context("Failed to connect to NATS")?,
    );
    let publisher = Publisher::new(nats.clone(), config.stream_spec(), PublisherConfig::default());

    let receipt = publisher
        .publish(&config.nats.subject, &event.trip_id, payload.into())
        .await?;
    nats.close().await?;

    if receipt.duplicate {
        println!(
            "Trip {} was already published (sequence {})",
            event.trip_id, receipt.sequence
        );
    } else {
        println!("Published trip {} (sequence {})", event.trip_id, receipt.sequence);
    }
    Ok(())
}

async fn balance(config: &Config, driver: &str) -> anyhow::Result<()> {
    if driver.trim().is_empty() {
        bail!("Driver name cannot be empty");
    }

    let balances = balance_store(config).await?;
    let total = balances.driver_balance(driver).await?;
    println!("{}", total);
    Ok(())
}

async fn reconcile(config: &Config) -> anyhow::Result<()> {
    let balances = balance_store(config).await?;
    let report = Reconciler::new(balances).run().await?;

    for group in &report.merged {
        println!(
            "{} = {} (removed: {})",
            group.canonical,
            group.total,
            group.removed.join(", ")
        );
    }
    for group in &report.failed {
        println!("{}: skipped ({})", group.identity, group.error);
    }
    info!(
        "Scanned {} keys in {} groups",
        report.keys_scanned, report.groups
    );

    if !report.is_clean() {
        bail!("{} groups could not be merged", report.failed.len());
    }
    Ok(())
}
