use anyhow::Context;
use dotenv::dotenv;
use message_bus::{NatsClient, Subscriber};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use trip_settlement::{
    config::Config, server, telemetry::init_tracing, BalanceStore, Error, PgTripLedger, Reconciler,
    RedisBackend, Result, SettlementConsumer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    info!("Settlement consumer starting...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().map_err(Error::Config)?;

    info!(
        "Configuration loaded - subject: {}, durable: {}, concurrency: {}",
        config.nats.subject, config.nats.durable_name, config.nats.max_concurrent
    );

    let (balances, ledger) = connect_stores(&config)
        .await
        .context("Failed to set up balance store and trip ledger")?;

    if config.reconciliation.on_startup {
        match Reconciler::new(balances.clone()).run().await {
            Ok(report) if !report.is_clean() => warn!(
                "Startup reconciliation left {} groups for the next run",
                report.failed.len()
            ),
            Ok(_) => {}
            Err(e) => warn!("Startup reconciliation skipped: {}", e),
        }
    }

    let nats = Arc::new(
        NatsClient::connect(&config.nats_config())
            .await
            .map_err(Error::from)
            .context("Failed to connect to NATS")?,
    );
    let subscriber = Subscriber::new(
        nats.clone(),
        config.stream_spec(),
        config.subscriber_config(),
    );
    let consumer = Arc::new(SettlementConsumer::new(balances.clone(), ledger.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, draining in-flight events");
        let _ = shutdown_tx.send(true);
    });

    let metrics_server = if config.metrics.enabled {
        let addr = config.metrics_addr().map_err(Error::Config)?;
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server::serve(addr, shutdown).await {
                warn!("Metrics endpoint stopped: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Settlement consumer initialized successfully");
    let result = subscriber.run(consumer, shutdown_rx).await.map_err(Error::from);

    // The subscriber also stops on a fatal error, so stop the scrape endpoint with it
    if let Some(handle) = metrics_server {
        handle.abort();
        let _ = handle.await;
    }

    if let Err(e) = nats.close().await {
        warn!("Failed to flush NATS connection: {}", e);
    }
    ledger.close().await;
    balances.backend().close();

    result?;
    info!("Settlement consumer stopped");
    Ok(())
}

async fn connect_stores(
    config: &Config,
) -> Result<(Arc<BalanceStore<RedisBackend>>, Arc<PgTripLedger>)> {
    let backend = RedisBackend::connect(
        &config.redis.url,
        config.redis_command_timeout(),
        config.redis.max_idle_connections,
    )
    .await?;
    let balances = Arc::new(BalanceStore::new(backend, config.balance_store_config()));

    let seed = config.seed_balances().map_err(Error::Config)?;
    if !seed.is_empty() {
        balances.seed(&seed).await?;
    }

    let ledger = Arc::new(PgTripLedger::connect(&config.ledger_config())?);
    Ok((balances, ledger))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
