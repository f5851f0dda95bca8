use actix_web::{middleware, web, App, HttpServer};
use anyhow::{anyhow, Context};
use coin_engine::{
    catalog_client::HttpWarriorCatalog, config::Config, consumers::spawn_partition_consumers,
    handlers, AppState,
};
use coin_ledger::{metrics::Metrics, storage, EventRouter, Ledger, LedgerContext, Reconciler};
use dotenv::dotenv;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    info!("Starting Coin Engine on port {}", config.server.port);

    let store = storage::open(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to open ledger store")?;

    let catalog = Arc::new(HttpWarriorCatalog::new(
        &config.catalog.url,
        Duration::from_millis(config.catalog.timeout_ms),
    )?);

    let ctx = LedgerContext::new(store.clone(), catalog, Arc::new(Metrics::new()?));
    let ledger = Ledger::new(ctx.clone(), config.ledger.clone());
    let reconciler = Arc::new(Reconciler::new(ctx, config.reconciliation.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    if config.nats.enabled {
        let client = async_nats::connect(&config.nats.url)
            .await
            .context("Failed to connect to NATS")?;
        info!("Connected to NATS at {}", config.nats.url);

        let router = Arc::new(EventRouter::new(ledger.clone(), config.router.clone()));
        workers.extend(
            spawn_partition_consumers(
                &client,
                &config.subscriber,
                &config.router,
                router,
                shutdown_rx.clone(),
            )
            .await
            .context("Failed to start event router")?,
        );
    } else {
        warn!("Event router disabled, serving the command API only");
    }

    workers.push(tokio::spawn({
        let reconciler = reconciler.clone();
        let shutdown = shutdown_rx.clone();
        async move { reconciler.run(shutdown).await }
    }));

    let state = AppState { ledger, reconciler };
    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(web::Data::new(state.clone()))
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .disable_signals()
    .bind((config.server.host.as_str(), config.server.port))?
    .run();

    let server_handle = server.handle();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            if let Err(e) = result {
                error!("HTTP server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            let (_, result) = tokio::join!(server_handle.stop(true), &mut server);
            if let Err(e) = result {
                error!("HTTP server failed during shutdown: {}", e);
            }
        }
    }

    // Consumers finish their in-flight message before exiting
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker task panicked: {}", e);
        }
    }

    store.close().await;
    info!("Coin Engine stopped");
    Ok(())
}
