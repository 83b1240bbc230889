use std::{sync::Arc, time::Duration};

use engine_core::{chain::RpcChainService, signer::LocalSigner};
use engine_executors::{
    engine::TransactionEngine,
    events::TracingEventSink,
    indexer::StoreSubscriptionSource,
    metrics::{EngineMetrics, initialize_metrics},
    store::{MemoryTransactionStore, RedisTransactionStore, TransactionStore},
    webhook::WebhookEventSink,
};
use engine_server::{
    DispatchSink, RelayConfig, StoreBackend, config,
    http::server::{EngineServer, EngineServerState},
};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_config()?;

    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level if RUST_LOG environment variable is not set
            "engine_server=debug,tower_http=debug,axum=debug,engine_executors=debug,engine_core=info"
                .into()
        }),
    );

    match config.server.log_format {
        config::LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        config::LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    let metrics_registry = Arc::new(prometheus::Registry::new());
    initialize_metrics(EngineMetrics::new(&metrics_registry)?);
    tracing::info!("Metrics initialized");

    let options = &config.engine;
    match config.store {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store, records are lost on restart");
            let store = Arc::new(MemoryTransactionStore::new(options.idempotency_window_ms));
            run(&config, store, metrics_registry).await
        }
        StoreBackend::Redis => {
            let redis_config = config
                .redis
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("store is redis but no redis.url is set"))?;
            let client = redis::Client::open(redis_config.url.as_str())?;
            let connection = redis::aio::ConnectionManager::new(client).await?;
            tracing::info!("Redis connection initialized");

            let store = Arc::new(RedisTransactionStore::new(
                connection,
                options.namespace.clone(),
                options.idempotency_window_ms,
            ));
            run(&config, store, metrics_registry).await
        }
    }
}

async fn run<S: TransactionStore>(
    config: &RelayConfig,
    store: Arc<S>,
    metrics_registry: Arc<prometheus::Registry>,
) -> anyhow::Result<()> {
    let options = config.engine.clone();

    let chains = RpcChainService::new(&config.chain_endpoints(), options.rpc_timeout())?;
    tracing::info!(chains = config.chains.len(), "Chain service initialized");

    let signer = LocalSigner::from_private_keys(config.signer.private_keys.as_slice())?;
    tracing::info!(wallets = ?signer.addresses(), "Signer initialized");

    let sink = match &config.webhook {
        Some(webhook) => {
            tracing::info!(url = webhook.url, "Delivering events to webhook");
            DispatchSink::Webhook(WebhookEventSink::new(
                webhook.url.clone(),
                webhook.hmac_secret.clone(),
                Duration::from_millis(webhook.timeout_ms),
            )?)
        }
        None => DispatchSink::Tracing(TracingEventSink),
    };

    let subscriptions = Arc::new(StoreSubscriptionSource::new(
        store.clone(),
        config.event_subscriptions(),
    ));

    let engine = Arc::new(TransactionEngine::new(
        store,
        Arc::new(chains),
        Arc::new(signer),
        Arc::new(sink),
        subscriptions,
        options,
    ));

    tracing::info!("Starting engine workers...");
    let workers = engine.start_workers();

    let mut server = EngineServer::new(EngineServerState {
        engine,
        metrics_registry,
    });

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    server.start(listener)?;

    tracing::info!("Server started, waiting for shutdown signal");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("Shutdown signal received");

    // Stop taking requests before the workers go away
    if let Err(e) = server.shutdown().await {
        tracing::error!("Error during HTTP server shutdown: {}", e);
    } else {
        tracing::info!("HTTP server shut down successfully");
    }

    if let Err(e) = workers.shutdown().await {
        tracing::error!("Error during worker shutdown: {}", e);
    } else {
        tracing::info!("All workers shut down successfully");
    }

    Ok(())
}
