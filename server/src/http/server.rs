use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use engine_core::{chain::RpcChainService, signer::LocalSigner};
use engine_executors::{
    engine::TransactionEngine, indexer::StoreSubscriptionSource, store::TransactionStore,
};
use tokio::{sync::watch, task::JoinHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::sink::DispatchSink;

use super::routes::{
    admin::{indexers::list_indexers, metrics::get_metrics},
    transaction::{cancel_transaction, enqueue_transaction, get_transaction},
};

pub type RelayEngine<S> =
    TransactionEngine<S, RpcChainService, LocalSigner, DispatchSink, StoreSubscriptionSource<S>>;

pub struct EngineServerState<S: TransactionStore> {
    pub engine: Arc<RelayEngine<S>>,
    pub metrics_registry: Arc<prometheus::Registry>,
}

impl<S: TransactionStore> Clone for EngineServerState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            metrics_registry: self.metrics_registry.clone(),
        }
    }
}

pub struct EngineServer {
    handle: Option<JoinHandle<Result<(), std::io::Error>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    app: Router,
}

/// Routes served by the relay, without the listener. Exposed for tests.
pub fn router<S: TransactionStore>(state: EngineServerState<S>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/v1/transactions", post(enqueue_transaction::<S>))
        .route("/v1/transactions/{id}", get(get_transaction::<S>))
        .route("/v1/transactions/{id}/cancel", post(cancel_transaction::<S>))
        .route("/admin/metrics", get(get_metrics::<S>))
        .route("/admin/indexers", get(list_indexers::<S>))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl EngineServer {
    pub fn new<S: TransactionStore>(state: EngineServerState<S>) -> Self {
        Self {
            handle: None,
            shutdown_tx: None,
            app: router(state),
        }
    }

    pub fn start(&mut self, listener: tokio::net::TcpListener) -> Result<(), std::io::Error> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = self.app.clone();
        let address = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            tracing::info!("HTTP server starting on {}", address);

            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let mut rx = shutdown_rx;
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    tracing::info!("HTTP server shutting down");
                })
                .await
        });

        self.handle = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(true).is_err() {
                tracing::error!("Failed to send shutdown signal to HTTP server");
            }
        }

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(result) => {
                    if let Err(e) = result {
                        tracing::error!("HTTP server error during shutdown: {}", e);
                        return Err(e);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to join HTTP server task: {}", e);
                    return Err(std::io::Error::other(format!("Task join error: {}", e)));
                }
            }
        }

        Ok(())
    }
}
