use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use engine_core::{chain::ChainService, error::EngineError};
use tokio::sync::{Mutex, oneshot, watch};

use crate::{
    events::EventSink,
    indexer::{
        ChainIndexer, IndexerProgress,
        subscriptions::{SubscriptionSource, live_chain_ids},
    },
    metrics::set_running_indexers,
    options::EngineOptions,
    shutdown::WorkerHandle,
    store::TransactionStore,
    worker::idle,
};

/// A running indexer task and its progress feed.
pub struct IndexerHandle {
    pub chain_id: u64,
    worker: WorkerHandle,
    progress: watch::Receiver<IndexerProgress>,
}

impl IndexerHandle {
    pub fn progress(&self) -> IndexerProgress {
        *self.progress.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<u64>,
    pub stopped: Vec<u64>,
    /// Handles whose task had already exited and were cleared out.
    pub reaped: Vec<u64>,
    pub running: Vec<u64>,
}

/// Owns one [`ChainIndexer`] per chain with demand.
///
/// All changes to the running set happen under one async lock, so concurrent
/// [`IndexerRegistry::reconcile`] calls are serialized and never start two
/// indexers for the same chain.
pub struct IndexerRegistry<CS, S, E, Q> {
    chains: Arc<CS>,
    store: Arc<S>,
    events: Arc<E>,
    subscriptions: Arc<Q>,
    options: Arc<EngineOptions>,
    running: Mutex<HashMap<u64, IndexerHandle>>,
}

impl<CS, S, E, Q> IndexerRegistry<CS, S, E, Q>
where
    CS: ChainService,
    S: TransactionStore,
    E: EventSink,
    Q: SubscriptionSource,
{
    pub fn new(
        chains: Arc<CS>,
        store: Arc<S>,
        events: Arc<E>,
        subscriptions: Arc<Q>,
        options: Arc<EngineOptions>,
    ) -> Self {
        Self {
            chains,
            store,
            events,
            subscriptions,
            options,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub async fn running_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.running.lock().await.keys().copied().collect();
        chains.sort_unstable();
        chains
    }

    pub async fn progress(&self, chain_id: u64) -> Option<IndexerProgress> {
        self.running
            .lock()
            .await
            .get(&chain_id)
            .map(IndexerHandle::progress)
    }

    /// Make the running set match `desired`, plus every chain that still has
    /// transactions in flight. Idempotent.
    #[tracing::instrument(skip_all, fields(desired = ?desired))]
    pub async fn reconcile(&self, desired: &BTreeSet<u64>) -> Result<ReconcileReport, EngineError> {
        let mut running = self.running.lock().await;
        let mut report = ReconcileReport::default();

        let mut desired = desired.clone();
        desired.extend(live_chain_ids(self.store.as_ref()).await?);

        let finished: Vec<u64> = running
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(chain_id, _)| *chain_id)
            .collect();
        for chain_id in finished {
            if let Some(handle) = running.remove(&chain_id) {
                if let Err(e) = handle.worker.shutdown().await {
                    tracing::warn!(chain_id = chain_id, error = ?e, "Indexer had exited with an error");
                }
                report.reaped.push(chain_id);
            }
        }

        let unwanted: Vec<u64> = running
            .keys()
            .filter(|chain_id| !desired.contains(chain_id))
            .copied()
            .collect();
        for chain_id in unwanted {
            if let Some(handle) = running.remove(&chain_id) {
                tracing::info!(chain_id = chain_id, "Stopping indexer, chain has no demand");
                if let Err(e) = handle.worker.shutdown().await {
                    tracing::warn!(chain_id = chain_id, error = ?e, "Indexer stopped with an error");
                }
                report.stopped.push(chain_id);
            }
        }

        for chain_id in desired {
            if running.contains_key(&chain_id) {
                continue;
            }
            match self.chains.get_chain(chain_id) {
                Ok(chain) => {
                    tracing::info!(chain_id = chain_id, "Starting indexer");
                    running.insert(chain_id, self.spawn(chain));
                    report.started.push(chain_id);
                }
                Err(e) => tracing::warn!(
                    chain_id = chain_id,
                    error = %e,
                    "Chain has demand but no RPC is configured, not indexing it"
                ),
            }
        }

        set_running_indexers(running.len());
        report.running = running.keys().copied().collect();
        report.running.sort_unstable();
        Ok(report)
    }

    fn spawn(&self, chain: CS::Chain) -> IndexerHandle {
        let (indexer, progress) = ChainIndexer::new(
            chain,
            self.store.clone(),
            self.events.clone(),
            self.subscriptions.clone(),
            self.options.clone(),
        );
        let chain_id = indexer.chain_id();
        let worker = WorkerHandle::spawn(format!("indexer-{chain_id}"), move |shutdown| {
            indexer.run(shutdown)
        });

        IndexerHandle {
            chain_id,
            worker,
            progress,
        }
    }

    /// Reconcile against the subscription source on a fixed interval until
    /// shutdown, then stop every indexer.
    pub async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) -> Result<(), EngineError> {
        tracing::info!("Indexer registry started");

        loop {
            match self.subscriptions.list_active_chain_ids().await {
                Ok(desired) => match self.reconcile(&desired).await {
                    Ok(report) if !report.started.is_empty() || !report.stopped.is_empty() => {
                        tracing::info!(?report, "Reconciled chain indexers");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = ?e, "Indexer reconciliation failed"),
                },
                Err(e) => tracing::warn!(error = ?e, "Could not load active chains"),
            }

            if idle(&mut shutdown, self.options.registry_reconcile_interval(), None).await {
                break;
            }
        }

        self.shutdown().await
    }

    /// Stop every running indexer. Each one persists its cursor on the way out.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        let mut first_error = None;

        for (chain_id, handle) in running.drain() {
            if let Err(e) = handle.worker.shutdown().await {
                tracing::error!(chain_id = chain_id, error = ?e, "Indexer shut down with error");
                first_error.get_or_insert(e);
            }
        }

        set_running_indexers(0);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
