use std::sync::Arc;

use alloy::primitives::{Address, Bytes, U256};
use engine_core::{
    chain::ChainService,
    error::EngineError,
    signer::TransactionSigner,
    transaction::{GasOverrides, PreparedCall},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{
    events::{EventKind, EventSink, emit},
    indexer::{IndexerRegistry, SubscriptionSource},
    nonce_manager::NonceManager,
    options::EngineOptions,
    shutdown::{ShutdownHandle, WorkerHandle},
    store::{StoreError, TransactionRecord, TransactionStore, TransactionView, now_ms},
    worker::{ConfirmationWorker, SubmissionWorker},
};

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

/// Errors returned to callers of the engine facade.
#[derive(Debug, thiserror::Error, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum EngineApiError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Transaction not found: {transaction_id}")]
    NotFound { transaction_id: String },

    #[error("Invalid transition: {message}")]
    InvalidTransition { message: String },

    #[error("Store error: {message}")]
    Store { message: String },
}

impl From<StoreError> for EngineApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { transaction_id } => EngineApiError::NotFound { transaction_id },
            other @ StoreError::InvalidTransition { .. } => EngineApiError::InvalidTransition {
                message: other.to_string(),
            },
            other => EngineApiError::Store {
                message: other.to_string(),
            },
        }
    }
}

impl From<EngineError> for EngineApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::ValidationError { message } => EngineApiError::Validation { message },
            other => EngineApiError::Store {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "EnqueueBody", into = "EnqueueBody")]
pub struct EnqueueRequest {
    pub call: PreparedCall,
    pub idempotency_key: Option<String>,
    pub overrides: GasOverrides,
}

/// Wire shape of [`EnqueueRequest`], with the call fields at the top level.
/// Spelled out rather than flattened: serde cannot buffer the `u128` overrides.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueBody {
    chain_id: u64,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    #[serde(default)]
    data: Bytes,
    #[serde(default)]
    value: U256,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    overrides: GasOverrides,
}

impl From<EnqueueBody> for EnqueueRequest {
    fn from(body: EnqueueBody) -> Self {
        Self {
            call: PreparedCall {
                chain_id: body.chain_id,
                from: body.from,
                to: body.to,
                data: body.data,
                value: body.value,
            },
            idempotency_key: body.idempotency_key,
            overrides: body.overrides,
        }
    }
}

impl From<EnqueueRequest> for EnqueueBody {
    fn from(request: EnqueueRequest) -> Self {
        Self {
            chain_id: request.call.chain_id,
            from: request.call.from,
            to: request.call.to,
            data: request.call.data,
            value: request.call.value,
            idempotency_key: request.idempotency_key,
            overrides: request.overrides,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResult {
    pub id: String,
    /// The idempotency key matched an existing record and nothing new was queued.
    pub duplicate: bool,
}

/// Caller-facing entry point: enqueue, status and cancel, plus wiring for the
/// background workers that move records through their lifecycle.
pub struct TransactionEngine<S, CS, Sg, E, Q> {
    store: Arc<S>,
    chains: Arc<CS>,
    signer: Arc<Sg>,
    events: Arc<E>,
    nonces: Arc<NonceManager>,
    options: Arc<EngineOptions>,
    wake: Arc<Notify>,
    worker_id: String,
    registry: Arc<IndexerRegistry<CS, S, E, Q>>,
}

impl<S, CS, Sg, E, Q> TransactionEngine<S, CS, Sg, E, Q>
where
    S: TransactionStore,
    CS: ChainService,
    Sg: TransactionSigner,
    E: EventSink,
    Q: SubscriptionSource,
{
    pub fn new(
        store: Arc<S>,
        chains: Arc<CS>,
        signer: Arc<Sg>,
        events: Arc<E>,
        subscriptions: Arc<Q>,
        options: EngineOptions,
    ) -> Self {
        let worker_id = options
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
        let options = Arc::new(options);
        let registry = Arc::new(IndexerRegistry::new(
            chains.clone(),
            store.clone(),
            events.clone(),
            subscriptions,
            options.clone(),
        ));

        Self {
            store,
            chains,
            signer,
            events,
            nonces: Arc::new(NonceManager::new()),
            options,
            wake: Arc::new(Notify::new()),
            worker_id,
            registry,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn nonces(&self) -> &Arc<NonceManager> {
        &self.nonces
    }

    pub fn registry(&self) -> &Arc<IndexerRegistry<CS, S, E, Q>> {
        &self.registry
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn validate(&self, request: &EnqueueRequest) -> Result<(), EngineError> {
        let call = &request.call;

        if self.chains.get_chain(call.chain_id).is_err() {
            return Err(EngineError::validation(format!(
                "chain {} is not supported",
                call.chain_id
            )));
        }
        if !self.signer.manages(call.from) {
            return Err(EngineError::validation(format!(
                "sender {} is not a managed wallet",
                call.from
            )));
        }
        if call.to.is_none() && call.data.is_empty() {
            return Err(EngineError::validation(
                "contract creation requires calldata",
            ));
        }
        if let Some(key) = &request.idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(EngineError::validation(format!(
                    "idempotencyKey must be 1 to {MAX_IDEMPOTENCY_KEY_LEN} characters"
                )));
            }
        }
        request.overrides.validate()
    }

    /// Validate and persist a new queued record. Returns immediately; the
    /// submission worker picks it up asynchronously.
    #[tracing::instrument(skip_all, fields(chain_id = request.call.chain_id, from = %request.call.from))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResult, EngineApiError> {
        self.validate(&request)?;

        let record = TransactionRecord::new(
            uuid::Uuid::new_v4().to_string(),
            request.call,
            request.idempotency_key,
            request.overrides,
            now_ms(),
        );

        match self.store.insert(record).await {
            Ok(record) => {
                tracing::info!(transaction_id = record.id, "Transaction queued");
                emit(self.events.as_ref(), EventKind::TransactionQueued, &record).await;
                self.wake.notify_one();
                Ok(EnqueueResult {
                    id: record.id,
                    duplicate: false,
                })
            }
            Err(StoreError::DuplicateIdempotencyKey { key, existing_id }) => {
                tracing::info!(
                    idempotency_key = key,
                    transaction_id = existing_id,
                    "Idempotency key already used, returning existing transaction"
                );
                Ok(EnqueueResult {
                    id: existing_id,
                    duplicate: true,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_status(&self, id: &str) -> Result<TransactionView, EngineApiError> {
        let record = self.store.get(id).await?;
        Ok(TransactionView::from(&record))
    }

    /// Cancel a queued record. Fails with `InvalidTransition` once a worker
    /// has picked it up.
    pub async fn cancel(&self, id: &str) -> Result<TransactionView, EngineApiError> {
        let record = self.store.mark_cancelled(id).await?;
        tracing::info!(transaction_id = record.id, "Transaction cancelled");
        emit(self.events.as_ref(), EventKind::TransactionCancelled, &record).await;
        Ok(TransactionView::from(&record))
    }

    pub fn submission_worker(&self) -> SubmissionWorker<S, CS, Sg, E> {
        SubmissionWorker {
            worker_id: self.worker_id.clone(),
            store: self.store.clone(),
            chains: self.chains.clone(),
            signer: self.signer.clone(),
            events: self.events.clone(),
            nonces: self.nonces.clone(),
            options: self.options.clone(),
            wake: self.wake.clone(),
        }
    }

    pub fn confirmation_worker(&self) -> ConfirmationWorker<S, CS, Sg, E> {
        ConfirmationWorker {
            store: self.store.clone(),
            chains: self.chains.clone(),
            signer: self.signer.clone(),
            events: self.events.clone(),
            options: self.options.clone(),
        }
    }

    /// Spawn the submission worker, the confirmation worker and the indexer
    /// registry loop.
    pub fn start_workers(&self) -> ShutdownHandle {
        let mut handle = ShutdownHandle::new();

        let submission = self.submission_worker();
        handle.add_worker(WorkerHandle::spawn("submission", move |shutdown| {
            submission.run(shutdown)
        }));

        let confirmation = self.confirmation_worker();
        handle.add_worker(WorkerHandle::spawn("confirmation", move |shutdown| {
            confirmation.run(shutdown)
        }));

        let registry = self.registry.clone();
        handle.add_worker(WorkerHandle::spawn("indexer-registry", move |shutdown| {
            registry.run(shutdown)
        }));

        tracing::info!(
            worker_id = self.worker_id,
            workers = handle.worker_count(),
            "Engine workers started"
        );
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_body_accepts_fee_overrides() {
        let body = serde_json::json!({
            "chainId": 137,
            "from": Address::repeat_byte(0x0a),
            "to": Address::repeat_byte(0x0c),
            "value": "0x1",
            "idempotencyKey": "order-7",
            "overrides": {
                "gasLimit": 90000,
                "maxFeePerGas": 40000000000u64,
                "maxPriorityFeePerGas": 2000000000u64
            }
        });

        let request: EnqueueRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.call.chain_id, 137);
        assert_eq!(request.call.value, U256::from(1));
        assert!(request.call.data.is_empty());
        assert_eq!(request.idempotency_key.as_deref(), Some("order-7"));
        assert_eq!(request.overrides.max_fee_per_gas, Some(40_000_000_000));
        assert_eq!(request.overrides.gas_price, None);

        let again: EnqueueRequest =
            serde_json::from_slice(&serde_json::to_vec(&request).unwrap()).unwrap();
        assert_eq!(again, request);
    }
}
