use std::future::Future;

use alloy::primitives::{Address, B256};
use engine_core::transaction::LogInfo;
use serde::{Deserialize, Serialize};

use crate::{
    indexer::subscriptions::ContractEventSubscription,
    store::{TransactionRecord, TransactionView, now_ms},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TransactionQueued,
    TransactionSubmitted,
    TransactionRepriced,
    /// First inclusion in a block. Not final: a reorg can still undo it.
    TransactionMined,
    /// Mined and buried under the configured confirmation depth.
    TransactionConfirmed,
    TransactionErrored,
    TransactionCancelled,
    /// A previously mined transaction's block was orphaned.
    TransactionReorged,
    ContractEvent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TransactionQueued => "transaction_queued",
            EventKind::TransactionSubmitted => "transaction_submitted",
            EventKind::TransactionRepriced => "transaction_repriced",
            EventKind::TransactionMined => "transaction_mined",
            EventKind::TransactionConfirmed => "transaction_confirmed",
            EventKind::TransactionErrored => "transaction_errored",
            EventKind::TransactionCancelled => "transaction_cancelled",
            EventKind::TransactionReorged => "transaction_reorged",
            EventKind::ContractEvent => "contract_event",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body delivered to event sinks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub kind: EventKind,
    pub chain_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub timestamp: u64,
    pub data: serde_json::Value,
}

/// Payload of a [`EventKind::ContractEvent`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContractEventData {
    pub subscription_id: String,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: alloy::primitives::Bytes,
    pub log_index: Option<u64>,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
}

impl EventEnvelope {
    pub fn for_transaction(kind: EventKind, record: &TransactionRecord) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            kind,
            chain_id: record.chain_id,
            transaction_id: Some(record.id.clone()),
            timestamp: now_ms(),
            data: serde_json::to_value(TransactionView::from(record))
                .unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn for_log(
        subscription: &ContractEventSubscription,
        log: &LogInfo,
        transaction_hash: B256,
        block_number: u64,
        block_hash: B256,
    ) -> Self {
        let data = ContractEventData {
            subscription_id: subscription.id.clone(),
            address: log.address,
            topics: log.topics.clone(),
            data: log.data.clone(),
            log_index: log.log_index,
            transaction_hash,
            block_number,
            block_hash,
        };

        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            kind: EventKind::ContractEvent,
            chain_id: subscription.chain_id,
            transaction_id: None,
            timestamp: now_ms(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Receives status and contract events. Delivery failures are the sink's
/// problem; workers never block on them.
pub trait EventSink: Send + Sync + 'static {
    fn notify(&self, kind: EventKind, payload: EventEnvelope)
    -> impl Future<Output = ()> + Send;
}

/// Logs every event. Default sink when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    async fn notify(&self, kind: EventKind, payload: EventEnvelope) {
        tracing::info!(
            event_id = payload.event_id,
            kind = %kind,
            chain_id = payload.chain_id,
            transaction_id = payload.transaction_id.as_deref(),
            "Engine event"
        );
    }
}

/// Shorthand used by the workers.
pub(crate) async fn emit<E: EventSink>(events: &E, kind: EventKind, record: &TransactionRecord) {
    events
        .notify(kind, EventEnvelope::for_transaction(kind, record))
        .await;
}
