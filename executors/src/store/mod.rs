use std::future::Future;

use alloy::primitives::{Address, B256, Bytes, U256};
use engine_core::{
    error::EngineError,
    transaction::{FeeParams, GasOverrides, PreparedCall, ReceiptInfo},
};
use serde::{Deserialize, Serialize};

mod memory;
mod redis_store;
mod transition;

pub use memory::MemoryTransactionStore;
pub use redis_store::{RedisTransactionStore, StoreKeys};
pub use transition::{NonceSlotChange, Transition, TransitionEffects};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Queued,
    Submitted,
    Mined,
    Errored,
    Cancelled,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 5] = [
        TransactionStatus::Queued,
        TransactionStatus::Submitted,
        TransactionStatus::Mined,
        TransactionStatus::Errored,
        TransactionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Queued => "queued",
            TransactionStatus::Submitted => "submitted",
            TransactionStatus::Mined => "mined",
            TransactionStatus::Errored => "errored",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal for the submission pipeline. A reorg can still move a mined
    /// record back to submitted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Mined | TransactionStatus::Errored | TransactionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short lease a submission worker holds on a queued record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub worker_id: String,
    pub expires_at: u64,
}

/// One signed payload that was handed to the node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionAttempt {
    pub hash: B256,
    pub raw: Bytes,
    pub fees: FeeParams,
    pub gas_limit: u64,
    pub sent_at: u64,
}

/// Receipt fields persisted on a record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptSummary {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub success: bool,
}

impl From<&ReceiptInfo> for ReceiptSummary {
    fn from(receipt: &ReceiptInfo) -> Self {
        Self {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            block_hash: receipt.block_hash,
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
            success: receipt.status,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: String,
    pub chain_id: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub overrides: GasOverrides,

    pub status: TransactionStatus,
    pub nonce: Option<u64>,
    /// Hash of the most recent attempt, or of the mined one once mined.
    pub tx_hash: Option<B256>,
    pub gas_limit: Option<u64>,
    pub fees: Option<FeeParams>,
    #[serde(default)]
    pub attempts: Vec<SubmissionAttempt>,

    /// Send retries plus fee escalations.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub fee_bumps: u32,
    pub claim: Option<Claim>,
    #[serde(default)]
    pub next_attempt_at: u64,
    pub last_error: Option<String>,
    pub error_message: Option<String>,

    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub gas_used: Option<u64>,
    pub effective_gas_price: Option<u128>,
    #[serde(default)]
    pub reverted: bool,
    #[serde(default)]
    pub finalized: bool,

    pub created_at: u64,
    pub updated_at: u64,
    pub submitted_at: Option<u64>,
    pub mined_at: Option<u64>,
    pub completed_at: Option<u64>,

    /// Insertion order, assigned by the store. Breaks ties between records
    /// created in the same millisecond.
    #[serde(default)]
    pub sequence: u64,
}

impl TransactionRecord {
    pub fn new(
        id: String,
        call: PreparedCall,
        idempotency_key: Option<String>,
        overrides: GasOverrides,
        now: u64,
    ) -> Self {
        Self {
            id,
            chain_id: call.chain_id,
            from: call.from,
            to: call.to,
            data: call.data,
            value: call.value,
            idempotency_key,
            overrides,
            status: TransactionStatus::Queued,
            nonce: None,
            tx_hash: None,
            gas_limit: None,
            fees: None,
            attempts: Vec::new(),
            retry_count: 0,
            fee_bumps: 0,
            claim: None,
            next_attempt_at: now,
            last_error: None,
            error_message: None,
            block_number: None,
            block_hash: None,
            gas_used: None,
            effective_gas_price: None,
            reverted: false,
            finalized: false,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            mined_at: None,
            completed_at: None,
            sequence: 0,
        }
    }

    pub fn prepared_call(&self) -> PreparedCall {
        PreparedCall {
            chain_id: self.chain_id,
            from: self.from,
            to: self.to,
            data: self.data.clone(),
            value: self.value,
        }
    }

    pub fn has_live_claim(&self, now: u64) -> bool {
        self.claim.as_ref().is_some_and(|c| c.expires_at > now)
    }

    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.claim.as_ref().is_some_and(|c| c.worker_id == worker_id)
    }

    pub fn has_attempt(&self, hash: &B256) -> bool {
        self.attempts.iter().any(|a| &a.hash == hash)
    }

    /// Whether an existing record still owns its idempotency key.
    ///
    /// Live records always do. Mined records keep it for `window_ms` after mining;
    /// errored and cancelled records give it up immediately.
    pub fn holds_idempotency_key(&self, now: u64, window_ms: u64) -> bool {
        match self.status {
            TransactionStatus::Queued | TransactionStatus::Submitted => true,
            TransactionStatus::Mined => self
                .mined_at
                .is_none_or(|mined_at| mined_at.saturating_add(window_ms) > now),
            TransactionStatus::Errored | TransactionStatus::Cancelled => false,
        }
    }
}

/// Caller-facing view of a record. Signed payloads and lease details stay internal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub id: String,
    pub chain_id: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub idempotency_key: Option<String>,
    pub status: TransactionStatus,
    pub nonce: Option<u64>,
    pub tx_hash: Option<B256>,
    pub attempt_hashes: Vec<B256>,
    pub gas_limit: Option<u64>,
    pub fees: Option<FeeParams>,
    pub retry_count: u32,
    pub fee_bumps: u32,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub gas_used: Option<u64>,
    pub effective_gas_price: Option<u128>,
    pub reverted: bool,
    pub finalized: bool,
    pub error_message: Option<String>,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub submitted_at: Option<u64>,
    pub mined_at: Option<u64>,
}

impl From<&TransactionRecord> for TransactionView {
    fn from(record: &TransactionRecord) -> Self {
        Self {
            id: record.id.clone(),
            chain_id: record.chain_id,
            from: record.from,
            to: record.to,
            value: record.value,
            data: record.data.clone(),
            idempotency_key: record.idempotency_key.clone(),
            status: record.status,
            nonce: record.nonce,
            tx_hash: record.tx_hash,
            attempt_hashes: record.attempts.iter().map(|a| a.hash).collect(),
            gas_limit: record.gas_limit,
            fees: record.fees,
            retry_count: record.retry_count,
            fee_bumps: record.fee_bumps,
            block_number: record.block_number,
            block_hash: record.block_hash,
            gas_used: record.gas_used,
            effective_gas_price: record.effective_gas_price,
            reverted: record.reverted,
            finalized: record.finalized,
            error_message: record.error_message.clone(),
            last_error: record.last_error.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            submitted_at: record.submitted_at,
            mined_at: record.mined_at,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum StoreError {
    #[error("Transaction not found: {transaction_id}")]
    NotFound { transaction_id: String },

    #[error("Idempotency key {key} already used by {existing_id}")]
    DuplicateIdempotencyKey { key: String, existing_id: String },

    #[error("Cannot apply {transition} to {transaction_id} in status {status}: {reason}")]
    InvalidTransition {
        transaction_id: String,
        status: TransactionStatus,
        transition: String,
        reason: String,
    },

    #[error("Nonce {nonce} for {from} on chain {chain_id} is already held by {holder}")]
    NonceConflict {
        chain_id: u64,
        from: Address,
        nonce: u64,
        holder: String,
    },

    #[error("Transaction {transaction_id} kept changing underneath the update")]
    ConcurrentModification { transaction_id: String },

    #[error("Redis error: {message}")]
    RedisError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        StoreError::RedisError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::SerializationError {
            message: error.to_string(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { .. } | StoreError::DuplicateIdempotencyKey { .. } => {
                EngineError::ValidationError {
                    message: error.to_string(),
                }
            }
            _ => EngineError::InternalError {
                message: error.to_string(),
            },
        }
    }
}

/// Durable home of every transaction record.
///
/// Every mutation goes through [`TransactionStore::update_status`], which applies
/// a [`Transition`] as a compare-and-set against the record's current state.
pub trait TransactionStore: Send + Sync + 'static {
    /// Persist a new queued record. Fails with
    /// [`StoreError::DuplicateIdempotencyKey`] when another record owns its key.
    fn insert(
        &self,
        record: TransactionRecord,
    ) -> impl Future<Output = Result<TransactionRecord, StoreError>> + Send;

    fn get(&self, id: &str) -> impl Future<Output = Result<TransactionRecord, StoreError>> + Send;

    /// Records in `status`, in insertion order.
    fn list_by_status(
        &self,
        status: TransactionStatus,
        chain_id: Option<u64>,
    ) -> impl Future<Output = Result<Vec<TransactionRecord>, StoreError>> + Send;

    fn update_status(
        &self,
        id: &str,
        transition: Transition,
    ) -> impl Future<Output = Result<TransactionRecord, StoreError>> + Send;

    fn mark_cancelled(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<TransactionRecord, StoreError>> + Send {
        self.update_status(id, Transition::Cancel)
    }

    /// Record id that broadcast `hash` on `chain_id`, from any of its attempts.
    fn find_by_hash(
        &self,
        chain_id: u64,
        hash: B256,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Next block the indexer for `chain_id` should process.
    fn load_cursor(
        &self,
        chain_id: u64,
    ) -> impl Future<Output = Result<Option<u64>, StoreError>> + Send;

    fn save_cursor(
        &self,
        chain_id: u64,
        next_block: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
