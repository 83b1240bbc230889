use std::collections::HashMap;

use alloy::primitives::{Address, B256};
use tokio::sync::Mutex;

use super::{
    NonceSlotChange, StoreError, TransactionRecord, TransactionStatus, TransactionStore,
    Transition, now_ms,
};

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, TransactionRecord>,
    idempotency: HashMap<String, String>,
    nonce_slots: HashMap<(u64, Address, u64), String>,
    hashes: HashMap<(u64, B256), String>,
    cursors: HashMap<u64, u64>,
    next_sequence: u64,
}

/// Single-process store. Used by tests and by deployments without Redis.
pub struct MemoryTransactionStore {
    state: Mutex<MemoryState>,
    idempotency_window_ms: u64,
}

impl MemoryTransactionStore {
    pub fn new(idempotency_window_ms: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            idempotency_window_ms,
        }
    }
}

impl TransactionStore for MemoryTransactionStore {
    async fn insert(&self, mut record: TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let mut state = self.state.lock().await;
        let now = now_ms();

        if let Some(key) = &record.idempotency_key {
            if let Some(existing_id) = state.idempotency.get(key) {
                let holds = state
                    .records
                    .get(existing_id)
                    .is_some_and(|existing| {
                        existing.holds_idempotency_key(now, self.idempotency_window_ms)
                    });
                if holds {
                    return Err(StoreError::DuplicateIdempotencyKey {
                        key: key.clone(),
                        existing_id: existing_id.clone(),
                    });
                }
            }
            state.idempotency.insert(key.clone(), record.id.clone());
        }

        state.next_sequence += 1;
        record.sequence = state.next_sequence;
        state.records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<TransactionRecord, StoreError> {
        let state = self.state.lock().await;
        state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                transaction_id: id.to_string(),
            })
    }

    async fn list_by_status(
        &self,
        status: TransactionStatus,
        chain_id: Option<u64>,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<TransactionRecord> = state
            .records
            .values()
            .filter(|r| r.status == status && chain_id.is_none_or(|c| r.chain_id == c))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    async fn update_status(
        &self,
        id: &str,
        transition: Transition,
    ) -> Result<TransactionRecord, StoreError> {
        let mut state = self.state.lock().await;
        let mut record = state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                transaction_id: id.to_string(),
            })?;

        let effects = transition.apply(&mut record, now_ms())?;

        match effects.slot {
            NonceSlotChange::Acquire(nonce) => {
                let slot = (record.chain_id, record.from, nonce);
                if let Some(holder) = state.nonce_slots.get(&slot) {
                    if holder != id {
                        return Err(StoreError::NonceConflict {
                            chain_id: record.chain_id,
                            from: record.from,
                            nonce,
                            holder: holder.clone(),
                        });
                    }
                }
                state.nonce_slots.insert(slot, id.to_string());
            }
            NonceSlotChange::Release(nonce) => {
                let slot = (record.chain_id, record.from, nonce);
                if state.nonce_slots.get(&slot).is_some_and(|holder| holder == id) {
                    state.nonce_slots.remove(&slot);
                }
            }
            NonceSlotChange::None => {}
        }

        for hash in effects.new_hashes {
            state.hashes.insert((record.chain_id, hash), id.to_string());
        }

        state.records.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn find_by_hash(&self, chain_id: u64, hash: B256) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(&(chain_id, hash)).cloned())
    }

    async fn load_cursor(&self, chain_id: u64) -> Result<Option<u64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.cursors.get(&chain_id).copied())
    }

    async fn save_cursor(&self, chain_id: u64, next_block: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.cursors.insert(chain_id, next_block);
        Ok(())
    }
}
