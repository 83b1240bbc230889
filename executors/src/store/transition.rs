use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

use super::{
    Claim, ReceiptSummary, StoreError, SubmissionAttempt, TransactionRecord, TransactionStatus,
};

/// A single state change on a record.
///
/// Each variant names the statuses it may start from plus any claim or nonce
/// precondition. Backends apply it atomically against the stored record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Transition {
    /// queued -> queued. Takes the lease on an unclaimed, due record.
    #[serde(rename_all = "camelCase")]
    Claim { worker_id: String, lease_ms: u64 },

    /// queued -> queued. Pins the nonce. Fails with `NonceConflict` when another
    /// live record holds the same (chain, sender, nonce).
    #[serde(rename_all = "camelCase")]
    AssignNonce { worker_id: String, nonce: u64 },

    /// queued -> queued. Persists a signed payload before it is broadcast.
    #[serde(rename_all = "camelCase")]
    RecordAttempt {
        worker_id: String,
        attempt: SubmissionAttempt,
    },

    /// queued -> submitted.
    #[serde(rename_all = "camelCase")]
    Submit { worker_id: String, tx_hash: B256 },

    /// queued -> queued. Gives up the lease and schedules the next try.
    #[serde(rename_all = "camelCase")]
    Requeue {
        worker_id: String,
        error: String,
        retry_after_ms: u64,
        count_retry: bool,
    },

    /// submitted -> submitted. One fee escalation. `attempt` is `None` when the
    /// previous payload was rebroadcast unchanged.
    #[serde(rename_all = "camelCase")]
    Reprice { attempt: Option<SubmissionAttempt> },

    /// submitted -> mined, or mined -> mined when the transaction moved blocks.
    #[serde(rename_all = "camelCase")]
    Mine { receipt: ReceiptSummary },

    /// submitted | mined -> errored, with the reverted receipt attached.
    #[serde(rename_all = "camelCase")]
    Revert { receipt: ReceiptSummary },

    /// queued | submitted -> errored. A queued record must be claimed by
    /// `worker_id` when one is given.
    #[serde(rename_all = "camelCase")]
    Fail {
        reason: String,
        worker_id: Option<String>,
    },

    /// mined -> mined, past confirmation depth.
    Finalize,

    /// mined | errored-with-receipt -> submitted. The including block was orphaned.
    Reorg,

    /// queued -> cancelled. Refused once a worker holds the record or a nonce
    /// has been assigned.
    Cancel,
}

/// What a transition did to the (chain, sender, nonce) uniqueness slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceSlotChange {
    None,
    Acquire(u64),
    Release(u64),
}

/// Side effects a backend must mirror into its secondary indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEffects {
    pub slot: NonceSlotChange,
    pub new_hashes: Vec<B256>,
}

impl TransitionEffects {
    fn none() -> Self {
        Self {
            slot: NonceSlotChange::None,
            new_hashes: Vec::new(),
        }
    }
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Claim { .. } => "claim",
            Transition::AssignNonce { .. } => "assign_nonce",
            Transition::RecordAttempt { .. } => "record_attempt",
            Transition::Submit { .. } => "submit",
            Transition::Requeue { .. } => "requeue",
            Transition::Reprice { .. } => "reprice",
            Transition::Mine { .. } => "mine",
            Transition::Revert { .. } => "revert",
            Transition::Fail { .. } => "fail",
            Transition::Finalize => "finalize",
            Transition::Reorg => "reorg",
            Transition::Cancel => "cancel",
        }
    }

    fn reject(&self, record: &TransactionRecord, reason: impl Into<String>) -> StoreError {
        StoreError::InvalidTransition {
            transaction_id: record.id.clone(),
            status: record.status,
            transition: self.name().to_string(),
            reason: reason.into(),
        }
    }

    fn expect_status(
        &self,
        record: &TransactionRecord,
        allowed: &[TransactionStatus],
    ) -> Result<(), StoreError> {
        if allowed.contains(&record.status) {
            Ok(())
        } else {
            Err(self.reject(record, "status does not allow this transition"))
        }
    }

    fn expect_claim(&self, record: &TransactionRecord, worker_id: &str) -> Result<(), StoreError> {
        if record.is_claimed_by(worker_id) {
            Ok(())
        } else {
            Err(self.reject(record, format!("not claimed by worker {worker_id}")))
        }
    }

    /// Apply to `record` in place. On error the record is left untouched.
    pub fn apply(
        &self,
        record: &mut TransactionRecord,
        now: u64,
    ) -> Result<TransitionEffects, StoreError> {
        use TransactionStatus::*;

        let mut effects = TransitionEffects::none();

        match self {
            Transition::Claim {
                worker_id,
                lease_ms,
            } => {
                self.expect_status(record, &[Queued])?;
                if record.has_live_claim(now) && !record.is_claimed_by(worker_id) {
                    return Err(self.reject(record, "claimed by another worker"));
                }
                if record.next_attempt_at > now {
                    return Err(self.reject(record, "backing off"));
                }
                record.claim = Some(Claim {
                    worker_id: worker_id.clone(),
                    expires_at: now.saturating_add(*lease_ms),
                });
            }

            Transition::AssignNonce { worker_id, nonce } => {
                self.expect_status(record, &[Queued])?;
                self.expect_claim(record, worker_id)?;
                if record.nonce.is_some() {
                    return Err(self.reject(record, "nonce already assigned"));
                }
                record.nonce = Some(*nonce);
                effects.slot = NonceSlotChange::Acquire(*nonce);
            }

            Transition::RecordAttempt { worker_id, attempt } => {
                self.expect_status(record, &[Queued])?;
                self.expect_claim(record, worker_id)?;
                if record.nonce.is_none() {
                    return Err(self.reject(record, "no nonce assigned"));
                }
                record.fees = Some(attempt.fees);
                record.gas_limit = Some(attempt.gas_limit);
                record.tx_hash = Some(attempt.hash);
                if !record.has_attempt(&attempt.hash) {
                    effects.new_hashes.push(attempt.hash);
                    record.attempts.push(attempt.clone());
                }
            }

            Transition::Submit { worker_id, tx_hash } => {
                self.expect_status(record, &[Queued])?;
                self.expect_claim(record, worker_id)?;
                if record.nonce.is_none() {
                    return Err(self.reject(record, "no nonce assigned"));
                }
                if !record.has_attempt(tx_hash) {
                    effects.new_hashes.push(*tx_hash);
                }
                record.status = Submitted;
                record.tx_hash = Some(*tx_hash);
                record.submitted_at = Some(now);
                record.claim = None;
                record.last_error = None;
            }

            Transition::Requeue {
                worker_id,
                error,
                retry_after_ms,
                count_retry,
            } => {
                self.expect_status(record, &[Queued])?;
                self.expect_claim(record, worker_id)?;
                if *count_retry {
                    record.retry_count += 1;
                }
                record.claim = None;
                record.next_attempt_at = now.saturating_add(*retry_after_ms);
                record.last_error = Some(error.clone());
            }

            Transition::Reprice { attempt } => {
                self.expect_status(record, &[Submitted])?;
                record.fee_bumps += 1;
                record.retry_count += 1;
                if let Some(attempt) = attempt {
                    record.fees = Some(attempt.fees);
                    record.tx_hash = Some(attempt.hash);
                    if !record.has_attempt(&attempt.hash) {
                        effects.new_hashes.push(attempt.hash);
                        record.attempts.push(attempt.clone());
                    }
                } else if let Some(last) = record.attempts.last_mut() {
                    last.sent_at = now;
                }
            }

            Transition::Mine { receipt } => {
                self.expect_status(record, &[Submitted, Mined])?;
                if !receipt.success {
                    return Err(self.reject(record, "receipt reports a revert"));
                }
                if !record.has_attempt(&receipt.transaction_hash)
                    && record.tx_hash != Some(receipt.transaction_hash)
                {
                    return Err(self.reject(record, "receipt hash is not one of its attempts"));
                }
                let moved = record.block_hash != Some(receipt.block_hash);
                record.status = Mined;
                record.tx_hash = Some(receipt.transaction_hash);
                record.block_number = Some(receipt.block_number);
                record.block_hash = Some(receipt.block_hash);
                record.gas_used = Some(receipt.gas_used);
                record.effective_gas_price = Some(receipt.effective_gas_price);
                record.reverted = false;
                record.error_message = None;
                if moved {
                    record.finalized = false;
                    record.mined_at = Some(now);
                }
                record.completed_at = Some(now);
            }

            Transition::Revert { receipt } => {
                self.expect_status(record, &[Submitted, Mined])?;
                if receipt.success {
                    return Err(self.reject(record, "receipt reports success"));
                }
                record.status = Errored;
                record.tx_hash = Some(receipt.transaction_hash);
                record.block_number = Some(receipt.block_number);
                record.block_hash = Some(receipt.block_hash);
                record.gas_used = Some(receipt.gas_used);
                record.effective_gas_price = Some(receipt.effective_gas_price);
                record.reverted = true;
                record.finalized = false;
                record.error_message = Some("transaction reverted on-chain".to_string());
                record.completed_at = Some(now);
                if let Some(nonce) = record.nonce {
                    effects.slot = NonceSlotChange::Release(nonce);
                }
            }

            Transition::Fail { reason, worker_id } => {
                self.expect_status(record, &[Queued, Submitted])?;
                if record.status == Queued {
                    if let Some(worker_id) = worker_id {
                        self.expect_claim(record, worker_id)?;
                    }
                }
                record.status = Errored;
                record.claim = None;
                record.error_message = Some(reason.clone());
                record.completed_at = Some(now);
                if let Some(nonce) = record.nonce {
                    effects.slot = NonceSlotChange::Release(nonce);
                }
            }

            Transition::Finalize => {
                self.expect_status(record, &[Mined])?;
                record.finalized = true;
            }

            Transition::Reorg => {
                let was_errored = record.status == Errored;
                self.expect_status(record, &[Mined, Errored])?;
                if record.block_number.is_none() {
                    return Err(self.reject(record, "never included in a block"));
                }
                if was_errored {
                    if let Some(nonce) = record.nonce {
                        effects.slot = NonceSlotChange::Acquire(nonce);
                    }
                }
                record.status = Submitted;
                record.block_number = None;
                record.block_hash = None;
                record.gas_used = None;
                record.effective_gas_price = None;
                record.reverted = false;
                record.finalized = false;
                record.mined_at = None;
                record.completed_at = None;
                record.error_message = None;
                // give the node a full stall period before escalating again
                record.submitted_at = Some(now);
                if let Some(last) = record.attempts.last_mut() {
                    last.sent_at = now;
                }
            }

            Transition::Cancel => {
                self.expect_status(record, &[Queued])?;
                if record.has_live_claim(now) {
                    return Err(self.reject(record, "already being submitted"));
                }
                if record.nonce.is_some() {
                    return Err(self.reject(record, "nonce already assigned"));
                }
                record.status = Cancelled;
                record.claim = None;
                record.error_message = Some("cancelled by caller".to_string());
                record.completed_at = Some(now);
            }
        }

        record.updated_at = now;
        Ok(effects)
    }
}
