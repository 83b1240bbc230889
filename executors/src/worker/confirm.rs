use std::sync::Arc;

use alloy::primitives::keccak256;
use engine_core::{
    chain::{Chain, ChainService, NonceTag},
    error::EngineError,
    signer::TransactionSigner,
    transaction::{ReceiptInfo, UnsignedTransaction},
};
use tokio::sync::oneshot;

use crate::{
    events::{EventKind, EventSink, emit},
    metrics::{
        calculate_duration_seconds, record_fee_escalation, record_submission_failure,
        record_transaction_queued_to_mined,
    },
    options::EngineOptions,
    store::{
        ReceiptSummary, StoreError, SubmissionAttempt, TransactionRecord, TransactionStatus,
        TransactionStore, Transition, now_ms,
    },
    worker::{
        error::{SendContext, SendErrorClassification, WorkerError, classify_send_error},
        find_receipt, idle,
    },
};

pub const REPLACED_REASON: &str = "nonce consumed by another transaction";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmCycleReport {
    pub mined: u32,
    pub reverted: u32,
    pub repriced: u32,
    pub rebroadcast: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StallOutcome {
    Mined,
    Reverted,
    Repriced,
    Rebroadcast,
    Failed,
    Skipped,
}

impl ConfirmCycleReport {
    fn count(&mut self, outcome: StallOutcome) {
        match outcome {
            StallOutcome::Mined => self.mined += 1,
            StallOutcome::Reverted => self.reverted += 1,
            StallOutcome::Repriced => self.repriced += 1,
            StallOutcome::Rebroadcast => self.rebroadcast += 1,
            StallOutcome::Failed => self.failed += 1,
            StallOutcome::Skipped => {}
        }
    }
}

/// When the record's latest payload was handed to the node.
fn last_sent_at(record: &TransactionRecord) -> u64 {
    record
        .attempts
        .last()
        .map(|attempt| attempt.sent_at)
        .or(record.submitted_at)
        .unwrap_or(record.updated_at)
}

/// Watches submitted records that have gone quiet: settles them from
/// receipts the indexer has not seen yet, re-prices them, or gives up.
pub struct ConfirmationWorker<S, CS, Sg, E> {
    pub store: Arc<S>,
    pub chains: Arc<CS>,
    pub signer: Arc<Sg>,
    pub events: Arc<E>,
    pub options: Arc<EngineOptions>,
}

impl<S, CS, Sg, E> ConfirmationWorker<S, CS, Sg, E>
where
    S: TransactionStore,
    CS: ChainService,
    Sg: TransactionSigner,
    E: EventSink,
{
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<(), EngineError> {
        tracing::info!("Confirmation worker started");

        loop {
            match self.run_cycle().await {
                Ok(report) if report != ConfirmCycleReport::default() => {
                    tracing::debug!(?report, "Confirmation cycle finished");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Confirmation cycle failed"),
            }

            if idle(&mut shutdown, self.options.retry_poll_interval(), None).await {
                break;
            }
        }

        tracing::info!("Confirmation worker stopped");
        Ok(())
    }

    // ========== CONFIRM FLOW ==========
    #[tracing::instrument(skip_all)]
    pub async fn run_cycle(&self) -> Result<ConfirmCycleReport, WorkerError> {
        let now = now_ms();
        let stalled: Vec<TransactionRecord> = self
            .store
            .list_by_status(TransactionStatus::Submitted, None)
            .await?
            .into_iter()
            .filter(|record| {
                now.saturating_sub(last_sent_at(record)) >= self.options.stall_threshold_ms
            })
            .collect();

        let mut report = ConfirmCycleReport::default();
        for batch in stalled.chunks(self.options.send_concurrency.max(1)) {
            let futures: Vec<_> = batch
                .iter()
                .map(|record| async move { (record, self.process_stalled(record).await) })
                .collect();

            for (record, result) in futures::future::join_all(futures).await {
                match result {
                    Ok(outcome) => report.count(outcome),
                    Err(e) => tracing::warn!(
                        transaction_id = record.id,
                        error = ?e,
                        "Failed to process stalled transaction"
                    ),
                }
            }
        }

        Ok(report)
    }

    #[tracing::instrument(skip_all, fields(transaction_id = record.id, chain_id = record.chain_id, nonce = record.nonce))]
    async fn process_stalled(&self, record: &TransactionRecord) -> Result<StallOutcome, WorkerError> {
        let chain = self
            .chains
            .get_chain(record.chain_id)
            .map_err(|e| WorkerError::ChainServiceError {
                chain_id: record.chain_id,
                message: e.to_string(),
            })?;

        if let Some(receipt) = find_receipt(&chain, record)
            .await
            .map_err(WorkerError::rpc)?
        {
            return self.settle(record, &receipt).await;
        }

        let nonce = record.nonce.ok_or_else(|| WorkerError::InternalError {
            message: format!("submitted record {} has no nonce", record.id),
        })?;

        let chain_latest = chain
            .get_account_nonce(record.from, NonceTag::Latest)
            .await
            .map_err(WorkerError::rpc)?;
        if chain_latest > nonce {
            // one of ours may have been mined after the first lookup
            if let Some(receipt) = find_receipt(&chain, record)
                .await
                .map_err(WorkerError::rpc)?
            {
                return self.settle(record, &receipt).await;
            }
            tracing::warn!(
                chain_latest = chain_latest,
                "Nonce was consumed and none of our attempts has a receipt"
            );
            return self.fail(record, REPLACED_REASON.to_string()).await;
        }

        if record.fee_bumps >= self.options.max_fee_escalations {
            return self
                .fail(
                    record,
                    format!(
                        "Transaction not mined after {} fee escalations",
                        record.fee_bumps
                    ),
                )
                .await;
        }

        self.escalate(&chain, record, nonce).await
    }

    async fn settle(
        &self,
        record: &TransactionRecord,
        receipt: &ReceiptInfo,
    ) -> Result<StallOutcome, WorkerError> {
        let summary = ReceiptSummary::from(receipt);
        let (transition, kind, outcome) = if receipt.status {
            (
                Transition::Mine { receipt: summary },
                EventKind::TransactionMined,
                StallOutcome::Mined,
            )
        } else {
            (
                Transition::Revert { receipt: summary },
                EventKind::TransactionErrored,
                StallOutcome::Reverted,
            )
        };

        let Some(updated) = self.apply(record, transition).await? else {
            return Ok(StallOutcome::Skipped);
        };

        tracing::info!(
            tx_hash = %receipt.transaction_hash,
            block = receipt.block_number,
            success = receipt.status,
            "Settled stalled transaction from receipt"
        );
        if receipt.status {
            record_transaction_queued_to_mined(
                updated.chain_id,
                calculate_duration_seconds(updated.created_at, now_ms()),
            );
        }
        emit(self.events.as_ref(), kind, &updated).await;
        Ok(outcome)
    }

    // ========== GAS BUMP ==========

    /// Re-sign at the same nonce with higher fees. When the cap leaves no
    /// room for a valid replacement the previous payload is resent instead.
    async fn escalate(
        &self,
        chain: &CS::Chain,
        record: &TransactionRecord,
        nonce: u64,
    ) -> Result<StallOutcome, WorkerError> {
        let last = record.attempts.last();
        let previous = last
            .map(|attempt| attempt.fees)
            .or(record.fees)
            .ok_or_else(|| WorkerError::InternalError {
                message: format!("submitted record {} has no fee parameters", record.id),
            })?;
        let gas_limit = last
            .map(|attempt| attempt.gas_limit)
            .or(record.gas_limit)
            .ok_or_else(|| WorkerError::InternalError {
                message: format!("submitted record {} has no gas limit", record.id),
            })?;

        let estimate = chain.estimate_fees().await.map_err(WorkerError::rpc)?;
        let mut next = previous
            .bumped(self.options.fee_bump_percent)
            .max_with(&estimate);
        if let Some(cap) = self.options.max_fee_per_gas_cap {
            next = next.capped(cap);
        }

        if !next.is_replacement_for(&previous, self.options.min_replacement_bump_percent) {
            tracing::info!(
                max_fee = %previous.max_fee(),
                cap = ?self.options.max_fee_per_gas_cap,
                "Fee cap reached, rebroadcasting previous payload"
            );
            if let Some(last) = last {
                if let Err(e) = chain.broadcast(last.raw.clone()).await {
                    tracing::debug!(error = %e, "Rebroadcast of previous payload failed");
                }
            }
            return Ok(match self.apply(record, Transition::Reprice { attempt: None }).await? {
                Some(_) => StallOutcome::Rebroadcast,
                None => StallOutcome::Skipped,
            });
        }

        let unsigned = UnsignedTransaction {
            chain_id: record.chain_id,
            from: record.from,
            to: record.to,
            value: record.value,
            data: record.data.clone(),
            nonce,
            gas_limit,
            fees: next,
        };
        let raw = self
            .signer
            .sign(record.chain_id, record.from, &unsigned)
            .await
            .map_err(|e| WorkerError::SigningError {
                message: e.to_string(),
                inner_error: e,
            })?;

        let hash = keccak256(&raw);
        let attempt = SubmissionAttempt {
            hash,
            raw: raw.clone(),
            fees: next,
            gas_limit,
            sent_at: now_ms(),
        };

        // persisted first so the indexer can match it the moment it lands
        let Some(updated) = self
            .apply(record, Transition::Reprice { attempt: Some(attempt) })
            .await?
        else {
            return Ok(StallOutcome::Skipped);
        };

        record_fee_escalation(record.chain_id);
        emit(self.events.as_ref(), EventKind::TransactionRepriced, &updated).await;

        match chain.broadcast(raw).await {
            Ok(_) => tracing::info!(
                tx_hash = %hash,
                max_fee = %next.max_fee(),
                fee_bumps = updated.fee_bumps,
                "Broadcast re-priced transaction"
            ),
            Err(e) => {
                let classification = classify_send_error(&e, SendContext::Rebroadcast);
                record_submission_failure(record.chain_id, classification.as_str());
                match classification {
                    SendErrorClassification::PossiblySent => {
                        tracing::info!(tx_hash = %hash, error = %e, "Node already has the replacement nonce")
                    }
                    _ => tracing::warn!(
                        tx_hash = %hash,
                        error = %e,
                        classification = classification.as_str(),
                        "Re-priced broadcast failed, will escalate again after the stall threshold"
                    ),
                }
            }
        }

        Ok(StallOutcome::Repriced)
    }

    async fn fail(
        &self,
        record: &TransactionRecord,
        reason: String,
    ) -> Result<StallOutcome, WorkerError> {
        let transition = Transition::Fail {
            reason,
            worker_id: None,
        };
        let Some(updated) = self.apply(record, transition).await? else {
            return Ok(StallOutcome::Skipped);
        };

        tracing::warn!(
            transaction_id = updated.id,
            reason = updated.error_message,
            "Stalled transaction errored"
        );
        emit(self.events.as_ref(), EventKind::TransactionErrored, &updated).await;
        Ok(StallOutcome::Failed)
    }

    /// Apply `transition`, treating a lost race with the indexer as a no-op.
    async fn apply(
        &self,
        record: &TransactionRecord,
        transition: Transition,
    ) -> Result<Option<TransactionRecord>, WorkerError> {
        match self.store.update_status(&record.id, transition).await {
            Ok(updated) => Ok(Some(updated)),
            Err(StoreError::InvalidTransition { status, reason, .. }) => {
                tracing::debug!(status = %status, reason = reason, "Record moved on, skipping");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
