use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use alloy::primitives::{B256, Bytes, keccak256};
use engine_core::{
    chain::{Chain, ChainService, NonceTag},
    error::EngineError,
    signer::TransactionSigner,
    transaction::{FeeParams, UnsignedTransaction},
};
use tokio::sync::{Notify, oneshot};

use crate::{
    events::{EventKind, EventSink, emit},
    metrics::{
        calculate_duration_seconds, record_submission_failure,
        record_transaction_queued_to_submitted,
    },
    nonce_manager::{NonceManager, WalletKey},
    options::EngineOptions,
    store::{
        StoreError, SubmissionAttempt, TransactionRecord, TransactionStatus, TransactionStore,
        Transition, now_ms,
    },
    worker::{
        error::{
            SendContext, SendErrorClassification, WorkerError, classify_send_error,
            is_execution_failure,
        },
        idle,
    },
};

/// What one pass over the queue did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendCycleReport {
    pub submitted: u32,
    pub requeued: u32,
    pub failed: u32,
    pub gap_fills: u32,
}

impl SendCycleReport {
    fn merge(&mut self, other: SendCycleReport) {
        self.submitted += other.submitted;
        self.requeued += other.requeued;
        self.failed += other.failed;
        self.gap_fills += other.gap_fills;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Submitted,
    Requeued { holds_nonce: bool },
    Failed,
    Skipped,
}

/// Fee parameters for a first attempt: the network estimate plus the
/// configured margin, clamped to the fee cap.
pub(crate) async fn initial_fees<C: Chain>(
    chain: &C,
    options: &EngineOptions,
) -> Result<FeeParams, EngineError> {
    let fees = chain
        .estimate_fees()
        .await?
        .bumped(options.fee_margin_percent);
    Ok(match options.max_fee_per_gas_cap {
        Some(cap) => fees.capped(cap),
        None => fees,
    })
}

/// Claims queued records, assigns nonces, signs and broadcasts.
///
/// Records are grouped into one lane per (chain, sender). Lanes run in
/// parallel; records inside a lane are handled oldest first so nonces follow
/// enqueue order.
pub struct SubmissionWorker<S, CS, Sg, E> {
    pub worker_id: String,
    pub store: Arc<S>,
    pub chains: Arc<CS>,
    pub signer: Arc<Sg>,
    pub events: Arc<E>,
    pub nonces: Arc<NonceManager>,
    pub options: Arc<EngineOptions>,
    pub wake: Arc<Notify>,
}

impl<S, CS, Sg, E> SubmissionWorker<S, CS, Sg, E>
where
    S: TransactionStore,
    CS: ChainService,
    Sg: TransactionSigner,
    E: EventSink,
{
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<(), EngineError> {
        tracing::info!(worker_id = self.worker_id, "Submission worker started");

        loop {
            match self.run_cycle().await {
                Ok(report) if report != SendCycleReport::default() => {
                    tracing::debug!(?report, "Submission cycle finished");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Submission cycle failed"),
            }

            if idle(&mut shutdown, self.options.send_poll_interval(), Some(&self.wake)).await {
                break;
            }
        }

        tracing::info!(worker_id = self.worker_id, "Submission worker stopped");
        Ok(())
    }

    // ========== SEND FLOW ==========
    #[tracing::instrument(skip_all, fields(worker_id = self.worker_id))]
    pub async fn run_cycle(&self) -> Result<SendCycleReport, WorkerError> {
        let queued = self
            .store
            .list_by_status(TransactionStatus::Queued, None)
            .await?;

        let mut lanes: BTreeMap<WalletKey, Vec<TransactionRecord>> = BTreeMap::new();
        for record in queued {
            lanes
                .entry(WalletKey::new(record.chain_id, record.from))
                .or_default()
                .push(record);
        }
        // wallets with nothing queued still get reconciled and gap-filled
        for key in self.nonces.known_wallets() {
            lanes.entry(key).or_default();
        }

        let mut report = SendCycleReport::default();
        let mut lanes = lanes.into_iter().peekable();
        let concurrency = self.options.send_concurrency.max(1);

        while lanes.peek().is_some() {
            let lane_futures: Vec<_> = lanes
                .by_ref()
                .take(concurrency)
                .map(|(key, records)| async move { (key, self.process_lane(key, records).await) })
                .collect();

            for (key, result) in futures::future::join_all(lane_futures).await {
                match result {
                    Ok(lane_report) => report.merge(lane_report),
                    Err(e) => tracing::warn!(wallet = %key, error = ?e, "Lane failed, will retry next cycle"),
                }
            }
        }

        Ok(report)
    }

    #[tracing::instrument(skip_all, fields(chain_id = key.chain_id, from = %key.address))]
    async fn process_lane(
        &self,
        key: WalletKey,
        records: Vec<TransactionRecord>,
    ) -> Result<SendCycleReport, WorkerError> {
        let chain = self
            .chains
            .get_chain(key.chain_id)
            .map_err(|e| WorkerError::ChainServiceError {
                chain_id: key.chain_id,
                message: e.to_string(),
            })?;

        let now = now_ms();
        self.ensure_synced(&chain, key, now).await?;

        let mut report = SendCycleReport::default();
        let mut blocked = false;

        for record in records {
            let holds_nonce = record.nonce.is_some();
            let busy = record.next_attempt_at > now
                || (record.has_live_claim(now) && !record.is_claimed_by(&self.worker_id));
            if busy {
                // a later record must not jump ahead of one still waiting for its nonce
                if !holds_nonce {
                    blocked = true;
                    break;
                }
                continue;
            }

            match self.process_record(&chain, key, record).await {
                Ok(RecordOutcome::Submitted) => report.submitted += 1,
                Ok(RecordOutcome::Failed) => report.failed += 1,
                Ok(RecordOutcome::Skipped) => {
                    if !holds_nonce {
                        blocked = true;
                        break;
                    }
                }
                Ok(RecordOutcome::Requeued { holds_nonce }) => {
                    report.requeued += 1;
                    if !holds_nonce {
                        blocked = true;
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to process record, stopping lane");
                    blocked = true;
                    break;
                }
            }
        }

        if !blocked {
            report.gap_fills += self.fill_gaps(&chain, key).await;
        }

        Ok(report)
    }

    /// Sync the wallet's nonce state on first use and whenever it is older
    /// than the reconcile interval.
    async fn ensure_synced(
        &self,
        chain: &CS::Chain,
        key: WalletKey,
        now: u64,
    ) -> Result<(), WorkerError> {
        let synced_at = self.nonces.synced_at(key).await;
        if synced_at
            .is_some_and(|at| now.saturating_sub(at) < self.options.nonce_reconcile_interval_ms)
        {
            return Ok(());
        }

        let (pending, latest) = tokio::try_join!(
            chain.get_account_nonce(key.address, NonceTag::Pending),
            chain.get_account_nonce(key.address, NonceTag::Latest),
        )
        .map_err(WorkerError::rpc)?;

        let held = match synced_at {
            None => self.held_nonces(key).await?,
            Some(_) => BTreeSet::new(),
        };

        let state = self.nonces.sync(key, pending, latest, &held, now).await;
        tracing::debug!(
            chain_pending = pending,
            chain_latest = latest,
            last_assigned = state.last_assigned,
            recycled = state.recycled.len(),
            "Synced nonce state"
        );
        Ok(())
    }

    /// Nonces pinned by records that are still queued or submitted.
    async fn held_nonces(&self, key: WalletKey) -> Result<BTreeSet<u64>, WorkerError> {
        let mut held = BTreeSet::new();
        for status in [TransactionStatus::Queued, TransactionStatus::Submitted] {
            held.extend(
                self.store
                    .list_by_status(status, Some(key.chain_id))
                    .await?
                    .iter()
                    .filter(|record| record.from == key.address)
                    .filter_map(|record| record.nonce),
            );
        }
        Ok(held)
    }

    #[tracing::instrument(skip_all, fields(transaction_id = record.id))]
    async fn process_record(
        &self,
        chain: &CS::Chain,
        key: WalletKey,
        record: TransactionRecord,
    ) -> Result<RecordOutcome, WorkerError> {
        let claim = Transition::Claim {
            worker_id: self.worker_id.clone(),
            lease_ms: self.options.claim_lease_ms,
        };
        let record = match self.store.update_status(&record.id, claim).await {
            Ok(record) => record,
            Err(StoreError::InvalidTransition { reason, .. }) => {
                tracing::debug!(reason = reason, "Record is no longer claimable");
                return Ok(RecordOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        // an earlier broadcast was ambiguous: resend the exact same payload
        let resend = match (record.nonce, record.attempts.last()) {
            (Some(nonce), Some(last)) => Some((nonce, last.raw.clone(), last.hash)),
            _ => None,
        };
        if let Some((nonce, raw, hash)) = resend {
            tracing::info!(nonce = nonce, tx_hash = %hash, "Rebroadcasting previous attempt");
            return self
                .broadcast_and_settle(chain, key, nonce, record, raw, hash)
                .await;
        }

        let gas_limit = match self.resolve_gas_limit(chain, &record).await {
            Ok(gas_limit) => gas_limit,
            Err(e) if is_execution_failure(&e) => {
                if let Some(nonce) = record.nonce {
                    self.nonces.release(key, nonce).await;
                }
                return self
                    .fail(&record, format!("Gas estimation failed: {e}"))
                    .await;
            }
            Err(e) => {
                return self
                    .requeue(&record, format!("Gas estimation unavailable: {e}"), false)
                    .await;
            }
        };

        let fees = match record.overrides.fee_params() {
            Some(fees) => fees,
            None => match initial_fees(chain, &self.options).await {
                Ok(fees) => fees,
                Err(e) => {
                    return self
                        .requeue(&record, format!("Fee estimation unavailable: {e}"), false)
                        .await;
                }
            },
        };

        let (record, nonce) = match record.nonce {
            Some(nonce) => (record, nonce),
            None => {
                let reservation = match self.nonces.next_nonce(key).await {
                    Ok(reservation) => reservation,
                    Err(e) => return self.requeue(&record, e.to_string(), false).await,
                };
                let nonce = reservation.nonce();
                let assign = Transition::AssignNonce {
                    worker_id: self.worker_id.clone(),
                    nonce,
                };

                // the wallet lock is held until the assignment is persisted
                match self.store.update_status(&record.id, assign).await {
                    Ok(updated) => {
                        reservation.commit();
                        (updated, nonce)
                    }
                    Err(StoreError::NonceConflict { holder, .. }) => {
                        // live elsewhere, must not be handed out again
                        reservation.commit();
                        tracing::error!(
                            nonce = nonce,
                            holder = holder,
                            "Nonce manager handed out a nonce that another record holds"
                        );
                        return self
                            .requeue(&record, format!("nonce {nonce} held by {holder}"), false)
                            .await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let unsigned = UnsignedTransaction {
            chain_id: record.chain_id,
            from: record.from,
            to: record.to,
            value: record.value,
            data: record.data.clone(),
            nonce,
            gas_limit,
            fees,
        };

        let raw = match self.signer.sign(record.chain_id, record.from, &unsigned).await {
            Ok(raw) => raw,
            Err(e @ EngineError::SignerUnavailable { .. }) => {
                // the nonce stays with the record for the next try
                return self.requeue(&record, e.to_string(), false).await;
            }
            Err(e) => {
                self.nonces.release(key, nonce).await;
                return self.fail(&record, format!("Signing failed: {e}")).await;
            }
        };

        let hash = keccak256(&raw);
        let attempt = SubmissionAttempt {
            hash,
            raw: raw.clone(),
            fees,
            gas_limit,
            sent_at: now_ms(),
        };
        let record = self
            .store
            .update_status(
                &record.id,
                Transition::RecordAttempt {
                    worker_id: self.worker_id.clone(),
                    attempt,
                },
            )
            .await?;

        self.broadcast_and_settle(chain, key, nonce, record, raw, hash)
            .await
    }

    async fn broadcast_and_settle(
        &self,
        chain: &CS::Chain,
        key: WalletKey,
        nonce: u64,
        record: TransactionRecord,
        raw: Bytes,
        hash: B256,
    ) -> Result<RecordOutcome, WorkerError> {
        let error = match chain.broadcast(raw).await {
            Ok(node_hash) => {
                if node_hash != hash {
                    tracing::warn!(
                        tx_hash = %hash,
                        node_hash = %node_hash,
                        "Node reported a different transaction hash"
                    );
                }
                return self.submit(&record, hash).await;
            }
            Err(e) => e,
        };

        let classification = classify_send_error(&error, SendContext::InitialBroadcast);
        record_submission_failure(record.chain_id, classification.as_str());

        match classification {
            SendErrorClassification::PossiblySent => {
                tracing::info!(
                    nonce = nonce,
                    tx_hash = %hash,
                    error = %error,
                    "Node already has this nonce, treating as submitted"
                );
                self.submit(&record, hash).await
            }
            SendErrorClassification::DeterministicFailure => {
                // with more than one attempt an earlier payload may still be in flight
                if record.attempts.len() <= 1 {
                    self.nonces.release(key, nonce).await;
                }
                self.fail(&record, format!("Transaction rejected by node: {error}"))
                    .await
            }
            SendErrorClassification::Ambiguous => {
                if record.retry_count + 1 > self.options.max_send_retries {
                    self.release_if_unseen(chain, key, nonce).await;
                    self.fail(
                        &record,
                        format!(
                            "Broadcast failed after {} retries: {error}",
                            record.retry_count
                        ),
                    )
                    .await
                } else {
                    self.requeue(&record, error.to_string(), true).await
                }
            }
        }
    }

    /// Give `nonce` back when the node's pending nonce shows nothing occupies
    /// it. A nonce below the high-water mark is recycled and later gap-filled.
    async fn release_if_unseen(&self, chain: &CS::Chain, key: WalletKey, nonce: u64) {
        match chain.get_account_nonce(key.address, NonceTag::Pending).await {
            Ok(pending) if pending <= nonce => {
                tracing::info!(
                    nonce = nonce,
                    chain_pending = pending,
                    "Node never took this nonce, releasing it"
                );
                self.nonces.release(key, nonce).await;
            }
            Ok(pending) => {
                tracing::warn!(
                    nonce = nonce,
                    chain_pending = pending,
                    "Nonce may be in use on the node, leaving it to reconciliation"
                );
            }
            Err(e) => {
                tracing::warn!(nonce = nonce, error = ?e, "Could not read pending nonce, keeping nonce");
            }
        }
    }

    async fn resolve_gas_limit(
        &self,
        chain: &CS::Chain,
        record: &TransactionRecord,
    ) -> Result<u64, EngineError> {
        if let Some(gas_limit) = record.overrides.gas_limit {
            return Ok(gas_limit);
        }
        let estimate = chain.estimate_gas(&record.prepared_call()).await?;
        Ok(self.options.gas_limit_with_margin(estimate))
    }

    async fn submit(
        &self,
        record: &TransactionRecord,
        hash: B256,
    ) -> Result<RecordOutcome, WorkerError> {
        let record = self
            .store
            .update_status(
                &record.id,
                Transition::Submit {
                    worker_id: self.worker_id.clone(),
                    tx_hash: hash,
                },
            )
            .await?;

        tracing::info!(
            transaction_id = record.id,
            nonce = record.nonce,
            tx_hash = %hash,
            "Transaction submitted"
        );

        record_transaction_queued_to_submitted(
            record.chain_id,
            calculate_duration_seconds(record.created_at, now_ms()),
        );
        emit(self.events.as_ref(), EventKind::TransactionSubmitted, &record).await;
        Ok(RecordOutcome::Submitted)
    }

    async fn requeue(
        &self,
        record: &TransactionRecord,
        error: String,
        count_retry: bool,
    ) -> Result<RecordOutcome, WorkerError> {
        let retry_after_ms = self.options.send_backoff_ms(record.retry_count);
        tracing::warn!(
            transaction_id = record.id,
            error = error,
            retry_after_ms = retry_after_ms,
            "Requeueing transaction"
        );

        let record = self
            .store
            .update_status(
                &record.id,
                Transition::Requeue {
                    worker_id: self.worker_id.clone(),
                    error,
                    retry_after_ms,
                    count_retry,
                },
            )
            .await?;

        Ok(RecordOutcome::Requeued {
            holds_nonce: record.nonce.is_some(),
        })
    }

    async fn fail(
        &self,
        record: &TransactionRecord,
        reason: String,
    ) -> Result<RecordOutcome, WorkerError> {
        tracing::warn!(transaction_id = record.id, reason = reason, "Transaction failed");

        let record = self
            .store
            .update_status(
                &record.id,
                Transition::Fail {
                    reason,
                    worker_id: Some(self.worker_id.clone()),
                },
            )
            .await?;

        emit(self.events.as_ref(), EventKind::TransactionErrored, &record).await;
        Ok(RecordOutcome::Failed)
    }

    // ========== GAP FILLING ==========

    /// Consume recycled nonces nobody queued is going to use, so later nonces
    /// are not stuck behind them.
    async fn fill_gaps(&self, chain: &CS::Chain, key: WalletKey) -> u32 {
        let mut filled = 0;
        while let Some(reservation) = self.nonces.take_gap(key).await {
            let nonce = reservation.commit();
            if !self.send_noop(chain, key, nonce).await {
                self.nonces.release(key, nonce).await;
                break;
            }
            filled += 1;
        }
        filled
    }

    async fn send_noop(&self, chain: &CS::Chain, key: WalletKey, nonce: u64) -> bool {
        let fees = match initial_fees(chain, &self.options).await {
            Ok(fees) => fees,
            Err(e) => {
                tracing::warn!(nonce = nonce, error = ?e, "Could not price no-op transaction");
                return false;
            }
        };

        let noop = UnsignedTransaction::noop(key.chain_id, key.address, nonce, fees);
        let raw = match self.signer.sign(key.chain_id, key.address, &noop).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(nonce = nonce, error = ?e, "Could not sign no-op transaction");
                return false;
            }
        };

        match chain.broadcast(raw).await {
            Ok(hash) => {
                tracing::info!(nonce = nonce, tx_hash = %hash, "Filled nonce gap with no-op");
                true
            }
            Err(e) => match classify_send_error(&e, SendContext::InitialBroadcast) {
                SendErrorClassification::PossiblySent => true,
                _ => {
                    tracing::warn!(nonce = nonce, error = ?e, "No-op broadcast failed");
                    false
                }
            },
        }
    }
}
