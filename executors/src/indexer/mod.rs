use std::{collections::VecDeque, sync::Arc};

use alloy::primitives::B256;
use engine_core::{
    chain::Chain,
    error::EngineError,
    transaction::{BlockInfo, ReceiptInfo},
};
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use crate::{
    events::{EventEnvelope, EventKind, EventSink, emit},
    metrics::{calculate_duration_seconds, record_reorg_revert, record_transaction_queued_to_mined},
    options::EngineOptions,
    store::{
        ReceiptSummary, StoreError, TransactionRecord, TransactionStatus, TransactionStore,
        Transition, now_ms,
    },
    worker::{WorkerError, find_receipt, idle},
};

pub mod registry;
pub mod subscriptions;

pub use registry::{IndexerHandle, IndexerRegistry, ReconcileReport};
pub use subscriptions::{
    ContractEventSubscription, StoreSubscriptionSource, SubscriptionSource, live_chain_ids,
};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    /// Processing blocks from the cursor towards the head.
    CatchingUp,
    /// At the head, one poll per new block.
    Following,
    Stopped,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexerProgress {
    pub state: IndexerState,
    /// Next block to process. Zero until the cursor is initialised.
    pub next_block: u64,
    pub head: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub blocks: u64,
    pub mined: u32,
    pub reverted: u32,
    pub finalized: u32,
    pub reorged: u32,
    pub contract_events: u32,
    /// A fork was found and the cursor moved back.
    pub rewound: bool,
    pub catching_up: bool,
}

/// Follows one chain: settles submitted records from block receipts, emits
/// matching contract events, finalizes mined records past confirmation depth
/// and moves orphaned ones back to submitted.
pub struct ChainIndexer<C, S, E, Q> {
    chain: C,
    store: Arc<S>,
    events: Arc<E>,
    subscriptions: Arc<Q>,
    options: Arc<EngineOptions>,
    next_block: Option<u64>,
    /// (number, hash) of recently processed blocks, oldest first.
    recent: VecDeque<(u64, B256)>,
    progress: watch::Sender<IndexerProgress>,
}

impl<C, S, E, Q> ChainIndexer<C, S, E, Q>
where
    C: Chain,
    S: TransactionStore,
    E: EventSink,
    Q: SubscriptionSource,
{
    pub fn new(
        chain: C,
        store: Arc<S>,
        events: Arc<E>,
        subscriptions: Arc<Q>,
        options: Arc<EngineOptions>,
    ) -> (Self, watch::Receiver<IndexerProgress>) {
        let (progress, receiver) = watch::channel(IndexerProgress {
            state: IndexerState::CatchingUp,
            next_block: 0,
            head: None,
        });

        let indexer = Self {
            chain,
            store,
            events,
            subscriptions,
            options,
            next_block: None,
            recent: VecDeque::new(),
            progress,
        };
        (indexer, receiver)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }

    pub fn next_block(&self) -> Option<u64> {
        self.next_block
    }

    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), EngineError> {
        tracing::info!(chain_id = self.chain_id(), "Chain indexer started");

        loop {
            let catching_up = match self.tick().await {
                Ok(report) => {
                    if report.blocks > 0 || report.reorged > 0 || report.rewound {
                        tracing::debug!(chain_id = self.chain_id(), ?report, "Indexer tick finished");
                    }
                    report.catching_up
                }
                Err(e) => {
                    tracing::warn!(chain_id = self.chain_id(), error = ?e, "Indexer tick failed");
                    false
                }
            };

            if catching_up {
                // no sleep between batches, but still stop between them
                match shutdown.try_recv() {
                    Err(oneshot::error::TryRecvError::Empty) => continue,
                    _ => break,
                }
            }

            if idle(&mut shutdown, self.options.indexer_poll_interval(), None).await {
                break;
            }
        }

        self.stop().await
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        let chain_id = self.chain_id();
        if let Some(next_block) = self.next_block {
            self.store.save_cursor(chain_id, next_block).await?;
        }
        let head = self.progress.borrow().head;
        self.publish(IndexerState::Stopped, head);
        tracing::info!(chain_id = chain_id, next_block = self.next_block, "Chain indexer stopped");
        Ok(())
    }

    fn publish(&self, state: IndexerState, head: Option<u64>) {
        self.progress.send_replace(IndexerProgress {
            state,
            next_block: self.next_block.unwrap_or_default(),
            head,
        });
    }

    /// One batch of blocks followed by the finality and reorg check of mined
    /// records.
    #[tracing::instrument(skip_all, fields(chain_id = self.chain.chain_id()))]
    pub async fn tick(&mut self) -> Result<TickReport, WorkerError> {
        let chain_id = self.chain_id();
        let head = self.chain.block_number().await.map_err(WorkerError::rpc)?;

        let next = match self.next_block {
            Some(next) => next,
            None => {
                // resume from the persisted cursor, otherwise start at the head
                let next = self.store.load_cursor(chain_id).await?.unwrap_or(head);
                tracing::info!(next_block = next, head = head, "Initialised indexer cursor");
                self.next_block = Some(next);
                next
            }
        };

        let mut report = TickReport::default();
        if self.last_block_orphaned(head).await? {
            self.rewind(&mut report).await?;
        }
        let next = self.next_block.unwrap_or(next);

        if next <= head {
            let last = head.min(next.saturating_add(self.options.indexer_batch_size.max(1) - 1));
            let subscriptions = self
                .subscriptions
                .event_subscriptions(chain_id)
                .await
                .map_err(|e| WorkerError::InternalError {
                    message: format!("Failed to load event subscriptions: {e}"),
                })?;
            for number in next..=last {
                let Some(block) = self.chain.get_block(number).await.map_err(WorkerError::rpc)?
                else {
                    tracing::debug!(block = number, "Block not available yet");
                    break;
                };

                let builds_on_last = match self.recent.back() {
                    Some(&(last_number, last_hash)) if last_number + 1 == block.number => {
                        block.parent_hash == last_hash
                    }
                    _ => true,
                };
                if !builds_on_last {
                    self.rewind(&mut report).await?;
                    break;
                }

                // a record can be submitted while the batch is running
                let tracking = !self
                    .store
                    .list_by_status(TransactionStatus::Submitted, Some(chain_id))
                    .await?
                    .is_empty();
                self.process_block(&block, &subscriptions, tracking, &mut report)
                    .await?;
                self.remember(block.number, block.hash);
                self.next_block = Some(number + 1);
                report.blocks += 1;
            }

            if let Some(next_block) = self.next_block {
                self.store.save_cursor(chain_id, next_block).await?;
            }
        }

        self.check_mined(head, &mut report).await?;

        report.catching_up = self.next_block.is_some_and(|next| next <= head);
        let state = if report.catching_up {
            IndexerState::CatchingUp
        } else {
            IndexerState::Following
        };
        self.publish(state, Some(head));

        Ok(report)
    }

    /// Whether the last processed block is still canonical. `head` bounds the
    /// lookup when the chain got shorter.
    async fn last_block_orphaned(&self, head: u64) -> Result<bool, WorkerError> {
        let Some(&(number, hash)) = self.recent.back() else {
            return Ok(false);
        };
        if number > head {
            return Ok(true);
        }
        let canonical = self.chain.get_block(number).await.map_err(WorkerError::rpc)?;
        Ok(!canonical.is_some_and(|block| block.hash == hash))
    }

    /// Walk the remembered window back to the newest block that is still
    /// canonical and return the block after it.
    async fn fork_point(&mut self) -> Result<u64, WorkerError> {
        let oldest = self.recent.front().map(|(number, _)| *number).unwrap_or_default();
        while let Some(&(number, hash)) = self.recent.back() {
            let canonical = self.chain.get_block(number).await.map_err(WorkerError::rpc)?;
            if canonical.is_some_and(|block| block.hash == hash) {
                return Ok(number + 1);
            }
            self.recent.pop_back();
        }

        // fork is deeper than the window, replay all of it
        Ok(oldest)
    }

    async fn rewind(&mut self, report: &mut TickReport) -> Result<(), WorkerError> {
        let fork_point = self.fork_point().await?;
        tracing::warn!(
            previous_next_block = self.next_block,
            fork_point = fork_point,
            "Reorg detected, rewinding cursor"
        );
        self.next_block = Some(fork_point);
        report.rewound = true;
        Ok(())
    }

    fn remember(&mut self, number: u64, hash: B256) {
        self.recent.push_back((number, hash));
        while self.recent.len() as u64 > self.options.reorg_window.max(1) {
            self.recent.pop_front();
        }
    }

    #[tracing::instrument(skip_all, fields(block = block.number))]
    async fn process_block(
        &self,
        block: &BlockInfo,
        subscriptions: &[ContractEventSubscription],
        tracking: bool,
        report: &mut TickReport,
    ) -> Result<(), WorkerError> {
        if !tracking && subscriptions.is_empty() {
            return Ok(());
        }

        let receipts = self
            .chain
            .get_block_receipts(block.number)
            .await
            .map_err(WorkerError::rpc)?;

        for receipt in &receipts {
            if tracking {
                if let Some(id) = self
                    .store
                    .find_by_hash(self.chain_id(), receipt.transaction_hash)
                    .await?
                {
                    self.match_receipt(&id, receipt, report).await?;
                }
            }

            for log in &receipt.logs {
                for subscription in subscriptions.iter().filter(|s| s.matches(log)) {
                    let envelope = EventEnvelope::for_log(
                        subscription,
                        log,
                        receipt.transaction_hash,
                        block.number,
                        block.hash,
                    );
                    self.events.notify(EventKind::ContractEvent, envelope).await;
                    report.contract_events += 1;
                }
            }
        }

        Ok(())
    }

    async fn match_receipt(
        &self,
        id: &str,
        receipt: &ReceiptInfo,
        report: &mut TickReport,
    ) -> Result<(), WorkerError> {
        let record = self.store.get(id).await?;
        let relevant = match record.status {
            TransactionStatus::Submitted => true,
            // re-included in another block after a reorg
            TransactionStatus::Mined => record.block_hash != Some(receipt.block_hash),
            _ => false,
        };
        if !relevant {
            return Ok(());
        }
        self.apply_receipt(&record, receipt, report).await
    }

    async fn apply_receipt(
        &self,
        record: &TransactionRecord,
        receipt: &ReceiptInfo,
        report: &mut TickReport,
    ) -> Result<(), WorkerError> {
        let summary = ReceiptSummary::from(receipt);
        let (transition, kind) = if receipt.status {
            (Transition::Mine { receipt: summary }, EventKind::TransactionMined)
        } else {
            (Transition::Revert { receipt: summary }, EventKind::TransactionErrored)
        };

        let Some(updated) = self.apply(&record.id, transition).await? else {
            return Ok(());
        };

        tracing::info!(
            transaction_id = updated.id,
            tx_hash = %receipt.transaction_hash,
            block = receipt.block_number,
            success = receipt.status,
            "Transaction included"
        );

        if receipt.status {
            report.mined += 1;
            record_transaction_queued_to_mined(
                updated.chain_id,
                calculate_duration_seconds(updated.created_at, now_ms()),
            );
        } else {
            report.reverted += 1;
        }
        emit(self.events.as_ref(), kind, &updated).await;
        Ok(())
    }

    /// Finalize mined records buried deep enough, and move records whose
    /// block left the canonical chain back to submitted.
    async fn check_mined(&self, head: u64, report: &mut TickReport) -> Result<(), WorkerError> {
        let chain_id = self.chain_id();
        let depth = self.options.confirmation_depth;

        let mut candidates: Vec<TransactionRecord> = self
            .store
            .list_by_status(TransactionStatus::Mined, Some(chain_id))
            .await?
            .into_iter()
            .filter(|record| !record.finalized)
            .collect();
        // reverts can be orphaned too until they are buried
        candidates.extend(
            self.store
                .list_by_status(TransactionStatus::Errored, Some(chain_id))
                .await?
                .into_iter()
                .filter(|record| {
                    record.reverted
                        && record
                            .block_number
                            .is_some_and(|number| number.saturating_add(depth) > head)
                }),
        );

        for record in candidates {
            let (Some(number), Some(hash)) = (record.block_number, record.block_hash) else {
                continue;
            };

            let canonical = self.chain.get_block(number).await.map_err(WorkerError::rpc)?;
            if canonical.is_some_and(|block| block.hash == hash) {
                if record.status == TransactionStatus::Mined && head.saturating_sub(number) >= depth
                {
                    if let Some(updated) = self.apply(&record.id, Transition::Finalize).await? {
                        tracing::info!(
                            transaction_id = updated.id,
                            block = number,
                            "Transaction reached confirmation depth"
                        );
                        report.finalized += 1;
                        emit(self.events.as_ref(), EventKind::TransactionConfirmed, &updated)
                            .await;
                    }
                }
                continue;
            }

            self.handle_orphaned(record, report).await?;
        }

        Ok(())
    }

    async fn handle_orphaned(
        &self,
        record: TransactionRecord,
        report: &mut TickReport,
    ) -> Result<(), WorkerError> {
        let receipt = find_receipt(&self.chain, &record)
            .await
            .map_err(WorkerError::rpc)?;

        if receipt
            .as_ref()
            .is_some_and(|r| Some(r.block_hash) == record.block_hash)
        {
            tracing::debug!(
                transaction_id = record.id,
                "Node still reports the orphaned block, retrying next tick"
            );
            return Ok(());
        }

        let still_mined =
            record.status == TransactionStatus::Mined && receipt.as_ref().is_some_and(|r| r.status);

        let record = if still_mined {
            record
        } else {
            let Some(updated) = self.apply(&record.id, Transition::Reorg).await? else {
                return Ok(());
            };
            tracing::warn!(
                transaction_id = updated.id,
                tx_hash = ?updated.tx_hash,
                "Including block was orphaned, transaction back to submitted"
            );
            report.reorged += 1;
            record_reorg_revert(updated.chain_id);
            emit(self.events.as_ref(), EventKind::TransactionReorged, &updated).await;
            updated
        };

        if let Some(receipt) = receipt {
            self.apply_receipt(&record, &receipt, report).await?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        id: &str,
        transition: Transition,
    ) -> Result<Option<TransactionRecord>, WorkerError> {
        match self.store.update_status(id, transition).await {
            Ok(updated) => Ok(Some(updated)),
            Err(StoreError::InvalidTransition { status, reason, .. }) => {
                tracing::debug!(transaction_id = id, status = %status, reason = reason, "Skipping transition");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
