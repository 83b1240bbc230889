use std::{collections::BTreeSet, future::Future, sync::Arc};

use alloy::primitives::{Address, B256};
use engine_core::{error::EngineError, transaction::LogInfo};
use serde::{Deserialize, Serialize};

use crate::store::{StoreError, TransactionStatus, TransactionStore};

/// Contract logs a caller wants to hear about.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContractEventSubscription {
    pub id: String,
    pub chain_id: u64,
    pub address: Address,
    /// Event signature filter. `None` matches every log from `address`.
    #[serde(default)]
    pub topic0: Option<B256>,
}

impl ContractEventSubscription {
    pub fn matches(&self, log: &LogInfo) -> bool {
        log.address == self.address
            && self
                .topic0
                .is_none_or(|topic0| log.topics.first() == Some(&topic0))
    }
}

/// Tells the indexer registry which chains need a running indexer.
pub trait SubscriptionSource: Send + Sync + 'static {
    fn list_active_chain_ids(
        &self,
    ) -> impl Future<Output = Result<BTreeSet<u64>, EngineError>> + Send;

    fn event_subscriptions(
        &self,
        chain_id: u64,
    ) -> impl Future<Output = Result<Vec<ContractEventSubscription>, EngineError>> + Send;
}

/// Chains with work still in flight: queued or submitted records, plus mined
/// records that have not reached confirmation depth.
pub async fn live_chain_ids<S: TransactionStore>(store: &S) -> Result<BTreeSet<u64>, StoreError> {
    let mut chains = BTreeSet::new();

    for status in [TransactionStatus::Queued, TransactionStatus::Submitted] {
        chains.extend(
            store
                .list_by_status(status, None)
                .await?
                .iter()
                .map(|record| record.chain_id),
        );
    }

    chains.extend(
        store
            .list_by_status(TransactionStatus::Mined, None)
            .await?
            .iter()
            .filter(|record| !record.finalized)
            .map(|record| record.chain_id),
    );

    Ok(chains)
}

/// Demand derived from the store, unioned with statically configured
/// contract-event subscriptions.
pub struct StoreSubscriptionSource<S> {
    store: Arc<S>,
    subscriptions: Vec<ContractEventSubscription>,
}

impl<S> StoreSubscriptionSource<S> {
    pub fn new(store: Arc<S>, subscriptions: Vec<ContractEventSubscription>) -> Self {
        Self {
            store,
            subscriptions,
        }
    }
}

impl<S: TransactionStore> SubscriptionSource for StoreSubscriptionSource<S> {
    async fn list_active_chain_ids(&self) -> Result<BTreeSet<u64>, EngineError> {
        let mut chains = live_chain_ids(self.store.as_ref()).await?;
        chains.extend(self.subscriptions.iter().map(|s| s.chain_id));
        Ok(chains)
    }

    async fn event_subscriptions(
        &self,
        chain_id: u64,
    ) -> Result<Vec<ContractEventSubscription>, EngineError> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| s.chain_id == chain_id)
            .cloned()
            .collect())
    }
}
