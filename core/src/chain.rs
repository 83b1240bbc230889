use std::{collections::HashMap, future::Future, time::Duration};

use alloy::{
    eips::{BlockId, BlockNumberOrTag},
    network::ReceiptResponse,
    primitives::{Address, B256, Bytes},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{TransactionInput, TransactionReceipt, TransactionRequest},
    transports::http::reqwest::Url,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AlloyRpcErrorToEngineError, EngineError, RpcErrorKind},
    transaction::{BlockInfo, FeeParams, LogInfo, PreparedCall, ReceiptInfo},
};

/// Which block the account nonce is read against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonceTag {
    /// Transactions included in the canonical chain.
    Latest,
    /// Latest plus what the node holds in its mempool.
    Pending,
}

/// Read and broadcast access to one EVM chain.
///
/// Every call must fail within a bounded time; implementations own the timeout.
pub trait Chain: Send + Sync + Clone + 'static {
    fn chain_id(&self) -> u64;
    fn rpc_url(&self) -> Url;

    fn block_number(&self) -> impl Future<Output = Result<u64, EngineError>> + Send;

    fn get_block(
        &self,
        number: u64,
    ) -> impl Future<Output = Result<Option<BlockInfo>, EngineError>> + Send;

    fn get_block_receipts(
        &self,
        number: u64,
    ) -> impl Future<Output = Result<Vec<ReceiptInfo>, EngineError>> + Send;

    fn get_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<ReceiptInfo>, EngineError>> + Send;

    fn get_account_nonce(
        &self,
        address: Address,
        tag: NonceTag,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;

    fn estimate_fees(&self) -> impl Future<Output = Result<FeeParams, EngineError>> + Send;

    fn estimate_gas(
        &self,
        call: &PreparedCall,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;

    /// Broadcast signed raw bytes. Returns the hash the node reports.
    fn broadcast(&self, raw: Bytes) -> impl Future<Output = Result<B256, EngineError>> + Send;
}

pub trait ChainService: Send + Sync + 'static {
    type Chain: Chain;

    fn get_chain(&self, chain_id: u64) -> Result<Self::Chain, EngineError>;

    /// Chains this service can hand out.
    fn chain_ids(&self) -> Vec<u64>;
}

#[derive(Clone)]
pub struct RpcChain {
    chain_id: u64,
    rpc_url: Url,
    timeout: Duration,
    pub provider: RootProvider,
}

impl RpcChain {
    pub fn new(chain_id: u64, rpc_url: Url, timeout: Duration) -> Self {
        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_http(rpc_url.clone());

        Self {
            chain_id,
            rpc_url,
            timeout,
            provider,
        }
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, alloy::transports::TransportError>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| e.to_engine_error(self)),
            Err(_) => Err(EngineError::RpcError {
                chain_id: self.chain_id,
                rpc_url: self.rpc_url.to_string(),
                message: format!("RPC call timed out after {:?}", self.timeout),
                kind: RpcErrorKind::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                },
            }),
        }
    }
}

fn receipt_info(receipt: &TransactionReceipt) -> ReceiptInfo {
    ReceiptInfo {
        transaction_hash: receipt.transaction_hash,
        block_number: receipt.block_number.unwrap_or_default(),
        block_hash: receipt.block_hash.unwrap_or_default(),
        status: receipt.status(),
        gas_used: receipt.gas_used,
        effective_gas_price: receipt.effective_gas_price,
        logs: receipt
            .inner
            .logs()
            .iter()
            .map(|log| LogInfo {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                log_index: log.log_index,
            })
            .collect(),
    }
}

impl Chain for RpcChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn rpc_url(&self) -> Url {
        self.rpc_url.clone()
    }

    async fn block_number(&self) -> Result<u64, EngineError> {
        self.with_timeout(async { self.provider.get_block_number().await })
            .await
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockInfo>, EngineError> {
        let block = self
            .with_timeout(async {
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(number))
                    .await
            })
            .await?;

        Ok(block.map(|block| BlockInfo {
            number: block.header.inner.number,
            hash: block.header.hash,
            parent_hash: block.header.inner.parent_hash,
            timestamp: block.header.inner.timestamp,
            transactions: block.transactions.hashes().collect(),
        }))
    }

    async fn get_block_receipts(&self, number: u64) -> Result<Vec<ReceiptInfo>, EngineError> {
        let receipts = self
            .with_timeout(async {
                self.provider
                    .get_block_receipts(BlockId::number(number))
                    .await
            })
            .await?;

        Ok(receipts
            .unwrap_or_default()
            .iter()
            .map(receipt_info)
            .collect())
    }

    async fn get_receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, EngineError> {
        let receipt = self
            .with_timeout(async { self.provider.get_transaction_receipt(hash).await })
            .await?;
        Ok(receipt.as_ref().map(receipt_info))
    }

    async fn get_account_nonce(&self, address: Address, tag: NonceTag) -> Result<u64, EngineError> {
        self.with_timeout(async {
            let call = self.provider.get_transaction_count(address);
            match tag {
                NonceTag::Latest => call.latest().await,
                NonceTag::Pending => call.pending().await,
            }
        })
        .await
    }

    async fn estimate_fees(&self) -> Result<FeeParams, EngineError> {
        match self
            .with_timeout(async { self.provider.estimate_eip1559_fees().await })
            .await
        {
            Ok(estimate) => Ok(FeeParams::Eip1559 {
                max_fee_per_gas: estimate.max_fee_per_gas,
                max_priority_fee_per_gas: estimate.max_priority_fee_per_gas,
            }),
            Err(e) => {
                tracing::debug!(
                    chain_id = self.chain_id,
                    error = ?e,
                    "EIP-1559 fee estimation failed, falling back to legacy gas price"
                );
                let gas_price = self
                    .with_timeout(async { self.provider.get_gas_price().await })
                    .await?;
                Ok(FeeParams::Legacy { gas_price })
            }
        }
    }

    async fn estimate_gas(&self, call: &PreparedCall) -> Result<u64, EngineError> {
        let mut request = TransactionRequest::default()
            .from(call.from)
            .value(call.value)
            .input(TransactionInput::new(call.data.clone()));

        if let Some(to) = call.to {
            request = request.to(to);
        }

        self.with_timeout(async { self.provider.estimate_gas(request).await })
            .await
    }

    async fn broadcast(&self, raw: Bytes) -> Result<B256, EngineError> {
        let pending = self
            .with_timeout(async { self.provider.send_raw_transaction(&raw).await })
            .await?;
        Ok(*pending.tx_hash())
    }
}

/// One configured RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEndpoint {
    pub chain_id: u64,
    pub rpc_url: String,
}

/// Chain lookup over a static set of JSON-RPC endpoints.
#[derive(Clone)]
pub struct RpcChainService {
    chains: HashMap<u64, RpcChain>,
}

impl RpcChainService {
    pub fn new(endpoints: &[ChainEndpoint], timeout: Duration) -> Result<Self, EngineError> {
        let mut chains = HashMap::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let rpc_url =
                Url::parse(&endpoint.rpc_url).map_err(|e| EngineError::RpcConfigError {
                    message: format!(
                        "Invalid RPC URL for chain {}: {}",
                        endpoint.chain_id, e
                    ),
                })?;

            if chains
                .insert(
                    endpoint.chain_id,
                    RpcChain::new(endpoint.chain_id, rpc_url, timeout),
                )
                .is_some()
            {
                return Err(EngineError::RpcConfigError {
                    message: format!("Chain {} configured twice", endpoint.chain_id),
                });
            }
        }

        Ok(Self { chains })
    }
}

impl ChainService for RpcChainService {
    type Chain = RpcChain;

    fn get_chain(&self, chain_id: u64) -> Result<RpcChain, EngineError> {
        self.chains
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| EngineError::RpcConfigError {
                message: format!("No RPC endpoint configured for chain {chain_id}"),
            })
    }

    fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
