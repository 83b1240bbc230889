#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U256, keccak256};
use alloy::transports::http::reqwest::Url;
use engine_core::chain::{Chain, ChainService, NonceTag};
use engine_core::error::{EngineError, RpcErrorKind, RpcErrorResponse};
use engine_core::signer::TransactionSigner;
use engine_core::transaction::{
    BlockInfo, FeeParams, GasOverrides, LogInfo, PreparedCall, ReceiptInfo, UnsignedTransaction,
};
use engine_executors::engine::{EnqueueRequest, TransactionEngine};
use engine_executors::events::{EventEnvelope, EventKind, EventSink};
use engine_executors::indexer::{ContractEventSubscription, StoreSubscriptionSource};
use engine_executors::options::EngineOptions;
use engine_executors::store::{
    MemoryTransactionStore, TransactionRecord, TransactionStatus, TransactionStore,
};
use tokio::sync::oneshot;

// Redis connection URL for tests
pub const REDIS_URL: &str = "redis://127.0.0.1:6379/";

pub const POLYGON: u64 = 137;
pub const MAINNET: u64 = 1;

pub fn sender() -> Address {
    Address::repeat_byte(0x0a)
}

pub fn other_sender() -> Address {
    Address::repeat_byte(0x0b)
}

pub fn recipient() -> Address {
    Address::repeat_byte(0x0c)
}

// Helper to clean up Redis keys for a given namespace
pub async fn cleanup_redis_keys(conn_manager: &redis::aio::ConnectionManager, namespace: &str) {
    let mut conn = conn_manager.clone();
    let keys_pattern = format!("{namespace}:*");

    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(&keys_pattern)
        .query_async(&mut conn)
        .await
        .unwrap_or_default();
    if !keys.is_empty() {
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<()>(&mut conn)
            .await
            .unwrap_or_default();
    }
    tracing::info!("Cleaned up keys for pattern: {}", keys_pattern);
}

// Setup tracing for tests
pub fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engine_executors=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

// --- Errors the mock node answers with ---

pub fn node_error(chain_id: u64, message: &str) -> EngineError {
    EngineError::RpcError {
        chain_id,
        rpc_url: "http://mock.node".to_string(),
        message: message.to_string(),
        kind: RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: -32000,
            message: message.to_string(),
            data: None,
        }),
    }
}

pub fn timeout_error(chain_id: u64) -> EngineError {
    EngineError::RpcError {
        chain_id,
        rpc_url: "http://mock.node".to_string(),
        message: "request timed out".to_string(),
        kind: RpcErrorKind::Timeout { timeout_ms: 100 },
    }
}

// --- Mock chain ---

/// How the next broadcast misbehaves.
#[derive(Debug, Clone)]
pub enum BroadcastFault {
    /// The node rejects the payload.
    Reject(EngineError),
    /// The payload reaches the mempool but the caller sees an error.
    AcceptThenError(EngineError),
}

#[derive(Debug, Clone)]
struct PendingTx {
    hash: B256,
    tx: UnsignedTransaction,
}

#[derive(Debug)]
struct MockChainState {
    chain_id: u64,
    fork: u64,
    blocks: Vec<BlockInfo>,
    block_txs: Vec<Vec<PendingTx>>,
    receipts: HashMap<B256, ReceiptInfo>,
    mempool: Vec<PendingTx>,
    account_nonces: HashMap<Address, u64>,
    broadcasts: Vec<B256>,
    faults: VecDeque<BroadcastFault>,
    gas_error: Option<EngineError>,
    fees: FeeParams,
    reverting: HashSet<Address>,
    emitters: HashMap<Address, B256>,
    include_transactions: bool,
    hidden_receipt_lookups: u32,
    block_pause: Option<BlockPause>,
}

/// Holds a `get_block` call until the test lets it continue.
#[derive(Debug)]
struct BlockPause {
    number: u64,
    reached: oneshot::Sender<()>,
    resume: oneshot::Receiver<()>,
}

impl MockChainState {
    fn block_hash(&self, number: u64) -> B256 {
        keccak256(format!("{}:{}:{}", self.chain_id, number, self.fork))
    }

    fn latest_nonce(&self, address: Address) -> u64 {
        self.account_nonces.get(&address).copied().unwrap_or_default()
    }

    /// Like a real node, only counts pool transactions without a gap before them.
    fn pending_nonce(&self, address: Address) -> u64 {
        let mut next = self.latest_nonce(address);
        while self
            .mempool
            .iter()
            .any(|p| p.tx.from == address && p.tx.nonce == next)
        {
            next += 1;
        }
        next
    }

    fn push_block(&mut self, included: Vec<PendingTx>) -> BlockInfo {
        let number = self.blocks.len() as u64;
        let parent_hash = self.blocks.last().map(|b| b.hash).unwrap_or_default();
        let hash = self.block_hash(number);
        let block = BlockInfo {
            number,
            hash,
            parent_hash,
            timestamp: number * 2,
            transactions: included.iter().map(|p| p.hash).collect(),
        };

        for pending in &included {
            let to = pending.tx.to;
            let logs = to
                .and_then(|to| self.emitters.get(&to).map(|topic| (to, *topic)))
                .map(|(address, topic)| {
                    vec![LogInfo {
                        address,
                        topics: vec![topic],
                        data: Bytes::new(),
                        log_index: Some(0),
                    }]
                })
                .unwrap_or_default();
            let receipt = ReceiptInfo {
                transaction_hash: pending.hash,
                block_number: number,
                block_hash: hash,
                status: !to.is_some_and(|to| self.reverting.contains(&to)),
                gas_used: 21_000,
                effective_gas_price: pending.tx.fees.max_fee(),
                logs,
            };
            self.receipts.insert(pending.hash, receipt);
            self.account_nonces
                .insert(pending.tx.from, pending.tx.nonce + 1);
        }

        self.blocks.push(block.clone());
        self.block_txs.push(included);
        block
    }
}

/// In-memory EVM node: a mempool with replacement rules, explicit block
/// production, reorgs and injectable faults.
#[derive(Clone)]
pub struct MockChain {
    state: Arc<Mutex<MockChainState>>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        let mut state = MockChainState {
            chain_id,
            fork: 0,
            blocks: Vec::new(),
            block_txs: Vec::new(),
            receipts: HashMap::new(),
            mempool: Vec::new(),
            account_nonces: HashMap::new(),
            broadcasts: Vec::new(),
            faults: VecDeque::new(),
            gas_error: None,
            fees: FeeParams::Eip1559 {
                max_fee_per_gas: 100_000_000_000,
                max_priority_fee_per_gas: 2_000_000_000,
            },
            reverting: HashSet::new(),
            emitters: HashMap::new(),
            include_transactions: true,
            hidden_receipt_lookups: 0,
            block_pause: None,
        };
        // genesis
        state.push_block(Vec::new());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockChainState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Produce a block with every mempool transaction that is next in line
    /// for its sender.
    pub fn mine_block(&self) -> BlockInfo {
        self.with_state(|state| {
            let mut included = Vec::new();
            if state.include_transactions {
                let mut pool = std::mem::take(&mut state.mempool);
                pool.sort_by_key(|p| (p.tx.from, p.tx.nonce));
                let mut next: BTreeMap<Address, u64> = BTreeMap::new();
                let mut remaining = Vec::new();
                for pending in pool {
                    let expected = *next
                        .entry(pending.tx.from)
                        .or_insert_with(|| state.latest_nonce(pending.tx.from));
                    if pending.tx.nonce == expected {
                        next.insert(pending.tx.from, expected + 1);
                        included.push(pending);
                    } else {
                        remaining.push(pending);
                    }
                }
                state.mempool = remaining;
            }
            state.push_block(included)
        })
    }

    pub fn mine_blocks(&self, count: u64) {
        for _ in 0..count {
            self.mine_block();
        }
    }

    /// Include a transaction from `from` that none of our records sent,
    /// consuming its next nonce.
    pub fn mine_foreign_transaction(&self, from: Address) -> B256 {
        self.with_state(|state| {
            let nonce = state.latest_nonce(from);
            let tx = UnsignedTransaction::noop(state.chain_id, from, nonce, state.fees);
            let hash = keccak256(format!("foreign:{from}:{nonce}:{}", state.fork));
            state
                .mempool
                .retain(|p| !(p.tx.from == from && p.tx.nonce == nonce));
            state.push_block(vec![PendingTx { hash, tx }]);
            hash
        })
    }

    /// Drop the newest `depth` blocks. Their transactions go back to the
    /// mempool and later blocks get different hashes.
    pub fn reorg(&self, depth: u64) {
        self.with_state(|state| {
            state.fork += 1;
            for _ in 0..depth {
                if state.blocks.len() <= 1 {
                    break;
                }
                state.blocks.pop();
                let txs = state.block_txs.pop().unwrap_or_default();
                for pending in txs.into_iter().rev() {
                    state.receipts.remove(&pending.hash);
                    let latest = state.latest_nonce(pending.tx.from);
                    if pending.tx.nonce < latest {
                        state
                            .account_nonces
                            .insert(pending.tx.from, pending.tx.nonce);
                    }
                    state.mempool.push(pending);
                }
            }
        })
    }

    pub fn push_fault(&self, fault: BroadcastFault) {
        self.with_state(|state| state.faults.push_back(fault));
    }

    pub fn fail_gas_estimation(&self, error: Option<EngineError>) {
        self.with_state(|state| state.gas_error = error);
    }

    pub fn set_fees(&self, fees: FeeParams) {
        self.with_state(|state| state.fees = fees);
    }

    /// Calls to `to` revert when included.
    pub fn revert_calls_to(&self, to: Address) {
        self.with_state(|state| {
            state.reverting.insert(to);
        });
    }

    /// Calls to `to` emit one log with `topic` when included.
    pub fn emit_log_on_call(&self, to: Address, topic: B256) {
        self.with_state(|state| {
            state.emitters.insert(to, topic);
        });
    }

    /// When off, blocks are produced empty.
    pub fn set_include_transactions(&self, include: bool) {
        self.with_state(|state| state.include_transactions = include);
    }

    /// The next `lookups` receipt queries answer "not found", like a lagging
    /// load-balanced node.
    pub fn hide_receipts_for(&self, lookups: u32) {
        self.with_state(|state| state.hidden_receipt_lookups = lookups);
    }

    /// The next fetch of block `number` signals the first receiver and waits
    /// for the returned sender before answering.
    pub fn pause_before_block(&self, number: u64) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        self.with_state(|state| {
            state.block_pause = Some(BlockPause {
                number,
                reached: reached_tx,
                resume: resume_rx,
            })
        });
        (reached_rx, resume_tx)
    }

    pub fn head(&self) -> u64 {
        self.with_state(|state| state.blocks.len() as u64 - 1)
    }

    pub fn broadcasts(&self) -> Vec<B256> {
        self.with_state(|state| state.broadcasts.clone())
    }

    pub fn mempool_hashes(&self) -> Vec<B256> {
        self.with_state(|state| state.mempool.iter().map(|p| p.hash).collect())
    }

    pub fn receipt(&self, hash: B256) -> Option<ReceiptInfo> {
        self.with_state(|state| state.receipts.get(&hash).cloned())
    }

    /// Decoded payloads in the mempool, e.g. to look at gap-fill no-ops.
    pub fn mempool_transactions(&self) -> Vec<UnsignedTransaction> {
        self.with_state(|state| state.mempool.iter().map(|p| p.tx.clone()).collect())
    }

    fn accept(&self, raw: &Bytes) -> Result<B256, EngineError> {
        self.with_state(|state| {
            let chain_id = state.chain_id;
            let tx: UnsignedTransaction = serde_json::from_slice(raw)
                .map_err(|_| node_error(chain_id, "malformed transaction"))?;
            let hash = keccak256(raw);

            if tx.chain_id != chain_id {
                return Err(node_error(chain_id, "invalid chain id"));
            }
            if state.receipts.contains_key(&hash) || state.mempool.iter().any(|p| p.hash == hash) {
                return Err(node_error(chain_id, "already known"));
            }
            if tx.nonce < state.latest_nonce(tx.from) {
                return Err(node_error(chain_id, "nonce too low"));
            }

            if let Some(position) = state
                .mempool
                .iter()
                .position(|p| p.tx.from == tx.from && p.tx.nonce == tx.nonce)
            {
                if !tx.fees.is_replacement_for(&state.mempool[position].tx.fees, 10) {
                    return Err(node_error(chain_id, "replacement transaction underpriced"));
                }
                state.mempool.remove(position);
            }

            state.broadcasts.push(hash);
            state.mempool.push(PendingTx { hash, tx });
            Ok(hash)
        })
    }
}

impl Chain for MockChain {
    fn chain_id(&self) -> u64 {
        self.with_state(|state| state.chain_id)
    }

    fn rpc_url(&self) -> Url {
        Url::parse("http://mock.node").unwrap()
    }

    async fn block_number(&self) -> Result<u64, EngineError> {
        Ok(self.head())
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockInfo>, EngineError> {
        let pause = self.with_state(|state| {
            match state.block_pause.as_ref() {
                Some(pause) if pause.number == number => state.block_pause.take(),
                _ => None,
            }
        });
        if let Some(pause) = pause {
            let _ = pause.reached.send(());
            let _ = pause.resume.await;
        }
        Ok(self.with_state(|state| state.blocks.get(number as usize).cloned()))
    }

    async fn get_block_receipts(&self, number: u64) -> Result<Vec<ReceiptInfo>, EngineError> {
        Ok(self.with_state(|state| {
            state
                .block_txs
                .get(number as usize)
                .map(|txs| {
                    txs.iter()
                        .filter_map(|p| state.receipts.get(&p.hash).cloned())
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn get_receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, EngineError> {
        Ok(self.with_state(|state| {
            if state.hidden_receipt_lookups > 0 {
                state.hidden_receipt_lookups -= 1;
                return None;
            }
            state.receipts.get(&hash).cloned()
        }))
    }

    async fn get_account_nonce(&self, address: Address, tag: NonceTag) -> Result<u64, EngineError> {
        Ok(self.with_state(|state| match tag {
            NonceTag::Latest => state.latest_nonce(address),
            NonceTag::Pending => state.pending_nonce(address),
        }))
    }

    async fn estimate_fees(&self) -> Result<FeeParams, EngineError> {
        Ok(self.with_state(|state| state.fees))
    }

    async fn estimate_gas(&self, _call: &PreparedCall) -> Result<u64, EngineError> {
        match self.with_state(|state| state.gas_error.clone()) {
            Some(error) => Err(error),
            None => Ok(50_000),
        }
    }

    async fn broadcast(&self, raw: Bytes) -> Result<B256, EngineError> {
        match self.with_state(|state| state.faults.pop_front()) {
            Some(BroadcastFault::Reject(error)) => Err(error),
            Some(BroadcastFault::AcceptThenError(error)) => {
                self.accept(&raw)?;
                Err(error)
            }
            None => self.accept(&raw),
        }
    }
}

#[derive(Clone, Default)]
pub struct MockChainService {
    chains: HashMap<u64, MockChain>,
}

impl MockChainService {
    pub fn new(chain_ids: &[u64]) -> Self {
        Self {
            chains: chain_ids
                .iter()
                .map(|id| (*id, MockChain::new(*id)))
                .collect(),
        }
    }

    pub fn chain(&self, chain_id: u64) -> MockChain {
        self.chains[&chain_id].clone()
    }
}

impl ChainService for MockChainService {
    type Chain = MockChain;

    fn get_chain(&self, chain_id: u64) -> Result<MockChain, EngineError> {
        self.chains
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| EngineError::RpcConfigError {
                message: format!("No RPC configured for chain {chain_id}"),
            })
    }

    fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

// --- Mock signer ---

/// "Signs" by serializing the unsigned transaction, which the mock chain decodes.
pub struct MockSigner {
    managed: HashSet<Address>,
    unavailable: Mutex<bool>,
    signed: Mutex<Vec<UnsignedTransaction>>,
}

impl MockSigner {
    pub fn new(managed: &[Address]) -> Self {
        Self {
            managed: managed.iter().copied().collect(),
            unavailable: Mutex::new(false),
            signed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    pub fn signed(&self) -> Vec<UnsignedTransaction> {
        self.signed.lock().unwrap().clone()
    }
}

impl TransactionSigner for MockSigner {
    fn manages(&self, from: Address) -> bool {
        self.managed.contains(&from)
    }

    async fn sign(
        &self,
        _chain_id: u64,
        from: Address,
        tx: &UnsignedTransaction,
    ) -> Result<Bytes, EngineError> {
        if *self.unavailable.lock().unwrap() {
            return Err(EngineError::SignerUnavailable {
                from,
                message: "key service unreachable".to_string(),
            });
        }
        if !self.managed.contains(&from) {
            return Err(EngineError::SigningError {
                message: format!("no key for {from}"),
            });
        }
        self.signed.lock().unwrap().push(tx.clone());
        let raw = serde_json::to_vec(tx).map_err(|e| EngineError::SigningError {
            message: e.to_string(),
        })?;
        Ok(Bytes::from(raw))
    }
}

// --- Recording event sink ---

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingSink {
    pub fn all(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds_for(&self, transaction_id: &str) -> Vec<EventKind> {
        self.all()
            .into_iter()
            .filter(|e| e.transaction_id.as_deref() == Some(transaction_id))
            .map(|e| e.kind)
            .collect()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<EventEnvelope> {
        self.all().into_iter().filter(|e| e.kind == kind).collect()
    }
}

impl EventSink for RecordingSink {
    async fn notify(&self, _kind: EventKind, payload: EventEnvelope) {
        self.events.lock().unwrap().push(payload);
    }
}

// --- Engine harness ---

pub type TestSubscriptions = StoreSubscriptionSource<MemoryTransactionStore>;
pub type TestEngine =
    TransactionEngine<MemoryTransactionStore, MockChainService, MockSigner, RecordingSink, TestSubscriptions>;

/// Fast, deterministic settings: no backoff, short polls, shallow finality.
pub fn test_options() -> EngineOptions {
    EngineOptions {
        worker_id: Some("test-worker".to_string()),
        send_poll_interval_ms: 20,
        retry_poll_interval_ms: 20,
        indexer_poll_interval_ms: 20,
        registry_reconcile_interval_ms: 20,
        send_backoff_base_ms: 0,
        send_backoff_max_ms: 0,
        stall_threshold_ms: 0,
        confirmation_depth: 2,
        reorg_window: 16,
        ..EngineOptions::default()
    }
}

pub struct Harness {
    pub engine: TestEngine,
    pub chains: Arc<MockChainService>,
    pub signer: Arc<MockSigner>,
    pub events: Arc<RecordingSink>,
    pub store: Arc<MemoryTransactionStore>,
    pub subscriptions: Arc<TestSubscriptions>,
}

impl Harness {
    pub fn new(options: EngineOptions) -> Self {
        Self::with_subscriptions(options, Vec::new())
    }

    pub fn with_subscriptions(
        options: EngineOptions,
        subscriptions: Vec<ContractEventSubscription>,
    ) -> Self {
        let chains = Arc::new(MockChainService::new(&[MAINNET, POLYGON]));
        let signer = Arc::new(MockSigner::new(&[sender(), other_sender()]));
        let events = Arc::new(RecordingSink::default());
        let store = Arc::new(MemoryTransactionStore::new(options.idempotency_window_ms));
        let subscriptions = Arc::new(StoreSubscriptionSource::new(store.clone(), subscriptions));

        let engine = TransactionEngine::new(
            store.clone(),
            chains.clone(),
            signer.clone(),
            events.clone(),
            subscriptions.clone(),
            options,
        );

        Self {
            engine,
            chains,
            signer,
            events,
            store,
            subscriptions,
        }
    }

    pub fn chain(&self, chain_id: u64) -> MockChain {
        self.chains.chain(chain_id)
    }

    pub async fn enqueue(&self, chain_id: u64, from: Address) -> String {
        self.engine
            .enqueue(transfer(chain_id, from))
            .await
            .unwrap()
            .id
    }

    pub async fn record(&self, id: &str) -> TransactionRecord {
        self.store.get(id).await.unwrap()
    }
}

pub fn transfer(chain_id: u64, from: Address) -> EnqueueRequest {
    call_to(chain_id, from, recipient())
}

pub fn call_to(chain_id: u64, from: Address, to: Address) -> EnqueueRequest {
    EnqueueRequest {
        call: PreparedCall {
            chain_id,
            from,
            to: Some(to),
            data: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
            value: U256::from(1_000u64),
        },
        idempotency_key: None,
        overrides: GasOverrides::default(),
    }
}

/// Poll the store until `id` reaches `status`.
pub async fn wait_for_status<S: TransactionStore>(
    store: &S,
    id: &str,
    status: TransactionStatus,
    timeout: Duration,
) -> TransactionRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let record = store.get(id).await.unwrap();
        if record.status == status {
            return record;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "transaction {id} stuck in {} waiting for {}",
                record.status, status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
