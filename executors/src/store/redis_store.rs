use alloy::primitives::{Address, B256};
use redis::{AsyncCommands, Script, aio::ConnectionManager};

use super::{
    NonceSlotChange, StoreError, TransactionRecord, TransactionStatus, TransactionStore,
    Transition, now_ms,
};

const MAX_RETRIES: u32 = 10;
const RETRY_BASE_DELAY_MS: u64 = 10;

/// Replaces a record only if its stored JSON is still the one we read.
///
/// KEYS: record, old status index, old per-chain status index, new status
/// index, new per-chain status index.
/// ARGV: expected json, new json, score, id, slot key, slot op, hash keys...
///
/// Returns 1 on success, 0 when the record changed, -1 when the nonce slot is
/// held by another record.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= ARGV[1] then
  return 0
end

local id = ARGV[4]
local slot_key = ARGV[5]
local slot_op = ARGV[6]
if slot_op == 'acquire' then
  local holder = redis.call('GET', slot_key)
  if holder and holder ~= id then
    return -1
  end
  redis.call('SET', slot_key, id)
elseif slot_op == 'release' then
  if redis.call('GET', slot_key) == id then
    redis.call('DEL', slot_key)
  end
end

redis.call('SET', KEYS[1], ARGV[2])
if KEYS[2] ~= KEYS[4] then
  redis.call('ZREM', KEYS[2], id)
  redis.call('ZREM', KEYS[3], id)
  redis.call('ZADD', KEYS[4], ARGV[3], id)
  redis.call('ZADD', KEYS[5], ARGV[3], id)
end

for i = 7, #ARGV do
  redis.call('SET', ARGV[i], id)
end
return 1
"#;

/// KEYS: record, queued index, per-chain queued index.
/// ARGV: json, score, id, idempotency key or '', expected current holder or ''.
///
/// Returns 1 on success, 0 when the idempotency key moved underneath us.
const INSERT_SCRIPT: &str = r#"
if ARGV[4] ~= '' then
  local holder = redis.call('GET', ARGV[4])
  if (holder or '') ~= ARGV[5] then
    return 0
  end
  redis.call('SET', ARGV[4], ARGV[3])
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
return 1
"#;

/// Redis key layout, optionally prefixed with a namespace.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    pub namespace: Option<String>,
}

impl StoreKeys {
    fn prefix(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:relay"),
            None => "relay".to_string(),
        }
    }

    /// Record JSON
    pub fn record_key(&self, id: &str) -> String {
        format!("{}:tx:{id}", self.prefix())
    }

    /// Sorted set of record ids in `status`, scored by insertion sequence
    pub fn status_key(&self, status: TransactionStatus) -> String {
        format!("{}:status:{}", self.prefix(), status.as_str())
    }

    pub fn chain_status_key(&self, status: TransactionStatus, chain_id: u64) -> String {
        format!("{}:status:{}:{chain_id}", self.prefix(), status.as_str())
    }

    pub fn idempotency_key(&self, key: &str) -> String {
        format!("{}:idempotency:{key}", self.prefix())
    }

    /// Owner of a (chain, sender, nonce) triple among live records
    pub fn nonce_slot_key(&self, chain_id: u64, from: Address, nonce: u64) -> String {
        format!("{}:nonce_slot:{chain_id}:{from}:{nonce}", self.prefix())
    }

    pub fn hash_key(&self, chain_id: u64, hash: B256) -> String {
        format!("{}:hash:{chain_id}:{hash}", self.prefix())
    }

    pub fn cursor_key(&self, chain_id: u64) -> String {
        format!("{}:cursor:{chain_id}", self.prefix())
    }

    /// Counter handing out insertion order
    pub fn sequence_key(&self) -> String {
        format!("{}:sequence", self.prefix())
    }
}

pub struct RedisTransactionStore {
    pub redis: ConnectionManager,
    pub keys: StoreKeys,
    idempotency_window_ms: u64,
    compare_and_set: Script,
    insert: Script,
}

impl RedisTransactionStore {
    pub fn new(
        redis: ConnectionManager,
        namespace: Option<String>,
        idempotency_window_ms: u64,
    ) -> Self {
        Self {
            redis,
            keys: StoreKeys { namespace },
            idempotency_window_ms,
            compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
            insert: Script::new(INSERT_SCRIPT),
        }
    }

    async fn backoff(&self, retry_count: u32, operation: &str, id: &str) {
        let delay_ms = RETRY_BASE_DELAY_MS * (1 << (retry_count - 1).min(6));
        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
        tracing::debug!(
            retry_count = retry_count,
            delay_ms = delay_ms,
            transaction_id = id,
            operation = operation,
            "Retrying atomic operation"
        );
    }

    async fn read_raw(&self, id: &str) -> Result<(String, TransactionRecord), StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.keys.record_key(id)).await?;
        let raw = raw.ok_or_else(|| StoreError::NotFound {
            transaction_id: id.to_string(),
        })?;
        let record = serde_json::from_str(&raw)?;
        Ok((raw, record))
    }
}

impl TransactionStore for RedisTransactionStore {
    async fn insert(&self, mut record: TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let mut conn = self.redis.clone();
        record.sequence = conn.incr(self.keys.sequence_key(), 1u64).await?;
        let json = serde_json::to_string(&record)?;
        let idempotency_key = record
            .idempotency_key
            .as_deref()
            .map(|key| self.keys.idempotency_key(key));

        let mut retry_count = 0;
        loop {
            if retry_count >= MAX_RETRIES {
                return Err(StoreError::ConcurrentModification {
                    transaction_id: record.id.clone(),
                });
            }
            if retry_count > 0 {
                self.backoff(retry_count, "insert", &record.id).await;
            }

            let mut expected_holder = String::new();
            if let (Some(redis_key), Some(key)) = (&idempotency_key, &record.idempotency_key) {
                let holder: Option<String> = conn.get(redis_key).await?;
                if let Some(holder) = holder {
                    let holds = match self.read_raw(&holder).await {
                        Ok((_, existing)) => {
                            existing.holds_idempotency_key(now_ms(), self.idempotency_window_ms)
                        }
                        Err(StoreError::NotFound { .. }) => false,
                        Err(e) => return Err(e),
                    };
                    if holds {
                        return Err(StoreError::DuplicateIdempotencyKey {
                            key: key.clone(),
                            existing_id: holder,
                        });
                    }
                    expected_holder = holder;
                }
            }

            let applied: i64 = self
                .insert
                .key(self.keys.record_key(&record.id))
                .key(self.keys.status_key(TransactionStatus::Queued))
                .key(
                    self.keys
                        .chain_status_key(TransactionStatus::Queued, record.chain_id),
                )
                .arg(&json)
                .arg(record.sequence)
                .arg(&record.id)
                .arg(idempotency_key.as_deref().unwrap_or(""))
                .arg(&expected_holder)
                .invoke_async(&mut conn)
                .await?;

            if applied == 1 {
                return Ok(record);
            }
            retry_count += 1;
        }
    }

    async fn get(&self, id: &str) -> Result<TransactionRecord, StoreError> {
        self.read_raw(id).await.map(|(_, record)| record)
    }

    async fn list_by_status(
        &self,
        status: TransactionStatus,
        chain_id: Option<u64>,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let index = match chain_id {
            Some(chain_id) => self.keys.chain_status_key(status, chain_id),
            None => self.keys.status_key(status),
        };

        let ids: Vec<String> = conn.zrange(&index, 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.keys.record_key(id)).collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(raws.len());
        for raw in raws.into_iter().flatten() {
            let record: TransactionRecord = serde_json::from_str(&raw)?;
            // the index is updated in the same script as the record, but a
            // record may have moved between ZRANGE and MGET
            if record.status == status {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn update_status(
        &self,
        id: &str,
        transition: Transition,
    ) -> Result<TransactionRecord, StoreError> {
        let mut conn = self.redis.clone();
        let mut retry_count = 0;

        loop {
            if retry_count >= MAX_RETRIES {
                return Err(StoreError::ConcurrentModification {
                    transaction_id: id.to_string(),
                });
            }
            if retry_count > 0 {
                self.backoff(retry_count, transition.name(), id).await;
            }

            let (raw, mut record) = self.read_raw(id).await?;
            let old_status = record.status;
            let effects = transition.apply(&mut record, now_ms())?;
            let json = serde_json::to_string(&record)?;

            let (slot_key, slot_op, slot_nonce) = match effects.slot {
                NonceSlotChange::Acquire(nonce) => (
                    self.keys.nonce_slot_key(record.chain_id, record.from, nonce),
                    "acquire",
                    Some(nonce),
                ),
                NonceSlotChange::Release(nonce) => (
                    self.keys.nonce_slot_key(record.chain_id, record.from, nonce),
                    "release",
                    Some(nonce),
                ),
                NonceSlotChange::None => (String::new(), "none", None),
            };

            let mut invocation = self.compare_and_set.prepare_invoke();
            invocation
                .key(self.keys.record_key(id))
                .key(self.keys.status_key(old_status))
                .key(self.keys.chain_status_key(old_status, record.chain_id))
                .key(self.keys.status_key(record.status))
                .key(self.keys.chain_status_key(record.status, record.chain_id))
                .arg(&raw)
                .arg(&json)
                .arg(record.sequence)
                .arg(id)
                .arg(&slot_key)
                .arg(slot_op);
            for hash in &effects.new_hashes {
                invocation.arg(self.keys.hash_key(record.chain_id, *hash));
            }

            let applied: i64 = invocation.invoke_async(&mut conn).await?;
            match applied {
                1 => return Ok(record),
                -1 => {
                    let holder: Option<String> = conn.get(&slot_key).await?;
                    return Err(StoreError::NonceConflict {
                        chain_id: record.chain_id,
                        from: record.from,
                        nonce: slot_nonce.unwrap_or_default(),
                        holder: holder.unwrap_or_default(),
                    });
                }
                _ => retry_count += 1,
            }
        }
    }

    async fn find_by_hash(&self, chain_id: u64, hash: B256) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let id: Option<String> = conn.get(self.keys.hash_key(chain_id, hash)).await?;
        Ok(id)
    }

    async fn load_cursor(&self, chain_id: u64) -> Result<Option<u64>, StoreError> {
        let mut conn = self.redis.clone();
        let cursor: Option<u64> = conn.get(self.keys.cursor_key(chain_id)).await?;
        Ok(cursor)
    }

    async fn save_cursor(&self, chain_id: u64, next_block: u64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn.set(self.keys.cursor_key(chain_id), next_block).await?;
        Ok(())
    }
}
