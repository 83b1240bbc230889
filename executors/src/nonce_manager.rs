use std::{collections::BTreeSet, sync::Arc};

use alloy::primitives::Address;
use dashmap::DashMap;
use engine_core::error::EngineError;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A sending wallet on one chain. Nonces are scoped to this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletKey {
    pub chain_id: u64,
    pub address: Address,
}

impl WalletKey {
    pub fn new(chain_id: u64, address: Address) -> Self {
        Self { chain_id, address }
    }
}

impl std::fmt::Display for WalletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.address)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum NonceManagerError {
    #[error("Nonce state for {wallet} has not been synced with the chain")]
    NotSynced { wallet: WalletKey },
}

impl From<NonceManagerError> for EngineError {
    fn from(error: NonceManagerError) -> Self {
        EngineError::InternalError {
            message: error.to_string(),
        }
    }
}

/// Per-wallet nonce bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletNonceState {
    /// Highest nonce ever handed out.
    pub last_assigned: Option<u64>,
    /// Highest nonce the chain reports as included, as of the last sync.
    pub last_confirmed_on_chain: Option<u64>,
    /// Nonces below `last_assigned` that were handed out and then given back.
    pub recycled: BTreeSet<u64>,
    pub synced_at: Option<u64>,
}

impl WalletNonceState {
    fn next_fresh(&self) -> u64 {
        self.last_assigned.map_or(0, |n| n + 1)
    }

    /// Lowest recycled nonce first, otherwise the next fresh one.
    fn take(&mut self) -> u64 {
        if let Some(nonce) = self.recycled.pop_first() {
            return nonce;
        }
        let nonce = self.next_fresh();
        self.last_assigned = Some(nonce);
        nonce
    }

    fn release(&mut self, nonce: u64) {
        if self.last_assigned == Some(nonce) {
            // roll the high-water mark back instead of leaving a gap at the top
            self.last_assigned = nonce.checked_sub(1);
            while let Some(top) = self.last_assigned {
                if !self.recycled.remove(&top) {
                    break;
                }
                self.last_assigned = top.checked_sub(1);
            }
        } else if self.last_assigned.is_some_and(|last| nonce < last) {
            self.recycled.insert(nonce);
        }
    }

    /// First sync after startup: rebuild from chain state and nonces still
    /// held by live records.
    fn seed(&mut self, chain_pending: u64, chain_latest: u64, held: &BTreeSet<u64>, now: u64) {
        let next = held
            .last()
            .map_or(chain_pending, |max| chain_pending.max(max + 1));

        self.last_assigned = next.checked_sub(1);
        self.recycled = (chain_pending..next).filter(|n| !held.contains(n)).collect();
        self.last_confirmed_on_chain = chain_latest.checked_sub(1);
        self.synced_at = Some(now);
    }

    /// Subsequent syncs: never move backwards, drop recycled nonces the chain
    /// has already consumed.
    fn reconcile(&mut self, chain_pending: u64, chain_latest: u64, now: u64) {
        if chain_pending > self.next_fresh() {
            tracing::warn!(
                chain_pending = chain_pending,
                next_fresh = self.next_fresh(),
                "Chain nonce ahead of local state, raising it"
            );
            self.last_assigned = Some(chain_pending - 1);
        }
        self.recycled.retain(|n| *n >= chain_pending);
        self.last_confirmed_on_chain = chain_latest.checked_sub(1);
        self.synced_at = Some(now);
    }
}

/// A nonce handed out under the wallet lock.
///
/// The lock stays held until the reservation is committed or dropped, so the
/// caller can persist the assignment before anyone else draws a nonce. A
/// reservation dropped without [`NonceReservation::commit`] gives the nonce back.
pub struct NonceReservation {
    wallet: WalletKey,
    nonce: u64,
    guard: Option<OwnedMutexGuard<WalletNonceState>>,
}

impl NonceReservation {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn wallet(&self) -> WalletKey {
        self.wallet
    }

    /// Keep the nonce and release the wallet lock.
    pub fn commit(mut self) -> u64 {
        self.guard.take();
        self.nonce
    }
}

impl Drop for NonceReservation {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            tracing::debug!(wallet = %self.wallet, nonce = self.nonce, "Nonce reservation dropped, recycling");
            guard.release(self.nonce);
        }
    }
}

/// Hands out gap-free, never-duplicated nonces per (chain, sender).
///
/// Each wallet has its own async lock; different wallets never contend.
#[derive(Default)]
pub struct NonceManager {
    wallets: DashMap<WalletKey, Arc<Mutex<WalletNonceState>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn wallet(&self, key: WalletKey) -> Arc<Mutex<WalletNonceState>> {
        self.wallets.entry(key).or_default().clone()
    }

    pub fn known_wallets(&self) -> Vec<WalletKey> {
        self.wallets.iter().map(|entry| *entry.key()).collect()
    }

    pub async fn snapshot(&self, key: WalletKey) -> WalletNonceState {
        self.wallet(key).lock().await.clone()
    }

    /// Last sync time in ms, `None` when never synced.
    pub async fn synced_at(&self, key: WalletKey) -> Option<u64> {
        self.wallet(key).lock().await.synced_at
    }

    /// Bring local state in line with the chain.
    ///
    /// `chain_pending` is the pending transaction count, `chain_latest` the
    /// latest one. `held` holds nonces assigned to records that are not yet
    /// mined or errored, and only matters on the first sync.
    pub async fn sync(
        &self,
        key: WalletKey,
        chain_pending: u64,
        chain_latest: u64,
        held: &BTreeSet<u64>,
        now: u64,
    ) -> WalletNonceState {
        let wallet = self.wallet(key);
        let mut state = wallet.lock().await;
        if state.synced_at.is_none() {
            state.seed(chain_pending, chain_latest, held, now);
            tracing::info!(
                wallet = %key,
                next_nonce = state.next_fresh(),
                recycled = ?state.recycled,
                "Seeded nonce state"
            );
        } else {
            state.reconcile(chain_pending, chain_latest, now);
        }
        state.clone()
    }

    /// Reserve the next nonce for `key`.
    pub async fn next_nonce(&self, key: WalletKey) -> Result<NonceReservation, NonceManagerError> {
        let mut guard = self.wallet(key).lock_owned().await;
        if guard.synced_at.is_none() {
            return Err(NonceManagerError::NotSynced { wallet: key });
        }
        let nonce = guard.take();
        Ok(NonceReservation {
            wallet: key,
            nonce,
            guard: Some(guard),
        })
    }

    /// Return a nonce that was assigned but never broadcast.
    pub async fn release(&self, key: WalletKey, nonce: u64) {
        let wallet = self.wallet(key);
        let mut state = wallet.lock().await;
        state.release(nonce);
        tracing::debug!(wallet = %key, nonce = nonce, "Released nonce");
    }

    /// Reserve the lowest recycled nonce, if any sits below the high-water mark.
    /// Used to fill gaps with no-op transactions.
    pub async fn take_gap(&self, key: WalletKey) -> Option<NonceReservation> {
        let mut guard = self.wallet(key).lock_owned().await;
        let nonce = *guard.recycled.first()?;
        guard.recycled.remove(&nonce);
        Some(NonceReservation {
            wallet: key,
            nonce,
            guard: Some(guard),
        })
    }
}
