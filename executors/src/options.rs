use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the workers, the indexers and the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Prefix for every store key.
    pub namespace: Option<String>,
    /// Identity used for submission claims. A random one is generated when unset.
    pub worker_id: Option<String>,

    pub send_poll_interval_ms: u64,
    pub retry_poll_interval_ms: u64,
    pub indexer_poll_interval_ms: u64,
    pub registry_reconcile_interval_ms: u64,
    pub nonce_reconcile_interval_ms: u64,

    /// How long a submission worker's claim on a record lasts.
    pub claim_lease_ms: u64,
    /// Wallets processed in parallel by one submission worker.
    pub send_concurrency: usize,
    pub max_send_retries: u32,
    pub send_backoff_base_ms: u64,
    pub send_backoff_max_ms: u64,

    /// A submitted transaction with no receipt for this long is re-priced.
    pub stall_threshold_ms: u64,
    pub max_fee_escalations: u32,
    /// Raise per escalation. Nodes require at least 10% to accept a replacement.
    pub fee_bump_percent: u64,
    pub min_replacement_bump_percent: u64,
    pub max_fee_per_gas_cap: Option<u128>,
    /// Headroom added to estimated fees on first submission.
    pub fee_margin_percent: u64,
    /// Headroom added to estimated gas limits.
    pub gas_limit_margin_percent: u64,

    /// Blocks a mined transaction must be buried under before it is final.
    pub confirmation_depth: u64,
    pub indexer_batch_size: u64,
    /// Recent block hashes kept per chain for reorg detection.
    pub reorg_window: u64,

    pub idempotency_window_ms: u64,
    pub rpc_timeout_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            worker_id: None,
            send_poll_interval_ms: 500,
            retry_poll_interval_ms: 5_000,
            indexer_poll_interval_ms: 2_000,
            registry_reconcile_interval_ms: 10_000,
            nonce_reconcile_interval_ms: 30_000,
            claim_lease_ms: 60_000,
            send_concurrency: 16,
            max_send_retries: 5,
            send_backoff_base_ms: 1_000,
            send_backoff_max_ms: 60_000,
            stall_threshold_ms: 60_000,
            max_fee_escalations: 5,
            fee_bump_percent: 12,
            min_replacement_bump_percent: 10,
            max_fee_per_gas_cap: None,
            fee_margin_percent: 20,
            gas_limit_margin_percent: 20,
            confirmation_depth: 12,
            indexer_batch_size: 50,
            reorg_window: 64,
            idempotency_window_ms: 24 * 60 * 60 * 1000,
            rpc_timeout_ms: 10_000,
        }
    }
}

impl EngineOptions {
    pub fn send_poll_interval(&self) -> Duration {
        Duration::from_millis(self.send_poll_interval_ms)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.retry_poll_interval_ms)
    }

    pub fn indexer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.indexer_poll_interval_ms)
    }

    pub fn registry_reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.registry_reconcile_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Exponential backoff with jitter for the `attempt`-th consecutive failure.
    pub fn send_backoff_ms(&self, attempt: u32) -> u64 {
        let exp = self
            .send_backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.send_backoff_max_ms);
        let jitter = rand::random_range(0..=exp / 4);
        exp.saturating_sub(exp / 8).saturating_add(jitter)
    }

    /// Apply the estimation margin to a gas limit.
    pub fn gas_limit_with_margin(&self, estimate: u64) -> u64 {
        estimate.saturating_mul(100 + self.gas_limit_margin_percent) / 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let options = EngineOptions {
            send_backoff_base_ms: 100,
            send_backoff_max_ms: 1_000,
            ..Default::default()
        };

        let first = options.send_backoff_ms(0);
        assert!((87..=125).contains(&first), "{first}");

        for attempt in 0..40 {
            assert!(options.send_backoff_ms(attempt) <= 1_125);
        }
    }

    #[test]
    fn gas_margin_rounds_down() {
        let options = EngineOptions::default();
        assert_eq!(options.gas_limit_with_margin(21_000), 25_200);
    }
}
