use alloy::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// ### PreparedCall
/// A fully encoded call produced upstream (ABI encoding, auth and routing happen
/// before the engine sees it). The engine only adds nonce, gas and fees.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreparedCall {
    pub chain_id: u64,

    /// Sending account. Must be an address the configured signer manages.
    pub from: Address,

    /// Destination. `None` means contract deployment.
    #[serde(default)]
    pub to: Option<Address>,

    #[serde(default)]
    pub data: Bytes,

    #[serde(default)]
    pub value: U256,
}

/// Caller supplied gas settings. Any field left empty is estimated by the engine.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GasOverrides {
    /// Gas limit for the transaction
    pub gas_limit: Option<u64>,

    /// Maximum fee per gas willing to pay (in wei)
    pub max_fee_per_gas: Option<u128>,

    /// Maximum priority fee per gas willing to pay (in wei)
    pub max_priority_fee_per_gas: Option<u128>,

    /// Gas price for legacy transactions (in wei)
    pub gas_price: Option<u128>,
}

impl GasOverrides {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.gas_limit == Some(0) {
            return Err(EngineError::validation("gasLimit must be greater than zero"));
        }

        let has_1559 = self.max_fee_per_gas.is_some() || self.max_priority_fee_per_gas.is_some();
        if has_1559 && self.gas_price.is_some() {
            return Err(EngineError::validation(
                "gasPrice cannot be combined with maxFeePerGas or maxPriorityFeePerGas",
            ));
        }

        if let (Some(max_fee), Some(priority)) =
            (self.max_fee_per_gas, self.max_priority_fee_per_gas)
        {
            if priority > max_fee {
                return Err(EngineError::validation(
                    "maxPriorityFeePerGas cannot exceed maxFeePerGas",
                ));
            }
        }

        Ok(())
    }

    /// Fee parameters fully pinned by the caller, if any.
    ///
    /// A lone `maxFeePerGas` is treated as pinned with a priority fee equal to it.
    /// A lone `maxPriorityFeePerGas` is not enough and returns `None`.
    pub fn fee_params(&self) -> Option<FeeParams> {
        if let Some(gas_price) = self.gas_price {
            return Some(FeeParams::Legacy { gas_price });
        }

        let max_fee_per_gas = self.max_fee_per_gas?;
        Some(FeeParams::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas.unwrap_or(max_fee_per_gas),
        })
    }
}

/// Resolved fee parameters for a signed attempt.
///
/// Must stay externally tagged: serde cannot buffer `u128` fields.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FeeParams {
    #[serde(rename_all = "camelCase")]
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
    #[serde(rename_all = "camelCase")]
    Legacy { gas_price: u128 },
}

fn scale(value: u128, percent: u64) -> u128 {
    value.saturating_mul(100 + percent as u128) / 100
}

impl FeeParams {
    /// Highest price per gas this attempt may pay.
    pub fn max_fee(&self) -> u128 {
        match self {
            FeeParams::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
            FeeParams::Legacy { gas_price } => *gas_price,
        }
    }

    /// Every component raised by `percent`.
    pub fn bumped(&self, percent: u64) -> FeeParams {
        match *self {
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => FeeParams::Eip1559 {
                max_fee_per_gas: scale(max_fee_per_gas, percent),
                max_priority_fee_per_gas: scale(max_priority_fee_per_gas, percent),
            },
            FeeParams::Legacy { gas_price } => FeeParams::Legacy {
                gas_price: scale(gas_price, percent),
            },
        }
    }

    /// Component-wise maximum. The shape of `self` wins when the two differ.
    pub fn max_with(&self, other: &FeeParams) -> FeeParams {
        match (*self, *other) {
            (
                FeeParams::Eip1559 {
                    max_fee_per_gas: a_max,
                    max_priority_fee_per_gas: a_tip,
                },
                FeeParams::Eip1559 {
                    max_fee_per_gas: b_max,
                    max_priority_fee_per_gas: b_tip,
                },
            ) => FeeParams::Eip1559 {
                max_fee_per_gas: a_max.max(b_max),
                max_priority_fee_per_gas: a_tip.max(b_tip),
            },
            (
                FeeParams::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                },
                FeeParams::Legacy { gas_price },
            ) => FeeParams::Eip1559 {
                max_fee_per_gas: max_fee_per_gas.max(gas_price),
                max_priority_fee_per_gas: max_priority_fee_per_gas.max(gas_price),
            },
            (FeeParams::Legacy { gas_price }, other) => FeeParams::Legacy {
                gas_price: gas_price.max(other.max_fee()),
            },
        }
    }

    /// Clamp every component to `cap`.
    pub fn capped(&self, cap: u128) -> FeeParams {
        match *self {
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => FeeParams::Eip1559 {
                max_fee_per_gas: max_fee_per_gas.min(cap),
                max_priority_fee_per_gas: max_priority_fee_per_gas.min(cap),
            },
            FeeParams::Legacy { gas_price } => FeeParams::Legacy {
                gas_price: gas_price.min(cap),
            },
        }
    }

    /// Whether a node would accept `self` as a replacement for `previous`,
    /// i.e. every component is at least `min_bump_percent` higher.
    pub fn is_replacement_for(&self, previous: &FeeParams, min_bump_percent: u64) -> bool {
        match (self, previous) {
            (
                FeeParams::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                },
                FeeParams::Eip1559 {
                    max_fee_per_gas: prev_max,
                    max_priority_fee_per_gas: prev_tip,
                },
            ) => {
                *max_fee_per_gas >= scale(*prev_max, min_bump_percent)
                    && *max_priority_fee_per_gas >= scale(*prev_tip, min_bump_percent)
                    && max_fee_per_gas > prev_max
            }
            (current, previous) => {
                current.max_fee() >= scale(previous.max_fee(), min_bump_percent)
                    && current.max_fee() > previous.max_fee()
            }
        }
    }
}

/// Everything needed to sign one attempt of a record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    pub fees: FeeParams,
}

impl UnsignedTransaction {
    /// Zero value transfer to self. Used to consume a nonce that would otherwise
    /// leave a gap in front of later transactions.
    pub fn noop(chain_id: u64, from: Address, nonce: u64, fees: FeeParams) -> Self {
        Self {
            chain_id,
            from,
            to: Some(from),
            value: U256::ZERO,
            data: Bytes::new(),
            nonce,
            gas_limit: 21_000,
            fees,
        }
    }
}

/// Block header data the indexer needs for cursor and reorg tracking.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub transactions: Vec<B256>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogInfo {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub log_index: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptInfo {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    /// `false` when execution reverted.
    pub status: bool,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub logs: Vec<LogInfo>,
}
