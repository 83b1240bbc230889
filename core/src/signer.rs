use std::{collections::HashMap, future::Future, str::FromStr};

use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy},
    eips::eip2718::Encodable2718,
    network::TxSignerSync,
    primitives::{Address, Bytes, TxKind},
    signers::local::PrivateKeySigner,
};

use crate::{
    error::EngineError,
    transaction::{FeeParams, UnsignedTransaction},
};

/// Produces raw signed bytes for a sender. Key custody lives behind this trait.
pub trait TransactionSigner: Send + Sync + 'static {
    /// Whether this signer can sign for `from`. Checked at enqueue time.
    fn manages(&self, from: Address) -> bool;

    /// Sign `tx` for `from` on `chain_id`.
    ///
    /// Returns [`EngineError::SignerUnavailable`] when the backend cannot be
    /// reached; callers retry those later.
    fn sign(
        &self,
        chain_id: u64,
        from: Address,
        tx: &UnsignedTransaction,
    ) -> impl Future<Output = Result<Bytes, EngineError>> + Send;
}

fn tx_kind(to: Option<Address>) -> TxKind {
    to.map(TxKind::Call).unwrap_or(TxKind::Create)
}

/// Signer backed by in-process private keys.
#[derive(Clone, Default)]
pub struct LocalSigner {
    keys: HashMap<Address, PrivateKeySigner>,
}

impl LocalSigner {
    pub fn from_private_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self, EngineError> {
        let mut signers = HashMap::with_capacity(keys.len());
        for key in keys {
            let signer = PrivateKeySigner::from_str(key.as_ref().trim()).map_err(|e| {
                EngineError::SigningError {
                    message: format!("Invalid private key: {e}"),
                }
            })?;
            signers.insert(signer.address(), signer);
        }
        Ok(Self { keys: signers })
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.keys.keys().copied().collect()
    }

    fn sign_raw(
        &self,
        chain_id: u64,
        from: Address,
        tx: &UnsignedTransaction,
    ) -> Result<Bytes, EngineError> {
        let signer = self.keys.get(&from).ok_or_else(|| EngineError::SigningError {
            message: format!("No key configured for {from}"),
        })?;

        if tx.chain_id != chain_id || tx.from != from {
            return Err(EngineError::SigningError {
                message: format!(
                    "Transaction for {} on chain {} cannot be signed as {} on chain {}",
                    tx.from, tx.chain_id, from, chain_id
                ),
            });
        }

        let signing_error = |e: alloy::signers::Error| EngineError::SigningError {
            message: e.to_string(),
        };

        let envelope: TxEnvelope = match tx.fees {
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut inner = TxEip1559 {
                    chain_id,
                    nonce: tx.nonce,
                    gas_limit: tx.gas_limit,
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                    to: tx_kind(tx.to),
                    value: tx.value,
                    access_list: Default::default(),
                    input: tx.data.clone(),
                };
                let signature = signer
                    .sign_transaction_sync(&mut inner)
                    .map_err(signing_error)?;
                inner.into_signed(signature).into()
            }
            FeeParams::Legacy { gas_price } => {
                let mut inner = TxLegacy {
                    chain_id: Some(chain_id),
                    nonce: tx.nonce,
                    gas_price,
                    gas_limit: tx.gas_limit,
                    to: tx_kind(tx.to),
                    value: tx.value,
                    input: tx.data.clone(),
                };
                let signature = signer
                    .sign_transaction_sync(&mut inner)
                    .map_err(signing_error)?;
                inner.into_signed(signature).into()
            }
        };

        Ok(envelope.encoded_2718().into())
    }
}

impl TransactionSigner for LocalSigner {
    fn manages(&self, from: Address) -> bool {
        self.keys.contains_key(&from)
    }

    async fn sign(
        &self,
        chain_id: u64,
        from: Address,
        tx: &UnsignedTransaction,
    ) -> Result<Bytes, EngineError> {
        self.sign_raw(chain_id, from, tx)
    }
}
