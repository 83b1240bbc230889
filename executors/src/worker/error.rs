use engine_core::error::{EngineError, RpcErrorKind};
use serde::{Deserialize, Serialize};

use crate::{nonce_manager::NonceManagerError, store::StoreError};

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum WorkerError {
    #[error("Chain service error for chainId {chain_id}: {message}")]
    ChainServiceError { chain_id: u64, message: String },

    #[error("Store error: {message}")]
    StoreError {
        message: String,
        inner_error: StoreError,
    },

    #[error("RPC error encountered during generic operation: {message}")]
    RpcError {
        message: String,
        inner_error: EngineError,
    },

    #[error("Transaction signing failed: {message}")]
    SigningError {
        message: String,
        inner_error: EngineError,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl WorkerError {
    pub fn rpc(inner_error: EngineError) -> Self {
        WorkerError::RpcError {
            message: inner_error.to_string(),
            inner_error,
        }
    }
}

impl From<StoreError> for WorkerError {
    fn from(error: StoreError) -> Self {
        WorkerError::StoreError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl From<NonceManagerError> for WorkerError {
    fn from(error: NonceManagerError) -> Self {
        WorkerError::InternalError {
            message: error.to_string(),
        }
    }
}

impl From<WorkerError> for EngineError {
    fn from(error: WorkerError) -> Self {
        match error {
            WorkerError::RpcError { inner_error, .. }
            | WorkerError::SigningError { inner_error, .. } => inner_error,
            other => EngineError::InternalError {
                message: other.to_string(),
            },
        }
    }
}

// ========== SEND ERROR CLASSIFICATION ==========
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorClassification {
    /// "nonce too low", "already known" etc. The payload, or one with the same
    /// nonce, is already with the node.
    PossiblySent,
    /// Invalid signature, malformed tx, insufficient funds etc. The node
    /// rejected it and the nonce was not consumed.
    DeterministicFailure,
    /// Transport failure, timeout or an error we do not recognise. The payload
    /// may or may not have reached the node.
    Ambiguous,
}

impl SendErrorClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendErrorClassification::PossiblySent => "possibly_sent",
            SendErrorClassification::DeterministicFailure => "deterministic",
            SendErrorClassification::Ambiguous => "ambiguous",
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SendContext {
    Rebroadcast,
    InitialBroadcast,
}

#[tracing::instrument(skip_all, fields(error = %error, context = ?context))]
pub fn classify_send_error(error: &EngineError, context: SendContext) -> SendErrorClassification {
    let message = match error.rpc_kind() {
        Some(kind @ RpcErrorKind::ErrorResp(_)) => kind.node_message().unwrap_or_default(),
        Some(_) => return SendErrorClassification::Ambiguous,
        None => return SendErrorClassification::DeterministicFailure,
    };

    if message.contains("invalid signature")
        || message.contains("malformed")
        || message.contains("invalid transaction format")
        || message.contains("insufficient funds")
        || message.contains("nonce too high")
        || message.contains("intrinsic gas too low")
        || message.contains("exceeds block gas limit")
        || message.contains("gas limit reached")
        || message.contains("oversized")
        || message.contains("invalid chain id")
        || message.contains("transaction execution error: user cant pay the bills")
    {
        return SendErrorClassification::DeterministicFailure;
    }

    // a replacement the node refused leaves the previous attempt in place
    if message.contains("replacement transaction underpriced") {
        return match context {
            SendContext::InitialBroadcast => SendErrorClassification::PossiblySent,
            SendContext::Rebroadcast => SendErrorClassification::DeterministicFailure,
        };
    }

    if message.contains("nonce too low")
        || message.contains("already known")
        || message.contains("transaction already imported")
        || message.contains("known transaction")
    {
        return SendErrorClassification::PossiblySent;
    }

    tracing::warn!(
        "Unknown send error: {}. PLEASE REPORT FOR ADDING CORRECT CLASSIFICATION [NOTIFY]",
        message
    );

    SendErrorClassification::Ambiguous
}

/// Whether a gas estimation failure means the call itself can never succeed.
pub fn is_execution_failure(error: &EngineError) -> bool {
    match error.rpc_kind() {
        Some(RpcErrorKind::ErrorResp(resp)) => {
            let message = resp.message.to_lowercase();
            message.contains("execution reverted")
                || message.contains("revert")
                || message.contains("invalid opcode")
                || message.contains("insufficient funds")
                || resp.code == 3
        }
        _ => false,
    }
}
