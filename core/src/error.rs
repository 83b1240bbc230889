use alloy::{
    primitives::Address,
    transports::{RpcError as AlloyRpcError, TransportErrorKind},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Chain;

#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// Server returned an error response.
    #[error("server returned an error response: {0}")]
    ErrorResp(RpcErrorResponse),

    /// Server returned a null response when a non-null response was expected.
    #[error("server returned a null response when a non-null response was expected")]
    NullResp,

    /// Rpc server returned an unsupported feature.
    #[error("unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    /// Returned when a local pre-processing step fails.
    #[error("local usage error: {message}")]
    InternalError { message: String },

    /// JSON serialization error.
    #[error("serialization error: {message}")]
    SerError { message: String },

    /// JSON deserialization error.
    #[error("deserialization error: {message}, text: {text}")]
    DeserError { message: String, text: String },

    #[error("HTTP error {status}")]
    TransportHttpError { status: u16, body: String },

    /// The call did not complete within the configured RPC timeout.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Other transport error: {message}")]
    OtherTransportError { message: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RpcErrorResponse {
    /// The error code.
    pub code: i64,
    /// The error message (if any).
    pub message: String,
    /// The error data (if any).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl std::fmt::Display for RpcErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error code {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, ", data: {data}")?;
        }
        Ok(())
    }
}

impl RpcErrorKind {
    /// Whether the node itself answered. Anything else means the request may
    /// or may not have reached it.
    pub fn is_error_resp(&self) -> bool {
        matches!(self, RpcErrorKind::ErrorResp(_))
    }

    /// Error message as reported by the node, lowercased for matching.
    pub fn node_message(&self) -> Option<String> {
        match self {
            RpcErrorKind::ErrorResp(resp) => Some(resp.message.to_lowercase()),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RpcErrorKind::TransportHttpError { status, .. } if *status >= 400 && *status < 500 => {
                *status == 429 || *status == 408
            }
            RpcErrorKind::UnsupportedFeature { .. } => false,
            RpcErrorKind::ErrorResp(resp) => {
                let message = resp.message.to_lowercase();
                !(message.contains("invalid chain")
                    || message.contains("invalid opcode")
                    || message.contains("execution reverted"))
            }
            _ => true,
        }
    }
}

#[derive(Error, Debug, Serialize, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum EngineError {
    #[error("RPC error on chain {chain_id} at {rpc_url}: {message}")]
    RpcError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Error in RPC configuration: {message}")]
    RpcConfigError { message: String },

    /// The signing backend could not be reached. Callers treat this as transient.
    #[error("Signer unavailable for {from}: {message}")]
    SignerUnavailable { from: Address, message: String },

    #[error("Signing failed: {message}")]
    SigningError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::ValidationError {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::InternalError {
            message: message.into(),
        }
    }

    pub fn rpc_kind(&self) -> Option<&RpcErrorKind> {
        match self {
            EngineError::RpcError { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Errors worth retrying later without changing the request.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::RpcError { kind, .. } => kind.is_retryable(),
            EngineError::SignerUnavailable { .. } => true,
            EngineError::RpcConfigError { .. }
            | EngineError::SigningError { .. }
            | EngineError::ValidationError { .. }
            | EngineError::InternalError { .. } => false,
        }
    }
}

pub trait AlloyRpcErrorToEngineError {
    fn to_engine_error(&self, chain: &impl Chain) -> EngineError;
}

fn to_engine_rpc_error_kind(err: &AlloyRpcError<TransportErrorKind>) -> RpcErrorKind {
    match err {
        AlloyRpcError::ErrorResp(err) => RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: err.code,
            message: err.message.to_string(),
            data: err.data.as_ref().map(|data| data.to_string()),
        }),
        AlloyRpcError::NullResp => RpcErrorKind::NullResp,
        AlloyRpcError::UnsupportedFeature(feature) => RpcErrorKind::UnsupportedFeature {
            message: feature.to_string(),
        },
        AlloyRpcError::LocalUsageError(err) => RpcErrorKind::InternalError {
            message: err.to_string(),
        },
        AlloyRpcError::SerError(err) => RpcErrorKind::SerError {
            message: err.to_string(),
        },
        AlloyRpcError::DeserError { err, text } => RpcErrorKind::DeserError {
            message: err.to_string(),
            text: text.to_string(),
        },
        AlloyRpcError::Transport(err) => match err {
            TransportErrorKind::HttpError(err) => RpcErrorKind::TransportHttpError {
                status: err.status,
                body: err.body.to_string(),
            },
            _ => RpcErrorKind::OtherTransportError {
                message: err.to_string(),
            },
        },
    }
}

impl AlloyRpcErrorToEngineError for AlloyRpcError<TransportErrorKind> {
    fn to_engine_error(&self, chain: &impl Chain) -> EngineError {
        EngineError::RpcError {
            chain_id: chain.chain_id(),
            rpc_url: chain.rpc_url().to_string(),
            message: self.to_string(),
            kind: to_engine_rpc_error_kind(self),
        }
    }
}
