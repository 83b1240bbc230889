// Transaction Operations

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use engine_executors::{
    engine::{EnqueueRequest, EnqueueResult},
    store::TransactionStore,
};

use crate::http::{
    error::{ApiEngineError, EngineResult},
    server::EngineServerState,
    types::SuccessResponse,
};

/// Enqueue Transaction
///
/// Validate and queue a prepared call. A repeated idempotency key returns the
/// existing transaction with `duplicate: true` and `200` instead of `202`.
pub async fn enqueue_transaction<S: TransactionStore>(
    State(state): State<EngineServerState<S>>,
    Json(request): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiEngineError> {
    tracing::info!(
        chain_id = request.call.chain_id,
        from = %request.call.from,
        "Processing enqueue request"
    );

    let result: EnqueueResult = state.engine.enqueue(request).await.api_error()?;
    let status = if result.duplicate {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };

    Ok((status, Json(SuccessResponse::new(result))))
}

/// Get Transaction
pub async fn get_transaction<S: TransactionStore>(
    State(state): State<EngineServerState<S>>,
    Path(transaction_id): Path<String>,
) -> Result<impl IntoResponse, ApiEngineError> {
    let view = state.engine.get_status(&transaction_id).await.api_error()?;
    Ok((StatusCode::OK, Json(SuccessResponse::new(view))))
}

/// Cancel Transaction
///
/// Only a queued transaction that no worker has picked up can be cancelled.
/// Anything later answers `409`.
pub async fn cancel_transaction<S: TransactionStore>(
    State(state): State<EngineServerState<S>>,
    Path(transaction_id): Path<String>,
) -> Result<impl IntoResponse, ApiEngineError> {
    tracing::info!(
        transaction_id = %transaction_id,
        "Processing transaction cancellation request"
    );

    let view = state.engine.cancel(&transaction_id).await.api_error()?;
    Ok((StatusCode::OK, Json(SuccessResponse::new(view))))
}
