use axum::{extract::State, http::StatusCode, response::Json};
use engine_executors::{indexer::IndexerProgress, store::TransactionStore};
use serde::Serialize;

use crate::http::{server::EngineServerState, types::SuccessResponse};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerStatus {
    pub chain_id: u64,
    pub progress: IndexerProgress,
}

/// Progress of every running chain indexer, by chain id.
pub async fn list_indexers<S: TransactionStore>(
    State(state): State<EngineServerState<S>>,
) -> (StatusCode, Json<SuccessResponse<Vec<IndexerStatus>>>) {
    let registry = state.engine.registry();
    let mut indexers = Vec::new();

    for chain_id in registry.running_chains().await {
        if let Some(progress) = registry.progress(chain_id).await {
            indexers.push(IndexerStatus { chain_id, progress });
        }
    }

    (StatusCode::OK, Json(SuccessResponse::new(indexers)))
}
