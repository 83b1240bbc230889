use axum::{Json, http::StatusCode, response::IntoResponse};
use engine_executors::engine::EngineApiError;
use serde_json::json;

/// Facade error carried to an HTTP response.
pub struct ApiEngineError(pub EngineApiError);

impl From<EngineApiError> for ApiEngineError {
    fn from(error: EngineApiError) -> Self {
        ApiEngineError(error)
    }
}

impl IntoResponse for ApiEngineError {
    fn into_response(self) -> axum::response::Response {
        let code = self.status_code();

        if code.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        self.with_status(code)
    }
}

impl ApiEngineError {
    fn with_status(self, status: StatusCode) -> axum::response::Response {
        (
            status,
            Json(json!({
                "error": {
                    "message": self.0.to_string(),
                    "details": self.0
                }
            })),
        )
            .into_response()
    }

    fn status_code(&self) -> StatusCode {
        match &self.0 {
            EngineApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            EngineApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineApiError::InvalidTransition { .. } => StatusCode::CONFLICT,
            EngineApiError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub trait EngineResult<T> {
    fn api_error(self) -> Result<T, ApiEngineError>;
}

impl<T, E: Into<EngineApiError>> EngineResult<T> for Result<T, E> {
    fn api_error(self) -> Result<T, ApiEngineError> {
        self.map_err(|e| ApiEngineError(e.into()))
    }
}
