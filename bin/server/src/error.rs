//! Maps `CoreError` onto the HTTP status codes the API surface returns.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use session_core::CoreError;

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            CoreError::Agent(_) => StatusCode::BAD_GATEWAY,
            CoreError::Cancelled => StatusCode::CONFLICT,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::InvalidTransition(_) => StatusCode::CONFLICT,
        };

        let body = Json(json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
