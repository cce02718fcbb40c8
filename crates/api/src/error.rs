//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use engine::EngineError;
use store::StoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Engine error carrying the domain taxonomy.
    Engine(EngineError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(msg) => {
                plain(StatusCode::NOT_FOUND, msg)
            }
            ApiError::BadRequest(msg) => plain(StatusCode::BAD_REQUEST, msg),
            ApiError::Engine(err) => engine_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                plain(StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        }
    }
}

fn plain(status: StatusCode, message: String) -> Response {
    let body = serde_json::json!({ "error": message });
    (status, axum::Json(body)).into_response()
}

fn engine_error_to_response(err: EngineError) -> Response {
    match &err {
        // The buyer sees the true available count inline at the cart.
        EngineError::InsufficientStock { available, .. } => {
            let body = serde_json::json!({ "error": err.to_string(), "available": available });
            (StatusCode::CONFLICT, axum::Json(body)).into_response()
        }
        EngineError::InvalidCoupon(reason) => {
            let body = serde_json::json!({ "error": err.to_string(), "reason": reason });
            (StatusCode::UNPROCESSABLE_ENTITY, axum::Json(body)).into_response()
        }
        EngineError::Domain(_) | EngineError::NothingReturnable(_) => {
            plain(StatusCode::CONFLICT, err.to_string())
        }
        EngineError::EmptyCart(_) | EngineError::InvalidWebhook(_) => {
            plain(StatusCode::BAD_REQUEST, err.to_string())
        }
        EngineError::Gateway { .. } => plain(StatusCode::BAD_GATEWAY, err.to_string()),
        EngineError::NotFound { .. } => plain(StatusCode::NOT_FOUND, err.to_string()),
        EngineError::Store(StoreError::IllegalState { .. }) => {
            plain(StatusCode::CONFLICT, err.to_string())
        }
        EngineError::Store(_) | EngineError::Serialization(_) => {
            tracing::error!(error = %err, "store failure");
            plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}
