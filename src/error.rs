//! HTTP error type rendered as `{"error": "..."}`

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::media::MediaError;
use crate::queue::TaskError;
use crate::storage::StorageError;
use crate::whatsapp_api::GraphApiError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Authentication credentials were not provided or are invalid")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("Not found")]
    NotFound,

    #[error("WhatsApp API error: {0}")]
    BadGateway(String),

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            error!("Internal error: {}", detail);
        }
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        if e.is_constraint_violation() {
            ApiError::BadRequest(format!("Constraint violation: {}", e))
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::Storage(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<MediaError> for ApiError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::TooLarge { .. } => ApiError::BadRequest(e.to_string()),
            MediaError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<GraphApiError> for ApiError {
    fn from(e: GraphApiError) -> Self {
        ApiError::BadGateway(e.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_body() {
        let response = ApiError::bad_request("Passwords do not match").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"error": "Passwords do not match"})
        );
    }

    #[tokio::test]
    async fn test_internal_error_hides_detail() {
        let response = ApiError::Internal("disk on fire".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Internal server error");
    }

    #[test]
    fn test_conversions() {
        let too_large: ApiError = MediaError::TooLarge { size: 2, max: 1 }.into();
        assert_eq!(too_large.status(), StatusCode::BAD_REQUEST);

        let graph: ApiError = GraphApiError::Api {
            code: 190,
            message: "bad token".into(),
        }
        .into();
        assert_eq!(graph.status(), StatusCode::BAD_GATEWAY);

        let closed: ApiError = TaskError::QueueClosed.into();
        assert_eq!(closed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
