//! Error types and responses for the subscription server.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Path segment is not an identity.
    #[error("Invalid identity '{0}'")]
    InvalidIdentity(String),

    /// No enabled backend holds the identity.
    #[error("No subscription for {0}")]
    NotFound(Uuid),

    /// Response could not be assembled.
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<axum::http::Error> for SubscriptionError {
    fn from(err: axum::http::Error) -> Self {
        SubscriptionError::Http(err.to_string())
    }
}

impl SubscriptionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubscriptionError::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
            SubscriptionError::NotFound(_) => StatusCode::NOT_FOUND,
            SubscriptionError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            SubscriptionError::InvalidIdentity(_) => "invalid_identity",
            SubscriptionError::NotFound(_) => "not_found",
            SubscriptionError::Http(_) => "http_error",
        }
    }
}

impl IntoResponse for SubscriptionError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });

        let mut response = Response::new(Body::from(body.to_string()));
        *response.status_mut() = self.status_code();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        response
    }
}
