use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::{as_hub_error, HubError};

/// Handler short-circuit: a status plus the `{"error": "..."}` body every
/// JSON endpoint renders on failure.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthenticated() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "please login")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "you don't have permission")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Maps a failure from the storage/session/metadata layers, preserving
    /// the typed kinds and logging everything else as internal.
    pub fn from_backend(context: &str, err: anyhow::Error) -> Self {
        match as_hub_error(&err) {
            Some(HubError::NotFound(what)) => Self::not_found(format!("{what} not found")),
            Some(HubError::InvalidDigest { .. }) => Self::bad_request(err.to_string()),
            Some(HubError::Conflict) => Self::conflict(err.to_string()),
            Some(HubError::Unauthenticated) => Self::unauthenticated(),
            Some(HubError::Forbidden) => Self::forbidden(),
            _ => {
                tracing::error!(context, error = ?err, "request failed");
                Self::internal("internal error, please try again")
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message }).to_string();
        (self.status, [("Content-Type", "application/json")], body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_mapping_preserves_typed_kinds() {
        let err = ApiError::from_backend(
            "get",
            anyhow::Error::new(HubError::NotFound("alice/img:v1".into())),
        );
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = ApiError::from_backend(
            "put",
            anyhow::Error::new(HubError::digest_mismatch("aa", "bb")),
        );
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.message().contains("invalid digest"));

        let err = ApiError::from_backend("merge", anyhow::anyhow!("disk on fire"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message().contains("disk"));
    }
}
