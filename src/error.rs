use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;
use thiserror::Error;

use crate::metrics::REQUEST_ERRORS;

// Longest upstream body / detail kept in errors and logs
pub const MAX_DETAIL_CHARS: usize = 500;

const GENERIC_MESSAGE: &str = "internal server error, please try again later";
const UPSTREAM_AUTH_MESSAGE: &str =
    "upstream API configuration error, please contact the administrator";

pub type Result<T> = std::result::Result<T, GatewayError>;

// Every failure the gateway can produce.
//
// Client input problems map to 400 with their own message. Everything else maps to 500
// with a generic message; the detail only goes to the log.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no image file provided")]
    MissingImage,

    #[error(
        "unsupported file format: {extension:?}, supported formats: jpg, jpeg, png, gif, bmp, webp"
    )]
    UnsupportedFormat { extension: String },

    #[error("file size {size} bytes exceeds the limit of {max} bytes")]
    ImageTooLarge { size: usize, max: usize },

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("malformed upload: {0}")]
    MalformedUpload(String),

    #[error("upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream request failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("request exceeded its {0:?} time budget")]
    RequestTimeout(Duration),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingImage
            | Self::UnsupportedFormat { .. }
            | Self::ImageTooLarge { .. }
            | Self::InvalidImage(_)
            | Self::MalformedUpload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    // Message safe to hand back to the caller.
    pub fn public_message(&self) -> String {
        match self {
            _ if self.is_client_error() => self.to_string(),
            Self::Upstream { status: 401 | 403, .. } => UPSTREAM_AUTH_MESSAGE.to_string(),
            _ => GENERIC_MESSAGE.to_string(),
        }
    }
}

// cut on a char boundary so multi-byte text never panics
pub fn truncate_detail(text: &str) -> String {
    match text.char_indices().nth(MAX_DETAIL_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_client_error() {
            tracing::warn!(error = %self, "request rejected");
        } else {
            let detail = truncate_detail(&self.to_string());
            tracing::debug!(error = %detail, "answering with generic error");
        }
        REQUEST_ERRORS
            .with_label_values(&[if status.is_client_error() { "4xx" } else { "5xx" }])
            .inc();

        (status, Json(serde_json::json!({ "error": self.public_message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_bad_requests_with_their_message() {
        let err = GatewayError::ImageTooLarge { size: 20, max: 10 };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.public_message().contains("exceeds"));
        assert_eq!(GatewayError::MissingImage.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn internal_errors_hide_their_detail() {
        let err = GatewayError::Upstream { status: 404, body: "secret upstream detail".into() };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.public_message().contains("secret"));

        let err = GatewayError::ExhaustedRetries {
            attempts: 3,
            last_error: "connection reset".into(),
        };
        assert_eq!(err.public_message(), GENERIC_MESSAGE);
    }

    #[test]
    fn upstream_auth_failures_get_a_distinct_message() {
        let err = GatewayError::Upstream { status: 401, body: "bad key".into() };
        assert_eq!(err.public_message(), UPSTREAM_AUTH_MESSAGE);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "异".repeat(MAX_DETAIL_CHARS + 10);
        let cut = truncate_detail(&long);
        assert_eq!(cut.chars().count(), MAX_DETAIL_CHARS + 3);
        assert_eq!(truncate_detail("short"), "short");
    }
}
