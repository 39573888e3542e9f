use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::policy::ThresholdPreset;

/// Which limit an oversize image ran into.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitExceeded {
    #[error("Image too large: {size} bytes (max: {max} bytes)")]
    Bytes { size: usize, max: usize },
    #[error("Image dimensions too large: {width}x{height} (max: {max}x{max})")]
    Dimensions { width: u32, height: u32, max: u32 },
    #[error("Upload exceeds the request body limit of {max} bytes")]
    Upload { max: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ModerationError {
    #[error("Invalid threshold {0:?}. Must be one of: {presets}", presets = ThresholdPreset::names().join(", "))]
    InvalidThreshold(String),
    #[error("Invalid image file: {0}")]
    InvalidImage(String),
    #[error(transparent)]
    TooLarge(#[from] LimitExceeded),
    #[error("URL not allowed: {0}")]
    InvalidUrl(String),
    #[error("Invalid content type: {0:?}")]
    InvalidContentType(String),
    #[error("Image download timeout")]
    FetchTimeout,
    #[error("Failed to download image: {0}")]
    FetchFailed(String),
    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ModerationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ModerationError::InvalidThreshold(_)
            | ModerationError::InvalidImage(_)
            | ModerationError::InvalidUrl(_)
            | ModerationError::InvalidContentType(_)
            | ModerationError::FetchFailed(_) => StatusCode::BAD_REQUEST,
            ModerationError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ModerationError::FetchTimeout => StatusCode::REQUEST_TIMEOUT,
            ModerationError::ClassifierUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ModerationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Internal failures never expose their cause.
    pub fn detail(&self) -> String {
        match self {
            ModerationError::Internal(_) => "Moderation error".to_string(),
            ModerationError::ClassifierUnavailable(_) => "Classifier unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ModerationError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "detail": self.detail() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        let too_large = ModerationError::from(LimitExceeded::Dimensions {
            width: 5000,
            height: 10,
            max: 4096,
        });
        assert_eq!(too_large.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            ModerationError::FetchTimeout.status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ModerationError::InvalidUrl("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn internal_detail_is_generic() {
        let err = ModerationError::Internal("onnx session exploded at /opt/model".into());
        assert_eq!(err.detail(), "Moderation error");
        assert!(err.to_string().contains("onnx session exploded"));
    }

    #[test]
    fn invalid_threshold_lists_presets() {
        let detail = ModerationError::InvalidThreshold("ultra".into()).detail();
        assert!(detail.contains("strict, balanced, permissive"));
        assert!(detail.contains("ultra"));
    }
}
