use serde::Serialize;
use strum::{Display, EnumString};

use crate::pipeline::PipelineError;
use crate::services::fetch::FetchError;
use crate::services::storage::StorageError;
use crate::services::transform::TransformError;

/// Closed error taxonomy carried on `image.failed` events. New backend
/// faults get a variant here, never an ad-hoc string downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProcessingTimeout,
    GeminiApiError,
    CloudinaryError,
    ImageDownloadError,
    TimeoutError,
    RateLimitError,
    UnknownError,
}

/// Whether a fault is worth another delivery attempt, and its stable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub code: ErrorCode,
}

impl Classification {
    const fn retryable(code: ErrorCode) -> Self {
        Self {
            retryable: true,
            code,
        }
    }

    const fn terminal(code: ErrorCode) -> Self {
        Self {
            retryable: false,
            code,
        }
    }
}

/// Map any pipeline fault to its retry decision. Rules apply in order;
/// the first match wins:
///
/// 1. pipeline deadline → terminal `PROCESSING_TIMEOUT` (worker protection)
/// 2. transient network fault → retryable `TIMEOUT_ERROR`
/// 3. rate-limit pushback → retryable `RATE_LIMIT_ERROR`
/// 4. backend-side timeout marker → retryable, stage code
/// 5. anything else → terminal, stage code (`UNKNOWN_ERROR` without a stage)
pub fn classify(error: &PipelineError) -> Classification {
    match error {
        PipelineError::DeadlineExceeded => Classification::terminal(ErrorCode::ProcessingTimeout),
        PipelineError::Fetch(e) => classify_fetch(e),
        PipelineError::Transform(e) => classify_transform(e),
        PipelineError::Store(e) => classify_store(e),
    }
}

fn classify_fetch(error: &FetchError) -> Classification {
    if error.is_transient_network() {
        Classification::retryable(ErrorCode::TimeoutError)
    } else if error.is_rate_limited() {
        Classification::retryable(ErrorCode::RateLimitError)
    } else {
        Classification::terminal(ErrorCode::ImageDownloadError)
    }
}

/// Also drives the inner transform retry loop, which only re-attempts
/// retryable faults.
pub fn classify_transform(error: &TransformError) -> Classification {
    if error.is_transient_network() {
        Classification::retryable(ErrorCode::TimeoutError)
    } else if error.is_rate_limited() {
        Classification::retryable(ErrorCode::RateLimitError)
    } else if error.is_backend_timeout() {
        Classification::retryable(ErrorCode::GeminiApiError)
    } else {
        Classification::terminal(ErrorCode::GeminiApiError)
    }
}

fn classify_store(error: &StorageError) -> Classification {
    if error.is_transient_network() {
        Classification::retryable(ErrorCode::TimeoutError)
    } else if error.is_rate_limited() {
        Classification::retryable(ErrorCode::RateLimitError)
    } else if error.is_backend_timeout() {
        Classification::retryable(ErrorCode::CloudinaryError)
    } else {
        Classification::terminal(ErrorCode::CloudinaryError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform_api(status: u16, message: &str) -> PipelineError {
        PipelineError::Transform(TransformError::Api {
            status,
            message: message.to_string(),
        })
    }

    #[test]
    fn deadline_is_terminal_processing_timeout() {
        let classification = classify(&PipelineError::DeadlineExceeded);
        assert!(!classification.retryable);
        assert_eq!(classification.code, ErrorCode::ProcessingTimeout);
    }

    #[test]
    fn rate_limit_is_retryable() {
        let classification = classify(&transform_api(429, "quota"));
        assert!(classification.retryable);
        assert_eq!(classification.code, ErrorCode::RateLimitError);

        let by_marker = classify(&transform_api(400, "RESOURCE_EXHAUSTED"));
        assert!(by_marker.retryable);
        assert_eq!(by_marker.code, ErrorCode::RateLimitError);
    }

    #[test]
    fn backend_timeout_is_retryable_with_stage_code() {
        let gemini = classify(&transform_api(504, "GEMINI_TIMEOUT"));
        assert!(gemini.retryable);
        assert_eq!(gemini.code, ErrorCode::GeminiApiError);

        let cloudinary = classify(&PipelineError::Store(StorageError::Api {
            status: 504,
            message: "CLOUDINARY_TIMEOUT".to_string(),
        }));
        assert!(cloudinary.retryable);
        assert_eq!(cloudinary.code, ErrorCode::CloudinaryError);
    }

    #[test]
    fn unknown_backend_fault_is_terminal() {
        let classification = classify(&transform_api(500, "internal"));
        assert!(!classification.retryable);
        assert_eq!(classification.code, ErrorCode::GeminiApiError);

        let store = classify(&PipelineError::Store(StorageError::Api {
            status: 400,
            message: "invalid signature".to_string(),
        }));
        assert!(!store.retryable);
        assert_eq!(store.code, ErrorCode::CloudinaryError);
    }

    #[test]
    fn fetch_status_fault_is_terminal_download_error() {
        let classification = classify(&PipelineError::Fetch(FetchError::Status(
            reqwest::StatusCode::NOT_FOUND,
        )));
        assert!(!classification.retryable);
        assert_eq!(classification.code, ErrorCode::ImageDownloadError);
    }

    #[test]
    fn classification_is_idempotent() {
        let error = transform_api(429, "rate limit");
        assert_eq!(classify(&error), classify(&error));
    }

    #[test]
    fn codes_render_their_wire_names() {
        assert_eq!(ErrorCode::ProcessingTimeout.to_string(), "PROCESSING_TIMEOUT");
        assert_eq!(ErrorCode::GeminiApiError.to_string(), "GEMINI_API_ERROR");
        assert_eq!(ErrorCode::RateLimitError.to_string(), "RATE_LIMIT_ERROR");
        assert_eq!(ErrorCode::UnknownError.to_string(), "UNKNOWN_ERROR");

        let json = serde_json::to_string(&ErrorCode::CloudinaryError).unwrap();
        assert_eq!(json, "\"CLOUDINARY_ERROR\"");
    }
}
