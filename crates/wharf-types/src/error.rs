//! Categorized error type shared by every Wharf crate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable machine-readable error codes used on the wire and for retry
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Request payload failed domain validation.
    ValidationError,
    /// Request was malformed before validation could run.
    BadRequest,
    /// Referenced resource does not exist.
    ResourceNotFound,
    /// Request conflicts with current resource state.
    Conflict,
    /// Caller is not authenticated.
    Unauthorized,
    /// Caller is authenticated but not permitted.
    Forbidden,
    /// Unexpected server-side failure.
    InternalError,
    /// A dependency is unavailable; retry later.
    ServiceUnavailable,
    /// Operation exceeded its deadline.
    Timeout,
    /// Caller exceeded a rate limit.
    RateLimitExceeded,
}

/// Typed error carried through command handlers, activities and stores.
///
/// Command-level failures (`ValidationError`, `ResourceNotFound`, `Conflict`)
/// surface to the caller unchanged and are never retried; infrastructure
/// codes are wrapped at the boundary and retried per policy.
#[derive(Debug, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct WmsError {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details for diagnostics.
    pub details: BTreeMap<String, String>,
    /// Wrapped cause, when the failure originated below this layer.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl WmsError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: BTreeMap::new(),
            source: None,
        }
    }

    /// Domain validation failure. Not retryable.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Referenced aggregate or record is missing. Not retryable.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceNotFound, message)
    }

    /// State conflict, including idempotency-key body mismatches. Not
    /// retryable.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// An aggregate invariant would be violated. Surfaced as a conflict on
    /// the wire.
    pub fn invariant(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCode::Conflict, message);
        err.details
            .insert("category".to_owned(), "invariant_violation".to_owned());
        err
    }

    /// Unexpected internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// A downstream dependency is unavailable.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    /// Deadline exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Attach a structured detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Wrap an underlying cause.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Whether this is a command-level failure that must surface unchanged
    /// (no retry, no compensation).
    pub fn is_command_failure(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::ValidationError | ErrorCode::ResourceNotFound | ErrorCode::Conflict
        )
    }
}

/// Standard wire error body returned by service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub details: BTreeMap<String, String>,
    /// Server-assigned request identifier.
    pub request_id: String,
    /// When the error was produced.
    pub timestamp: DateTime<Utc>,
    /// Request path that failed.
    pub path: String,
}

impl ErrorBody {
    /// Build a wire body from a typed error.
    pub fn from_error(err: &WmsError, request_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            details: err.details.clone(),
            request_id: request_id.into(),
            timestamp: Utc::now(),
            path: path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failures_are_flagged() {
        assert!(WmsError::validation("bad sku").is_command_failure());
        assert!(WmsError::not_found("no such order").is_command_failure());
        assert!(WmsError::conflict("already finalized").is_command_failure());
        assert!(!WmsError::unavailable("bus down").is_command_failure());
        assert!(!WmsError::timeout("deadline exceeded").is_command_failure());
    }

    #[test]
    fn invariant_violation_is_conflict_with_category() {
        let err = WmsError::invariant("wave over capacity");
        assert_eq!(err.code, ErrorCode::Conflict);
        assert_eq!(
            err.details.get("category").map(String::as_str),
            Some("invariant_violation")
        );
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::ValidationError).unwrap(),
            "\"VALIDATION_ERROR\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::RateLimitExceeded).unwrap(),
            "\"RATE_LIMIT_EXCEEDED\""
        );
    }

    #[test]
    fn error_body_carries_request_metadata() {
        let err = WmsError::validation("quantity must be positive")
            .with_detail("field", "quantity");
        let body = ErrorBody::from_error(&err, "req-1", "/orders");
        assert_eq!(body.code, ErrorCode::ValidationError);
        assert_eq!(body.request_id, "req-1");
        assert_eq!(body.path, "/orders");
        assert_eq!(body.details.get("field").map(String::as_str), Some("quantity"));
    }
}
