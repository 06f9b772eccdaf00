//! Error taxonomy and classification.

use wharf_types::{ErrorCode, WmsError};

use crate::breaker::CircuitOpenError;

/// Category an error falls into for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Typed domain validation failure.
    Validation,
    /// Typed missing-resource failure.
    NotFound,
    /// Typed state conflict.
    Conflict,
    /// Deadline exceeded somewhere below.
    Timeout,
    /// Transport-level failure.
    Connection,
    /// A circuit breaker rejected the call.
    CircuitOpen,
    /// Anything unrecognized.
    Unknown,
}

impl ErrorCategory {
    /// Whether errors of this category are worth retrying at all. Circuit
    /// rejections are retryable once the breaker's cool-down lapses.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorCategory::Validation | ErrorCategory::NotFound | ErrorCategory::Conflict
        )
    }
}

/// Classify an error for retry decisions.
///
/// Typed errors win over string sniffing: a [`WmsError`] code or a
/// [`CircuitOpenError`] anywhere in the chain decides the category outright.
/// Only unrecognized errors fall through to substring detection, and the
/// default is `Unknown` (retryable).
pub fn classify(err: &anyhow::Error) -> ErrorCategory {
    for cause in err.chain() {
        if cause.downcast_ref::<CircuitOpenError>().is_some() {
            return ErrorCategory::CircuitOpen;
        }
        if let Some(wms) = cause.downcast_ref::<WmsError>() {
            return match wms.code {
                ErrorCode::ValidationError | ErrorCode::BadRequest => ErrorCategory::Validation,
                ErrorCode::ResourceNotFound => ErrorCategory::NotFound,
                ErrorCode::Conflict => ErrorCategory::Conflict,
                ErrorCode::Timeout => ErrorCategory::Timeout,
                ErrorCode::ServiceUnavailable => ErrorCategory::Connection,
                _ => ErrorCategory::Unknown,
            };
        }
    }

    let text = format!("{err:#}").to_lowercase();
    if text.contains("deadline") || text.contains("timed out") || text.contains("timeout") {
        return ErrorCategory::Timeout;
    }
    if text.contains("refused")
        || text.contains("broken pipe")
        || text.contains("connection reset")
        || text.contains("unexpected eof")
        || text.contains("eof")
    {
        return ErrorCategory::Connection;
    }
    ErrorCategory::Unknown
}
