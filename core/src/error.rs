//! Structured error types for the messaging engine
//!
//! One variant per failure mode, each carrying the context a caller needs to
//! decide how to respond: surface to a transport, retry the job, or
//! escalate. Maps onto the HTTP-shaped error table the public API surfaces.

use thiserror::Error;

/// Primary error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad input from a caller. Maps to 400.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// No such intent, rule, or contact. Maps to 404.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Operation conflicts with the current state of a record (e.g.
    /// cancelling an already-sent intent). Maps to 409.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Rate limiter denied the send. Maps to 429; carries enough to build a
    /// capacity-remaining response.
    #[error("daily message cap reached ({sent_today}/{daily_cap})")]
    DailyCapReached { sent_today: u32, daily_cap: u32 },

    /// Chat client reported a transient failure (socket reset, timeout,
    /// upstream 5xx). Retried by the Job Runtime with backoff.
    #[error("transient provider error: {message}")]
    ProviderTransient { message: String },

    /// Chat client reported a non-retryable failure (recipient blocked the
    /// account, message rejected as policy violation). Job goes straight to
    /// `failed`.
    #[error("fatal provider error: {message}")]
    ProviderFatal { message: String },

    /// Vault ciphertext failed authentication, or a stored record failed an
    /// internal consistency check.
    #[error("integrity error: {message}")]
    Integrity { message: String },

    /// A recipient reference did not resolve via the contact store.
    #[error("contact not found: {reference}")]
    ContactNotFound { reference: String },

    /// Underlying persistence failure.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Config failed validation at load time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Anything else, logged and surfaced as 500.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the Job Runtime should retry the job that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderTransient { .. })
    }
}

/// Convenience extension for turning `Option`s into the right not-found
/// variant without a `match` at every call site.
pub trait OptionExt<T> {
    fn ok_or_not_found(self, what: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, what: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| EngineError::not_found(what))
    }
}

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_transient_is_retryable() {
        let err = EngineError::ProviderTransient { message: "socket closed".into() };
        assert!(err.is_retryable());
    }

    #[test]
    fn provider_fatal_is_not_retryable() {
        let err = EngineError::ProviderFatal { message: "recipient blocked".into() };
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = EngineError::validation("missing recipient");
        assert!(!err.is_retryable());
    }

    #[test]
    fn daily_cap_reached_message_includes_counts() {
        let err = EngineError::DailyCapReached { sent_today: 30, daily_cap: 30 };
        assert_eq!(err.to_string(), "daily message cap reached (30/30)");
    }

    #[test]
    fn option_ext_maps_to_not_found() {
        let value: Option<u32> = None;
        let err = value.ok_or_not_found("intent abc123").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
