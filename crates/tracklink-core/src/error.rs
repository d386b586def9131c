use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// Identity conflicts and lock contention are deliberately absent: both are
/// logged and resolved inside the engine rather than raised.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required identifying field is missing or malformed. Rejects only
    /// the offending event.
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// A multi-statement write rolled back. Re-running the same operation
    /// is safe.
    #[error("transaction rolled back: {0}")]
    Transaction(#[source] anyhow::Error),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transaction(_))
    }
}
