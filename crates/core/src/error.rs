//! Error types for the DevAssist domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all DevAssist operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model service errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Declared function errors ---
    #[error("Function error: {0}")]
    Function(#[from] FunctionError),

    // --- History store errors ---
    #[error("History error: {0}")]
    History(#[from] HistoryError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The model service declined to answer (e.g. a content-safety block).
    #[error("Response blocked by the model service: {0}")]
    Blocked(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum FunctionError {
    #[error("Function not found: {0}")]
    NotFound(String),

    #[error("Function already declared: {0}")]
    Duplicate(String),

    #[error("Function execution failed: {function_name} - {reason}")]
    ExecutionFailed {
        function_name: String,
        reason: String,
    },

    #[error("Invalid function arguments: {0}")]
    InvalidArguments(String),

    #[error("Function call cancelled: {0}")]
    Cancelled(String),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted history entry: {0}")]
    Corrupted(String),
}
