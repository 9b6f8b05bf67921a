use thiserror::Error;

/// Main error type for the trigger engine
#[derive(Error, Debug)]
pub enum TripwireError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // Order execution errors
    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Insufficient margin: need {required}, have {available}")]
    InsufficientMargin {
        required: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("Exchange error: {0}")]
    Exchange(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for TripwireError
pub type Result<T> = std::result::Result<T, TripwireError>;

/// Error message fragments that mark an execution failure as permanent.
/// Exchange errors arrive as opaque strings, so classification falls back
/// to pattern matching on the message.
const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "insufficient",
    "balance",
    "margin",
    "invalid symbol",
    "position limit",
    "order would trigger immediately",
];

impl TripwireError {
    /// Whether retrying the failed execution attempt can possibly succeed.
    ///
    /// Structural variants are classified directly; opaque exchange errors
    /// fall back to message inspection.
    pub fn is_non_retryable(&self) -> bool {
        match self {
            TripwireError::InsufficientMargin { .. } => true,
            TripwireError::Validation(_) => true,
            TripwireError::OrderRejected(msg)
            | TripwireError::Exchange(msg)
            | TripwireError::OrderSubmission(msg) => {
                let lower = msg.to_ascii_lowercase();
                NON_RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
            }
            _ => false,
        }
    }
}
