use thiserror::Error;

/// Errors raised by the GAC pipeline and the services around it.
#[derive(Debug, Error)]
pub enum GacError {
    /// Nothing to score: no participants, statements or votes, or an all-missing matrix.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Zero variance, singular covariance, too few samples for k. Absorbed at stage boundaries.
    #[error("Numeric degeneracy: {0}")]
    NumericDegeneracy(String),

    /// Structural misuse by the caller (duplicate ids, mixed polls, unknown vote values).
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// A score record that cannot be classified.
    #[error("Invalid score record: {0}")]
    InvalidRecord(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Webhook delivery error: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for GacError {
    fn from(e: sqlx::Error) -> Self {
        GacError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for GacError {
    fn from(e: reqwest::Error) -> Self {
        GacError::Delivery(e.to_string())
    }
}

impl From<serde_json::Error> for GacError {
    fn from(e: serde_json::Error) -> Self {
        GacError::Serialization(e.to_string())
    }
}
