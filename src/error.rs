//! Common error type and result alias.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The backend answered but refused or could not serve the request.
    #[error("{0}")]
    Backend(String),

    #[error("Progress channel error: {0}")]
    Channel(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("A submission is already in flight")]
    Busy,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type AppResult<T> = Result<T, AppError>;
