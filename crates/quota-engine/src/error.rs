//! Engine error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(#[from] quota_types::RecordError),

    #[error("Store error: {0}")]
    Store(#[from] quota_store::StoreError),

    #[error("Account management error: {0}")]
    Account(#[from] quota_accounts::AccountError),

    #[error("Log ingestion failed: {0}")]
    Ingest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn ingest(msg: impl Into<String>) -> Self {
        Self::Ingest(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Failures that must take the whole process down
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Store(e) => e.is_structural(),
            Self::Ingest(_) => true,
            _ => false,
        }
    }
}

impl From<prometheus::Error> for EngineError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
