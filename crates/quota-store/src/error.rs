//! Store error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Stored value for {key} is corrupted: {details}")]
    Corrupted { key: String, details: String },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store is unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn backend<T: Into<String>>(msg: T) -> Self {
        Self::Backend(msg.into())
    }

    /// Structural failures cannot be cured by retrying and must stop the process
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Corruption { .. } => Self::Corrupted {
                key: "<database>".to_string(),
                details: "sled reported on-disk corruption".to_string(),
            },
            sled::Error::Io(e) => Self::Io(e),
            other => Self::backend(format!("Sled error: {}", other)),
        }
    }
}
