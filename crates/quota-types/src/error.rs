//! Validation errors for user records

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecordError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Invalid username {username:?}: {reason}")]
    InvalidUsername { username: String, reason: String },

    #[error("Invalid password: {0}")]
    InvalidPassword(String),
}

impl RecordError {
    pub fn invalid_username(username: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUsername {
            username: username.into(),
            reason: reason.into(),
        }
    }
}
