use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Account already exists: {0}")]
    AlreadyExists(String),

    #[error("Account not found: {0}")]
    NotFound(String),

    #[error("Command `{command}` failed (status {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("Group {0} is unavailable after creation attempt")]
    GroupUnavailable(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AccountError {
    pub fn command_failed(command: impl Into<String>, status: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            status,
            stderr: stderr.into(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CommandFailed { .. } | Self::IoError(_))
    }
}

pub type Result<T> = std::result::Result<T, AccountError>;
