//! Input validation for account provisioning

use crate::error::{RecordError, Result};

const MAX_USERNAME_LEN: usize = 32;

/// Check that `username` is acceptable to `useradd` and to the log format.
///
/// `%`, `@`, `(` and `)` are rejected outright since they delimit the
/// username inside proxy log lines.
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(RecordError::invalid_username(username, "must not be empty"));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(RecordError::invalid_username(
            username,
            format!("longer than {} characters", MAX_USERNAME_LEN),
        ));
    }

    let mut chars = username.chars();
    let first = chars.next().unwrap_or_default();
    if !(first.is_ascii_lowercase() || first == '_') {
        return Err(RecordError::invalid_username(
            username,
            "must start with a lowercase letter or underscore",
        ));
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')) {
        return Err(RecordError::invalid_username(
            username,
            format!("contains invalid character {:?}", bad),
        ));
    }

    Ok(())
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(RecordError::InvalidPassword("must not be empty".to_string()));
    }
    if password.contains(['\n', '\r', '\0']) {
        return Err(RecordError::InvalidPassword(
            "must not contain line breaks or NUL".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_usernames() {
        for name in ["alice", "_svc", "user-01", "a_b"] {
            assert!(validate_username(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_usernames() {
        for name in ["", "Alice", "1user", "al%ice", "bob@host", "x(1)", &"a".repeat(33)] {
            assert!(validate_username(name).is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn test_password_validation() {
        assert!(validate_password("s3cret").is_ok());
        assert!(validate_password("").is_err());
        assert!(validate_password("a\nb").is_err());
    }
}
