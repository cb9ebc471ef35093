use crate::config::AccountsConfig;
use crate::error::{AccountError, Result};
use crate::AccountManager;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use quota_types::Timestamp;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// `useradd` exit status for "username already in use"
const USERADD_EXISTS: i32 = 9;
/// `userdel` exit status for "specified user doesn't exist"
const USERDEL_MISSING: i32 = 6;

/// Account manager backed by shadow-utils on the local host
pub struct SystemAccounts {
    config: AccountsConfig,
}

impl SystemAccounts {
    pub fn new(config: AccountsConfig) -> Self {
        Self { config }
    }
}

async fn run(cmd: &mut Command, command_line: &str) -> Result<Output> {
    debug!(command = command_line, "running account command");
    let output = cmd.output().await?;
    Ok(output)
}

fn failure(command_line: &str, output: &Output) -> AccountError {
    AccountError::command_failed(
        command_line,
        output.status.code(),
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
    )
}

/// OS expiry date for a record expiring at `expires_at`.
///
/// `chage -E` makes the account unusable from the start of the given day, so
/// the date is the day after `expires_at`; the enforcer locks at the exact
/// second.
pub fn os_expiry_date(expires_at: Timestamp) -> String {
    let date = DateTime::<Utc>::from_timestamp(expires_at, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MAX);
    date.checked_add_signed(Duration::days(1))
        .unwrap_or(date)
        .format("%Y-%m-%d")
        .to_string()
}

/// Parse the status letter of `passwd -S` output (`alice L 2024-01-01 ...`)
pub fn parse_passwd_status(output: &str) -> Option<bool> {
    let status = output.split_whitespace().nth(1)?;
    match status {
        "L" | "LK" => Some(true),
        "P" | "PS" | "NP" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl AccountManager for SystemAccounts {
    async fn hash_password(&self, password: &str) -> Result<String> {
        let command_line = "openssl passwd -6 -stdin";
        let mut child = Command::new("openssl")
            .args(["passwd", "-6", "-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(failure(command_line, &output));
        }

        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !hash.starts_with("$6$") {
            return Err(AccountError::UnexpectedOutput {
                command: command_line.to_string(),
                output: hash,
            });
        }
        Ok(hash)
    }

    async fn create_account(
        &self,
        username: &str,
        password_hash: &str,
        expires_at: Timestamp,
    ) -> Result<()> {
        let expiry = os_expiry_date(expires_at);
        let mut cmd = Command::new("useradd");
        cmd.arg("--create-home")
            .arg("--shell")
            .arg(&self.config.shell)
            .arg("--password")
            .arg(password_hash)
            .arg("--expiredate")
            .arg(&expiry);
        if let Some(group) = &self.config.group {
            cmd.arg("--gid").arg(group);
        }
        cmd.arg(username);

        let command_line = format!("useradd {}", username);
        let output = run(&mut cmd, &command_line).await?;
        match output.status.code() {
            Some(0) => {
                info!(user = username, expiry = %expiry, "created account");
                Ok(())
            }
            Some(USERADD_EXISTS) => Err(AccountError::AlreadyExists(username.to_string())),
            _ => Err(failure(&command_line, &output)),
        }
    }

    async fn delete_account(&self, username: &str) -> Result<()> {
        let command_line = format!("userdel --remove {}", username);
        let output = run(Command::new("userdel").arg("--remove").arg(username), &command_line).await?;
        match output.status.code() {
            Some(0) => {
                info!(user = username, "deleted account");
                Ok(())
            }
            Some(USERDEL_MISSING) => Err(AccountError::NotFound(username.to_string())),
            _ => Err(failure(&command_line, &output)),
        }
    }

    async fn set_locked(&self, username: &str, locked: bool) -> Result<()> {
        let flag = if locked { "--lock" } else { "--unlock" };
        let command_line = format!("usermod {} {}", flag, username);
        let output = run(Command::new("usermod").arg(flag).arg(username), &command_line).await?;
        if !output.status.success() {
            return Err(failure(&command_line, &output));
        }
        Ok(())
    }

    async fn query_locked(&self, username: &str) -> Result<bool> {
        let command_line = format!("passwd --status {}", username);
        let output = run(Command::new("passwd").arg("--status").arg(username), &command_line).await?;
        if !output.status.success() {
            return Err(failure(&command_line, &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_passwd_status(&stdout).ok_or_else(|| AccountError::UnexpectedOutput {
            command: command_line,
            output: stdout.trim().to_string(),
        })
    }

    async fn set_expiry(&self, username: &str, expires_at: Timestamp) -> Result<()> {
        let expiry = os_expiry_date(expires_at);
        let command_line = format!("chage --expiredate {} {}", expiry, username);
        let output = run(
            Command::new("chage").arg("--expiredate").arg(&expiry).arg(username),
            &command_line,
        )
        .await?;
        if !output.status.success() {
            return Err(failure(&command_line, &output));
        }
        Ok(())
    }

    async fn restart_proxy_service(&self) -> Result<()> {
        let command_line = format!("systemctl restart {}", self.config.proxy_service);
        let output = run(
            Command::new("systemctl")
                .arg("restart")
                .arg(&self.config.proxy_service),
            &command_line,
        )
        .await?;
        if !output.status.success() {
            return Err(failure(&command_line, &output));
        }
        info!(service = %self.config.proxy_service, "restarted proxy service");
        Ok(())
    }
}

/// One-time compatibility probe of the proxy binary.
///
/// Never fails: a missing or unrecognised binary only produces a warning.
pub async fn check_proxy_version(binary: &str) -> Option<String> {
    let output = match Command::new(binary).arg("-v").output().await {
        Ok(output) => output,
        Err(e) => {
            warn!(binary, error = %e, "proxy binary not found, skipping version check");
            return None;
        }
    };

    // sockd prints its version banner on either stream depending on build
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    match parse_version_banner(&text) {
        Some(version) => {
            info!(binary, version = %version, "detected proxy version");
            Some(version)
        }
        None => {
            warn!(binary, output = %text.trim(), "could not determine proxy version");
            None
        }
    }
}

/// Extract `1.4.2` from a banner such as `Dante v1.4.2.  Copyright ...`
pub fn parse_version_banner(text: &str) -> Option<String> {
    text.split_whitespace()
        .filter_map(|word| word.strip_prefix('v'))
        .map(|v| v.trim_end_matches(|c: char| !c.is_ascii_digit()))
        .find(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit() || c == '.'))
        .map(str::to_string)
}
