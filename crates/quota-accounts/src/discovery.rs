//! Boot-time discovery of tracked accounts

use crate::config::AccountsConfig;
use crate::error::{AccountError, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// One line of `/etc/passwd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: String,
}

impl PasswdEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 7 || fields[0].is_empty() {
            return None;
        }
        Some(Self {
            name: fields[0].to_string(),
            uid: fields[2].parse().ok()?,
            gid: fields[3].parse().ok()?,
            home: PathBuf::from(fields[5]),
            shell: fields[6].trim().to_string(),
        })
    }

    pub fn has_disabled_shell(&self) -> bool {
        let base = Path::new(&self.shell)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        matches!(base, "nologin" | "false")
    }

    /// Proxy-only accounts: no login shell, an existing home directory and,
    /// when given, the proxy group as primary group
    pub fn is_tracked(&self, group_gid: Option<u32>) -> bool {
        self.has_disabled_shell()
            && self.home.is_dir()
            && group_gid.map_or(true, |gid| gid == self.gid)
    }
}

pub fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let entry = PasswdEntry::parse(line);
            if entry.is_none() {
                debug!(line, "skipping unparseable passwd line");
            }
            entry
        })
        .collect()
}

/// Usernames of every tracked account on this host
pub async fn discover_accounts(config: &AccountsConfig, group_gid: Option<u32>) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(&config.passwd_path).await?;
    let names: Vec<String> = parse_passwd(&content)
        .into_iter()
        .filter(|entry| entry.is_tracked(group_gid))
        .map(|entry| entry.name)
        .collect();

    info!(count = names.len(), "discovered tracked accounts");
    Ok(names)
}

/// gid from a `getent group` line such as `socks:x:1001:alice,bob`
pub fn parse_group_line(line: &str) -> Option<u32> {
    line.trim().split(':').nth(2)?.parse().ok()
}

async fn lookup_group(name: &str) -> Result<Option<u32>> {
    let output = Command::new("getent").arg("group").arg(name).output().await?;
    // getent exits 2 when the key is absent
    if !output.status.success() {
        return Ok(None);
    }
    Ok(parse_group_line(&String::from_utf8_lossy(&output.stdout)))
}

async fn create_group(name: &str) -> Result<()> {
    let output = Command::new("groupadd").arg(name).output().await?;
    if !output.status.success() {
        return Err(AccountError::command_failed(
            format!("groupadd {}", name),
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

/// Resolve the proxy group's gid, creating the group once if it is missing
pub async fn ensure_group(name: &str) -> Result<u32> {
    ensure_group_with(name, lookup_group, create_group).await
}

pub(crate) async fn ensure_group_with<'a, L, LF, C, CF>(name: &'a str, mut lookup: L, create: C) -> Result<u32>
where
    L: FnMut(&'a str) -> LF,
    LF: Future<Output = Result<Option<u32>>>,
    C: FnOnce(&'a str) -> CF,
    CF: Future<Output = Result<()>>,
{
    if let Some(gid) = lookup(name).await? {
        return Ok(gid);
    }

    warn!(group = name, "proxy group missing, creating it");
    create(name).await?;

    lookup(name)
        .await?
        .ok_or_else(|| AccountError::GroupUnavailable(name.to_string()))
}
