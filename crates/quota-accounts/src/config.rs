use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How tracked accounts look on this host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Primary group of tracked accounts; `None` disables the group filter
    pub group: Option<String>,

    /// Login shell given to new accounts
    pub shell: String,

    /// systemd unit of the proxy daemon
    pub proxy_service: String,

    /// Proxy binary used for the startup version check
    pub proxy_binary: String,

    pub passwd_path: PathBuf,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            group: Some("socks".to_string()),
            shell: "/usr/sbin/nologin".to_string(),
            proxy_service: "danted".to_string(),
            proxy_binary: "sockd".to_string(),
            passwd_path: PathBuf::from("/etc/passwd"),
        }
    }
}
