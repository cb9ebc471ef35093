use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Embedded sled database in a local directory
    Sled { path: PathBuf },

    /// Volatile in-process map, nothing survives a restart
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Sled {
            path: PathBuf::from("/var/lib/quota/db"),
        }
    }
}
