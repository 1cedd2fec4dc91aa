//! Store tunables, compiled-in defaults overridable per store root.

use crate::error::StoreError;
use serde::Deserialize;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Name of the optional per-store config file under the root.
pub const CONFIG_FILE: &str = "config.yml";

/// Runtime tunables for a store.
///
/// Every field has a compiled-in default; a `config.yml` at the store
/// root may override any subset. Unknown keys are rejected so typos
/// fail loudly instead of silently keeping the default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Max in-progress records one agent may hold per kind
    #[serde(default = "default_wip_limit")]
    pub wip_limit: usize,

    /// Claim lifetime in seconds; 0 means claims never expire
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,

    /// How long acquire() polls for a record lock before Busy
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Age after which a lock file with a live-looking PID is broken anyway
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,

    /// SQLite busy_timeout
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Age after which orphaned temp files are swept at open
    #[serde(default = "default_temp_sweep_age_secs")]
    pub temp_sweep_age_secs: u64,
}

fn default_wip_limit() -> usize {
    3
}

fn default_claim_ttl_secs() -> u64 {
    3600
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_lock_stale_secs() -> u64 {
    300
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_temp_sweep_age_secs() -> u64 {
    3600
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            wip_limit: default_wip_limit(),
            claim_ttl_secs: default_claim_ttl_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_stale_secs: default_lock_stale_secs(),
            busy_timeout_ms: default_busy_timeout_ms(),
            temp_sweep_age_secs: default_temp_sweep_age_secs(),
        }
    }
}

impl StoreConfig {
    /// Load config from `<root>/config.yml`, falling back to defaults
    /// when the file is absent.
    pub fn load(root: &Path) -> Result<StoreConfig, StoreError> {
        let path = root.join(CONFIG_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoreConfig::default()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        serde_yaml::from_str(&text).map_err(|e| StoreError::CorruptRecord {
            id: CONFIG_FILE.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_stale_age(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn temp_sweep_age(&self) -> Duration {
        Duration::from_secs(self.temp_sweep_age_secs)
    }
}
