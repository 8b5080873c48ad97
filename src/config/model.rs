use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_LOCK_FILE: &str = "/var/lib/pve-zsync/manager_sync.lock";
pub const DEFAULT_PVE_ROOT: &str = "/etc/pve";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default, rename = "lockFile")]
    pub lock_file: Option<String>,
    #[serde(default, rename = "pveRoot")]
    pub pve_root: Option<String>,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LockConfig {
    #[serde(default, rename = "presleepMaxSecs")]
    pub presleep_max_secs: Option<u64>,
    #[serde(default, rename = "pollMinSecs")]
    pub poll_min_secs: Option<u64>,
    #[serde(default, rename = "pollMaxSecs")]
    pub poll_max_secs: Option<u64>,
    #[serde(default, rename = "releaseRetrySecs")]
    pub release_retry_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SyncConfig {
    #[serde(default, rename = "retryDelaySecs")]
    pub retry_delay_secs: Option<u64>,
}

/// Timing of the lock protocol. Waits are drawn uniformly from the given
/// ranges.
#[derive(Debug, Clone)]
pub struct LockTiming {
    pub presleep_max: Duration,
    pub poll_min: Duration,
    pub poll_max: Duration,
    pub release_retry: Duration,
}

impl Default for LockTiming {
    fn default() -> Self {
        Self {
            presleep_max: Duration::from_secs(60),
            poll_min: Duration::from_secs(30),
            poll_max: Duration::from_secs(60),
            release_retry: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub lock_file: PathBuf,
    pub pve_root: PathBuf,
    pub lock: LockTiming,
    pub sync_retry_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            pve_root: PathBuf::from(DEFAULT_PVE_ROOT),
            lock: LockTiming::default(),
            sync_retry_delay: Duration::from_secs(30),
        }
    }
}
