use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::model::{Config, LockTiming, Settings};
use crate::error::{ConfigError, PzmError, Result};

/// Loads settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let mut contents = String::new();
    File::open(path)
        .map_err(PzmError::Io)?
        .read_to_string(&mut contents)
        .map_err(PzmError::Io)?;
    let cfg: Config =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    parse_settings(cfg)
}

fn parse_settings(cfg: Config) -> Result<Settings> {
    let defaults = Settings::default();

    let lock_file = cfg
        .lock_file
        .map(PathBuf::from)
        .unwrap_or(defaults.lock_file);
    if !lock_file.is_absolute() {
        return Err(ConfigError::Invalid(format!(
            "lockFile {} must be an absolute path",
            lock_file.display()
        ))
        .into());
    }

    let lock = LockTiming {
        presleep_max: secs_or(cfg.lock.presleep_max_secs, defaults.lock.presleep_max),
        poll_min: secs_or(cfg.lock.poll_min_secs, defaults.lock.poll_min),
        poll_max: secs_or(cfg.lock.poll_max_secs, defaults.lock.poll_max),
        release_retry: secs_or(cfg.lock.release_retry_secs, defaults.lock.release_retry),
    };
    if lock.poll_min > lock.poll_max {
        return Err(ConfigError::Invalid(format!(
            "lock.pollMinSecs ({}) exceeds lock.pollMaxSecs ({})",
            lock.poll_min.as_secs(),
            lock.poll_max.as_secs()
        ))
        .into());
    }

    Ok(Settings {
        lock_file,
        pve_root: cfg.pve_root.map(PathBuf::from).unwrap_or(defaults.pve_root),
        lock,
        sync_retry_delay: secs_or(cfg.sync.retry_delay_secs, defaults.sync_retry_delay),
    })
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}
