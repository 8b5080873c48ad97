use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::{PzmError, Result};
use crate::guest::storage::{first_block, resolve_destination, unique_name_from_config_line};
use crate::restore::disk::{BackedUpDisk, DiskAction};
use crate::types::GuestType;
use crate::util::command::{ssh, Runner};
use crate::zfs::{leaf_name, Zfs};

/// Why a remote dataset did not become a restore candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoTaggedSnapshot,
    NoConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ready(BackedUpDisk),
    Skipped(SkipReason),
}

/// True for `basevol-<id>-disk-<n>`, `subvol-<id>-disk-<n>` and
/// `vm-<id>-disk-<n>` leaves.
pub fn is_guest_disk(leaf: &str) -> bool {
    let mut parts = leaf.split('-');
    let prefix_ok = matches!(parts.next(), Some("basevol" | "subvol" | "vm"));
    let numeric = |p: Option<&str>| p.map_or(false, |s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()));
    prefix_ok
        && numeric(parts.next())
        && parts.next() == Some("disk")
        && numeric(parts.next())
        && parts.next().is_none()
}

/// Guest id encoded in a disk leaf (`subvol-100-disk-0` gives `100`).
pub fn guest_id_of(leaf: &str) -> Option<&str> {
    leaf.split('-').nth(1)
}

/// Remote file contents via `ssh cat`.
pub fn fetch_remote_file(runner: &Runner, hostname: &str, path: &str) -> Result<String> {
    let out = runner.read(&mut ssh(hostname, ["cat", path]))?;
    if !out.success() {
        return Err(PzmError::message(format!(
            "(SSH) cat {} failed: {}",
            path,
            out.stderr.trim()
        )));
    }
    Ok(out.stdout)
}

/// Finds restorable guest disks on the backup host.
pub struct DiskCatalog<'a> {
    runner: &'a Runner,
    hostname: &'a str,
    config_path: &'a str,
    configs: HashMap<String, String>,
}

impl<'a> DiskCatalog<'a> {
    pub fn new(runner: &'a Runner, hostname: &'a str, config_path: &'a str) -> Self {
        Self {
            runner,
            hostname,
            config_path: config_path.trim_end_matches('/'),
            configs: HashMap::new(),
        }
    }

    pub fn config_file(&self, name: &str) -> String {
        format!("{}/{}", self.config_path, name)
    }

    /// Remote config text, cached per file.
    pub fn remote_config(&mut self, name: &str) -> Result<String> {
        if let Some(text) = self.configs.get(name) {
            return Ok(text.clone());
        }
        let text = fetch_remote_file(self.runner, self.hostname, &self.config_file(name))?;
        self.configs.insert(name.to_string(), text.clone());
        Ok(text)
    }

    fn config_listing(&self) -> Result<Vec<String>> {
        let out = self
            .runner
            .read(&mut ssh(self.hostname, ["ls", "-1", self.config_path]))?;
        if !out.success() {
            return Err(PzmError::message(format!(
                "(SSH) ls {} failed: {}",
                self.config_path,
                out.stderr.trim()
            )));
        }
        Ok(out.lines().iter().map(|l| l.trim().to_string()).collect())
    }

    /// Every guest disk under `pool` that has a tagged snapshot, a matching
    /// config and a local destination. Disks that fail any of these steps
    /// are left out.
    pub fn discover(&mut self, pool: &str, backup_name: &str, filter: Option<&str>) -> Result<Vec<BackedUpDisk>> {
        info!("gathering data from {}, please wait", self.hostname);
        let zfs = Zfs::remote(self.runner, self.hostname);
        let prefix = format!("{}/", pool);
        let candidates: Vec<String> = zfs
            .datasets_in_pool(pool)?
            .into_iter()
            .filter(|name| name.contains(&prefix) && is_guest_disk(leaf_name(name)))
            .filter(|name| filter.map_or(true, |f| name.contains(f)))
            .collect();
        debug!("disks found after filter: {:?}", candidates);

        let listing = self.config_listing()?;
        let mut disks = Vec::new();
        for dataset in candidates {
            match self.resolve(&dataset, backup_name, &listing) {
                Ok(Resolution::Ready(disk)) => disks.push(disk),
                Ok(Resolution::Skipped(reason)) => {
                    debug!("skipping {}: {:?}", dataset, reason);
                }
                Err(err) => warn!("excluding {}: {}", dataset, err),
            }
        }
        Ok(disks)
    }

    /// Resolves one remote dataset. `Skipped` is returned exactly when no
    /// snapshot carries the backup tag or no config matches it.
    pub fn resolve(&mut self, dataset: &str, backup_name: &str, listing: &[String]) -> Result<Resolution> {
        let name = leaf_name(dataset).to_string();
        let guest_id = guest_id_of(&name)
            .ok_or_else(|| PzmError::message(format!("no guest id in {}", name)))?
            .to_string();

        let zfs = Zfs::remote(self.runner, self.hostname);
        let Some(last_snapshot) = zfs
            .snapshots(dataset)?
            .into_iter()
            .filter(|snap| snap.contains(backup_name))
            .last()
        else {
            return Ok(Resolution::Skipped(SkipReason::NoTaggedSnapshot));
        };

        let suffix = crate::zfs::snapshot_suffix(&last_snapshot);
        let id_prefix = format!("{}.", guest_id);
        let Some(last_config) = listing
            .iter()
            .filter(|file| file.starts_with(&id_prefix) && file.contains(suffix))
            .last()
            .cloned()
        else {
            return Ok(Resolution::Skipped(SkipReason::NoConfig));
        };

        let guest_type = GuestType::from_config_name(&last_config).ok_or_else(|| {
            PzmError::message(format!("cannot tell guest type from {}", last_config))
        })?;
        let config = self.remote_config(&last_config)?;
        let unique_name = unique_name_for(dataset, &name, &config)?;
        let destination = resolve_destination(self.runner, &unique_name, guest_type)?;

        Ok(Resolution::Ready(BackedUpDisk {
            guest_id,
            name,
            full_name: dataset.to_string(),
            last_snapshot,
            last_config,
            unique_name,
            destination,
            guest_type,
            action: DiskAction::Pending,
        }))
    }
}

/// `pool:identifier` for a backed-up dataset. A single matching line in the
/// live block decides; several matches mean the dataset was sent with the
/// storage id prepended, so the parent segment names the pool.
pub fn unique_name_for(dataset: &str, leaf: &str, config: &str) -> Result<String> {
    let matches: Vec<&str> = first_block(config)
        .into_iter()
        .filter(|line| line.contains(leaf))
        .collect();
    match matches.as_slice() {
        [] => Err(PzmError::message(format!("{} is not referenced by its config", leaf))),
        [line] => unique_name_from_config_line(line)
            .ok_or_else(|| PzmError::message(format!("cannot parse disk line {:?}", line))),
        _ => {
            let segments: Vec<&str> = dataset.split('/').collect();
            if segments.len() < 3 {
                return Err(PzmError::message(format!(
                    "{} is referenced several times and has no storage segment",
                    dataset
                )));
            }
            let candidate = format!("{}:{}", segments[segments.len() - 2], leaf);
            if !matches
                .iter()
                .any(|line| unique_name_from_config_line(line).as_deref() == Some(candidate.as_str()))
            {
                return Err(PzmError::message(format!(
                    "{} is referenced several times, none of them as {}",
                    dataset, candidate
                )));
            }
            Ok(candidate)
        }
    }
}
