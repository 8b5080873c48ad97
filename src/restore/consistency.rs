use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::guest::config_doc::{references_disk, GuestConfig};
use crate::guest::GuestCommand;
use crate::restore::disk::DiskGroup;
use crate::util::command::Runner;
use crate::zfs::{snapshot_suffix, Zfs};

/// Snapshot names present on each local dataset, listed once per run.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: HashMap<String, Vec<String>>,
}

impl SnapshotCache {
    pub fn suffixes(&mut self, zfs: &Zfs<'_>, dataset: &str) -> Result<&[String]> {
        if !self.entries.contains_key(dataset) {
            let names = zfs
                .snapshots(dataset)
                .map(|snaps| {
                    snaps
                        .iter()
                        .map(|s| snapshot_suffix(s).to_string())
                        .collect()
                })
                .unwrap_or_else(|err| {
                    debug!("no snapshots for {}: {}", dataset, err);
                    Vec::new()
                });
            self.entries.insert(dataset.to_string(), names);
        }
        Ok(self
            .entries
            .get(dataset)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Disk lines dropped from snapshot sections.
    pub removed_references: usize,
    pub config_rewritten: bool,
    /// Snapshots destroyed on disk because only the pre-restore config
    /// knew them.
    pub destroyed_on_disk: usize,
    pub failed_destroys: usize,
    /// Snapshots deleted through the guest tools because no disk has them.
    pub deleted_snapshots: Vec<String>,
}

impl ReconcileReport {
    pub fn deletions(&self) -> usize {
        self.removed_references + self.destroyed_on_disk + self.deleted_snapshots.len()
    }
}

pub fn backup_path(config_file: &Path) -> PathBuf {
    let mut name = config_file.as_os_str().to_os_string();
    name.push(".backup");
    PathBuf::from(name)
}

/// Brings a restored guest config in line with the snapshots that really
/// exist on its disks.
pub struct ConsistencyChecker<'a> {
    runner: &'a Runner,
    cache: SnapshotCache,
}

impl<'a> ConsistencyChecker<'a> {
    pub fn new(runner: &'a Runner) -> Self {
        Self {
            runner,
            cache: SnapshotCache::default(),
        }
    }

    pub fn reconcile(
        &mut self,
        group: &DiskGroup,
        config_file: &Path,
        guest: &GuestCommand<'_>,
    ) -> Result<ReconcileReport> {
        info!("{} {}: checking snapshot consistency", group.guest_type.label(), group.id);
        let local = Zfs::local(self.runner);
        let mut report = ReconcileReport::default();

        let original = fs::read_to_string(config_file)?;
        let mut doc = GuestConfig::parse(&original);
        let snapshots = guest.list_snapshots(&group.id)?;
        let mut keep: BTreeSet<&str> = BTreeSet::new();

        for snapshot in &snapshots {
            let snapshot_config = guest.snapshot_config(&group.id, snapshot)?.stdout;
            for (unique_name, destination) in group.unique_names() {
                let mentioned = snapshot_config
                    .lines()
                    .any(|line| references_disk(line, unique_name));
                if !mentioned {
                    continue;
                }
                let on_disk = self
                    .cache
                    .suffixes(&local, destination)?
                    .iter()
                    .any(|s| s == snapshot);
                if on_disk {
                    debug!("{}: snapshot {} is present", unique_name, snapshot);
                    keep.insert(snapshot.as_str());
                } else {
                    let removed = doc.remove_disk_references(snapshot, unique_name);
                    debug!("{}: dropped {} line(s) from {}", unique_name, removed, snapshot);
                    report.removed_references += removed;
                }
            }
        }

        let rewritten = doc.to_string();
        if rewritten != original {
            report.config_rewritten = true;
            if self.runner.run_mode().dry_run {
                info!("dry-run: would rewrite {}", config_file.display());
            } else {
                info!("rewriting {}", config_file.display());
                fs::write(config_file, &rewritten)?;
            }
        }

        let backup = backup_path(config_file);
        if backup.exists() {
            let old = GuestConfig::parse(&fs::read_to_string(&backup)?);
            let current: BTreeSet<&str> = doc.snapshot_names().into_iter().collect();
            let vanished: Vec<&str> = old
                .snapshot_names()
                .into_iter()
                .filter(|name| !current.contains(name))
                .collect();
            for (unique_name, destination) in group.unique_names() {
                let present = self.cache.suffixes(&local, destination)?.to_vec();
                let mut destroyed = 0;
                for name in vanished.iter().filter(|n| present.iter().any(|p| p == *n)) {
                    if self.runner.run_mode().dry_run {
                        info!("dry-run: would destroy {}@{}", destination, name);
                        continue;
                    }
                    let out = local.destroy(&format!("{}@{}", destination, name), false)?;
                    if out.success() {
                        destroyed += 1;
                    } else {
                        warn!("could not destroy {}@{}", destination, name);
                        out.log_failure();
                        report.failed_destroys += 1;
                    }
                }
                if destroyed > 0 {
                    info!("{}: destroyed {} snapshot(s) missing from the restored config", unique_name, destroyed);
                }
                report.destroyed_on_disk += destroyed;
            }
        }

        let orphaned: Vec<&String> = snapshots
            .iter()
            .filter(|s| !keep.contains(s.as_str()))
            .collect();
        if !orphaned.is_empty() {
            guest.unlock(&group.id)?;
        }
        for snapshot in orphaned {
            info!("{} {}: deleting snapshot {}, no disk has it", group.guest_type.label(), group.id, snapshot);
            let out = guest.delete_snapshot(&group.id, snapshot)?;
            if !out.success() {
                out.log_failure();
            }
            report.deleted_snapshots.push(snapshot.clone());
        }
        Ok(report)
    }
}
