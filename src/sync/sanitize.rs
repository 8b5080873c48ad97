use tracing::{debug, info, warn};

use crate::error::Result;
use crate::guest::storage::{resolve_destination, storage_pool, unique_name_from_config_line};
use crate::guest::GuestCommand;
use crate::sync::ids::IdSelection;
use crate::types::GuestType;
use crate::util::command::Runner;
use crate::zfs::{leaf_name, Zfs};

#[derive(Debug, Clone)]
pub struct SanitizeRequest {
    pub hostname: String,
    pub pool: String,
    pub backup_name: String,
    pub ids: IdSelection,
}

/// A guest disk on this host: its PVE storage and backing dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDisk {
    pub storage: String,
    pub dataset: String,
}

#[derive(Debug, Default)]
pub struct SanitizeReport {
    pub checked: usize,
    pub rolled_back: Vec<String>,
}

/// Disks of guest `id` as listed in its live config.
pub fn guest_disks(runner: &Runner, guest_type: GuestType, id: &str) -> Result<Vec<LocalDisk>> {
    let out = GuestCommand::new(runner, guest_type).config(id)?;
    let marker = format!("{}-disk", id);
    let mut disks = Vec::new();
    for line in out.lines().into_iter().filter(|line| line.contains(&marker)) {
        let Some(unique_name) = unique_name_from_config_line(line) else {
            continue;
        };
        match resolve_destination(runner, &unique_name, guest_type) {
            Ok(dataset) => disks.push(LocalDisk {
                storage: storage_pool(&unique_name).to_string(),
                dataset,
            }),
            Err(err) => warn!("{} {}: {}", guest_type.label(), id, err),
        }
    }
    Ok(disks)
}

/// Newest local snapshot of `dataset` whose name mentions `backup_name`.
pub fn latest_snapshot(runner: &Runner, dataset: &str, backup_name: &str) -> Option<String> {
    match Zfs::local(runner).snapshots(dataset) {
        Ok(snapshots) => snapshots
            .into_iter()
            .rev()
            .find(|snapshot| snapshot.contains(backup_name)),
        Err(err) => {
            debug!("no snapshots for {}: {}", dataset, err);
            None
        }
    }
}

/// Rolls the remote copy of `disk` back to the newest local backup snapshot
/// when the remote has newer ones. Returns the snapshot rolled back to.
pub fn sanitize_disk(
    runner: &Runner,
    hostname: &str,
    pool: &str,
    backup_name: &str,
    disk: &LocalDisk,
) -> Result<Option<String>> {
    let Some(latest) = latest_snapshot(runner, &disk.dataset, backup_name) else {
        debug!("{}: no snapshot named after {}", disk.dataset, backup_name);
        return Ok(None);
    };
    let leaf = leaf_name(&latest);
    let remote = Zfs::remote(runner, hostname);

    let mut target = format!("{}/{}", pool, leaf);
    let mut listing = remote_listing(&remote, &target);
    if listing.is_empty() {
        // pve-zsync --prepend-storage-id layout
        target = format!("{}/{}/{}", pool, disk.storage, leaf);
        listing = remote_listing(&remote, &target);
    }

    let Some(position) = listing.iter().position(|snapshot| *snapshot == target) else {
        debug!("{} not found on {}", target, hostname);
        return Ok(None);
    };
    if position + 1 == listing.len() {
        return Ok(None);
    }

    info!("rolling back {} on {}", target, hostname);
    let out = remote.rollback(&target)?;
    if !out.success() {
        out.log_failure();
        return Ok(None);
    }
    Ok(Some(target))
}

fn remote_listing(remote: &Zfs<'_>, snapshot: &str) -> Vec<String> {
    let dataset = snapshot.split_once('@').map(|(ds, _)| ds).unwrap_or(snapshot);
    remote.snapshots(dataset).unwrap_or_default()
}

/// Brings the remote backup snapshots of every selected guest in line with
/// the local ones, so the next incremental send has a common base.
pub fn run_sanitize(request: &SanitizeRequest, runner: &Runner) -> Result<SanitizeReport> {
    let mut report = SanitizeReport::default();
    for guest in request.ids.resolve(runner)? {
        let Some(guest_type) = guest.guest_type else {
            debug!("{}: pull source, nothing to sanitize", guest.id);
            continue;
        };
        let disks = guest_disks(runner, guest_type, &guest.id)?;
        debug!("{} {}: {} disk(s)", guest_type.label(), guest.id, disks.len());
        for disk in &disks {
            report.checked += 1;
            if let Some(target) =
                sanitize_disk(runner, &request.hostname, &request.pool, &request.backup_name, disk)?
            {
                report.rolled_back.push(target);
            }
        }
    }
    Ok(report)
}
