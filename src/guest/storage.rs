use std::process::Command;

use crate::error::{PzmError, Result};
use crate::types::GuestType;
use crate::util::command::Runner;

/// `storagePool:diskIdentifier` from a disk line such as
/// `rootfs: vmssd:subvol-100-disk-0,mountpoint=/,size=8G`.
pub fn unique_name_from_config_line(line: &str) -> Option<String> {
    let first = line.split(',').next()?;
    let (_, reference) = first.split_once(':')?;
    let reference: String = reference.chars().filter(|c| *c != ' ').collect();
    if !reference.contains(':') {
        return None;
    }
    Some(reference)
}

/// Options after the volume reference: `mp=/test`, `backup=1`, `size=8G`.
pub fn disk_options(line: &str) -> Vec<String> {
    match line.split_once(',') {
        Some((_, rest)) => rest.split(',').map(|o| o.trim().to_string()).collect(),
        None => Vec::new(),
    }
}

/// Config key of a disk line: `mp0`, `scsi1`, `rootfs`.
pub fn disk_key(line: &str) -> Option<&str> {
    line.split_once(':').map(|(key, _)| key.trim())
}

pub fn storage_pool(unique_name: &str) -> &str {
    unique_name.split(':').next().unwrap_or(unique_name)
}

/// First block of a guest config, i.e. everything before the first blank
/// line, as non-empty lines.
pub fn first_block(config: &str) -> Vec<&str> {
    config
        .split("\n\n")
        .next()
        .unwrap_or("")
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect()
}

/// Turns a `pvesm path` result into the local dataset: the mount path minus
/// its leading `/` for containers, the zvol name for VMs.
pub fn destination_from_path(path: &str, guest_type: GuestType) -> Option<String> {
    let path = path.trim();
    match guest_type {
        GuestType::Container => path
            .split_once('/')
            .map(|(_, rest)| rest.to_string())
            .filter(|rest| !rest.is_empty()),
        GuestType::Vm => path
            .split_once("/dev/zvol/")
            .map(|(_, rest)| rest.to_string())
            .filter(|rest| !rest.is_empty()),
    }
}

/// Resolves a volume to its local dataset through `pvesm path`.
pub fn resolve_destination(runner: &Runner, unique_name: &str, guest_type: GuestType) -> Result<String> {
    let out = runner.read(Command::new("pvesm").arg("path").arg(unique_name))?;
    if !out.success() {
        return Err(PzmError::message(format!(
            "pvesm path {}: {}",
            unique_name,
            out.stderr.trim()
        )));
    }
    let first = out.lines().first().map(|l| l.to_string()).unwrap_or_default();
    destination_from_path(&first, guest_type).ok_or_else(|| {
        PzmError::message(format!(
            "pvesm path {} returned unusable path {:?}",
            unique_name, first
        ))
    })
}
