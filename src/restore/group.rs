use tracing::{debug, warn};

use crate::error::Result;
use crate::guest::storage::{first_block, resolve_destination, unique_name_from_config_line};
use crate::restore::catalog::DiskCatalog;
use crate::restore::disk::{BackedUpDisk, DiskGroup, ExtraDiskAction, NonBackedUpDisk};
use crate::util::command::Runner;

/// Partitions disks by guest id. Groups appear in order of their first
/// disk and keep discovery order inside.
pub fn group_disks(disks: Vec<BackedUpDisk>) -> Vec<DiskGroup> {
    let mut groups: Vec<DiskGroup> = Vec::new();
    for disk in disks {
        match groups.iter_mut().find(|group| group.id == disk.guest_id) {
            Some(group) => group.backed_up.push(disk),
            None => {
                let mut group = DiskGroup::new(&disk.guest_id, disk.guest_type);
                group.backed_up.push(disk);
                groups.push(group);
            }
        }
    }
    groups
}

/// Disk lines of the live block that belong to guest `id` and are not
/// covered by any backed-up disk.
pub fn extra_disk_lines<'c>(config: &'c str, id: &str, group: &DiskGroup) -> Vec<(&'c str, String)> {
    let marker = format!("-{}-disk-", id);
    first_block(config)
        .into_iter()
        .filter(|line| line.contains(&marker))
        .filter_map(|line| unique_name_from_config_line(line).map(|name| (line, name)))
        .filter(|(_, name)| {
            !group
                .backed_up
                .iter()
                .any(|disk| disk.unique_name.contains(name.as_str()))
        })
        .collect()
}

/// Adds the guest's disks that the backup does not contain, based on the
/// group's latest remote config. The fetched config is kept on the group.
pub fn find_extra_disks(group: &mut DiskGroup, catalog: &mut DiskCatalog<'_>, runner: &Runner) -> Result<()> {
    let Some(last_config) = group.last_config().map(str::to_string) else {
        return Ok(());
    };
    let config = catalog.remote_config(&last_config)?;
    let mut extras = Vec::new();
    for (line, unique_name) in extra_disk_lines(&config, &group.id, group) {
        let destination = match resolve_destination(runner, &unique_name, group.guest_type) {
            Ok(destination) => destination,
            Err(err) => {
                warn!("{} {}: ignoring {}: {}", group.guest_type.label(), group.id, unique_name, err);
                continue;
            }
        };
        debug!("{} {}: {} was not backed up", group.guest_type.label(), group.id, unique_name);
        extras.push(NonBackedUpDisk {
            unique_name,
            config_line: line.to_string(),
            destination,
            action: ExtraDiskAction::Pending,
        });
    }
    group.non_backed_up.extend(extras);
    group.remote_config = Some(config);
    Ok(())
}
