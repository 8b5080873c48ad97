use crate::error::Result;
use crate::guest::config_doc::references_disk;
use crate::restore::disk::{DiskAction, DiskGroup, ExtraDiskAction};
use crate::util::command::Runner;
use crate::util::prompt::{ask_choice, ask_yes_no, Prompter};
use crate::zfs::Zfs;

/// Asks the operator what to do with every disk. Returns `None` when the
/// final confirmation is not given.
pub fn build_plan(
    mut groups: Vec<DiskGroup>,
    prompter: &mut dyn Prompter,
    runner: &Runner,
) -> Result<Option<Vec<DiskGroup>>> {
    let local = Zfs::local(runner);
    println!();
    for group in groups.iter_mut() {
        println!("ID: {}", group.id);
        for disk in group.backed_up.iter_mut() {
            let question = format!(
                "Restore Disk from {} to {}? (y/n): ",
                disk.last_snapshot, disk.destination
            );
            if ask_yes_no(prompter, &question)? {
                disk.action = DiskAction::Restore;
            }
        }
        println!();

        if !group.has_restore() {
            group.skip = true;
            continue;
        }

        let remote_config = group.remote_config.clone().unwrap_or_default();
        for disk in group.backed_up.iter_mut() {
            if disk.action == DiskAction::Restore {
                continue;
            }
            if local.exists(&disk.destination)? {
                let question = format!(
                    "Fate of {} - Rollback to same timestamp or keep current data and destroy all newer snapshots? (rollback/keep): ",
                    disk.unique_name
                );
                disk.action = match ask_choice(prompter, &question, &["rollback", "keep"])?.as_str() {
                    "rollback" => DiskAction::Rollback,
                    _ => DiskAction::Keep,
                };
            } else if !remote_config
                .lines()
                .any(|line| references_disk(line, &disk.unique_name))
            {
                disk.action = DiskAction::Skip;
            }
        }

        for extra in group.non_backed_up.iter_mut() {
            if local.exists(&extra.destination)? {
                extra.action = ExtraDiskAction::Present;
                continue;
            }
            let question = format!(
                "Disk {} was not backed up. Should it be recreated? (y/n): ",
                extra.unique_name
            );
            extra.action = if ask_yes_no(prompter, &question)? {
                ExtraDiskAction::Recreate
            } else {
                ExtraDiskAction::Leave
            };
        }
    }

    println!();
    println!("Please check restore configuration:");
    for line in summary_lines(&groups) {
        println!("{}", line);
    }
    println!();

    let answer = prompter.ask("Is the information correct? (y): ")?;
    if answer.trim().eq_ignore_ascii_case("y") {
        Ok(Some(groups))
    } else {
        Ok(None)
    }
}

pub fn summary_lines(groups: &[DiskGroup]) -> Vec<String> {
    let mut lines = Vec::new();
    for group in groups {
        if group.skip {
            lines.push(format!("ID: {} skipped!", group.id));
            continue;
        }
        lines.push(format!("ID: {}:", group.id));
        let reference = group.reference_suffix().unwrap_or_default();
        for disk in &group.backed_up {
            let line = match disk.action {
                DiskAction::Restore => format!(
                    "RESTORE: {} from {} to {}",
                    disk.unique_name, disk.last_snapshot, disk.destination
                ),
                DiskAction::Rollback => format!(
                    "ROLLBACK: {} to {}@{}",
                    disk.unique_name, disk.destination, reference
                ),
                DiskAction::Keep => format!("KEEP DATA: {}", disk.unique_name),
                DiskAction::Skip => format!("SKIP: {}", disk.unique_name),
                DiskAction::Pending => format!(
                    "WARNING: Disk {} does not exist locally and was set to don't restore. The {} will be restored but the config will most likely be broken!",
                    disk.unique_name,
                    group.guest_type.label()
                ),
            };
            lines.push(line);
        }
        for extra in &group.non_backed_up {
            match extra.action {
                ExtraDiskAction::Recreate => lines.push(format!(
                    "RECREATE: {} to {}",
                    extra.unique_name, extra.destination
                )),
                ExtraDiskAction::Leave | ExtraDiskAction::Pending => {
                    lines.push(format!("DON'T RECREATE: {}", extra.unique_name))
                }
                ExtraDiskAction::Present => {}
            }
        }
    }
    lines
}
