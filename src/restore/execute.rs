use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{error, info, warn};

use crate::error::{PzmError, Result};
use crate::guest::config_doc::references_disk;
use crate::guest::storage::{disk_key, disk_options, storage_pool};
use crate::guest::{config_file_path, GuestCommand};
use crate::restore::consistency::{backup_path, ConsistencyChecker};
use crate::restore::disk::{BackedUpDisk, DiskAction, DiskGroup, ExtraDiskAction, NonBackedUpDisk};
use crate::restore::size::{convert_to_gib, size_option};
use crate::types::GuestType;
use crate::util::command::{CommandOutput, Runner};
use crate::zfs::{send_receive, Zfs};

/// Where and how to restore from.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub hostname: String,
    pub config_path: String,
    pub keyfile: Option<PathBuf>,
    pub replicate: bool,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub finished: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

fn expect_success(out: CommandOutput, what: &str) -> Result<CommandOutput> {
    if out.success() {
        return Ok(out);
    }
    out.log_failure();
    Err(PzmError::message(format!("{} failed with exit code {}", what, out.code)))
}

/// Applies a confirmed plan, one guest at a time.
pub struct RestoreExecutor<'a> {
    runner: &'a Runner,
    pve_root: &'a Path,
    options: &'a RestoreOptions,
}

impl<'a> RestoreExecutor<'a> {
    pub fn new(runner: &'a Runner, pve_root: &'a Path, options: &'a RestoreOptions) -> Self {
        Self {
            runner,
            pve_root,
            options,
        }
    }

    /// A failing guest is reported and the next one is processed.
    pub fn execute(&self, groups: &[DiskGroup]) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        for group in groups {
            let label = group.guest_type.label();
            if group.skip {
                info!("{} {} skipped", label, group.id);
                report.skipped.push(group.id.clone());
                continue;
            }
            info!("{} {} preparing", label, group.id);
            match self.restore_group(group) {
                Ok(()) => {
                    info!("{} {} finished", label, group.id);
                    report.finished.push(group.id.clone());
                }
                Err(err) => {
                    error!("{} {} failed: {}", label, group.id, err);
                    report.failed.push((group.id.clone(), err.to_string()));
                }
            }
        }
        report
    }

    fn restore_group(&self, group: &DiskGroup) -> Result<()> {
        let guest = GuestCommand::new(self.runner, group.guest_type);
        let config_file = config_file_path(self.pve_root, group.guest_type, &group.id);
        let last_config = group
            .last_config()
            .ok_or_else(|| PzmError::message(format!("no config for guest {}", group.id)))?;

        guest.shutdown(&group.id)?;
        guest.lock_backup(&group.id)?;

        let result = self.restore_locked(group, &guest, &config_file, last_config);
        let unlocked = guest.unlock(&group.id);
        match (result, unlocked) {
            (Err(err), _) => Err(err),
            (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(out)) => expect_success(out, "guest unlock").map(|_| ()),
        }
    }

    /// Everything that runs while the guest carries the backup lock.
    fn restore_locked(
        &self,
        group: &DiskGroup,
        guest: &GuestCommand<'_>,
        config_file: &Path,
        last_config: &str,
    ) -> Result<()> {
        let backup = backup_path(config_file);
        if let Err(err) = self.move_file(config_file, &backup) {
            warn!("could not move {} aside: {}", config_file.display(), err);
        }
        let source = format!(
            "root@{}:{}/{}",
            self.options.hostname,
            self.options.config_path.trim_end_matches('/'),
            last_config
        );
        let out = self
            .runner
            .run(Command::new("scp").arg("-B").arg(&source).arg(config_file))?;
        if !out.success() {
            out.log_failure();
            if let Err(err) = self.move_file(&backup, config_file) {
                error!("could not put {} back: {}", config_file.display(), err);
            }
            return Err(PzmError::message(format!("copying {} failed", source)));
        }

        self.restore_disks(group, guest)?;
        self.recreate_disks(group, guest)?;

        let report = ConsistencyChecker::new(self.runner).reconcile(group, config_file, guest)?;
        if report.failed_destroys > 0 {
            warn!("{} {}: {} snapshot(s) could not be destroyed", group.guest_type.label(), group.id, report.failed_destroys);
        }
        Ok(())
    }

    fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.runner.run_mode().dry_run {
            info!("dry-run: mv {} {}", from.display(), to.display());
            return Ok(());
        }
        fs::rename(from, to)
    }

    fn restore_disks(&self, group: &DiskGroup, guest: &GuestCommand<'_>) -> Result<()> {
        let local = Zfs::local(self.runner);
        let reference = group
            .reference_suffix()
            .ok_or_else(|| PzmError::message(format!("guest {} has no disk to restore", group.id)))?;

        let live_config = if !self.options.replicate && group.guest_type == GuestType::Container {
            let out = guest.config(&group.id)?;
            out.success().then_some(out.stdout)
        } else {
            None
        };

        for disk in &group.backed_up {
            let label = group.guest_type.label();
            let result = match disk.action {
                DiskAction::Restore => {
                    info!("{} {}: restoring {}", label, group.id, disk.destination);
                    self.restore_disk(disk, live_config.as_deref())
                }
                DiskAction::Rollback => {
                    info!("{} {}: rolling back {} to {}", label, group.id, disk.destination, reference);
                    local
                        .rollback(&format!("{}@{}", disk.destination, reference))
                        .and_then(|out| expect_success(out, "zfs rollback"))
                        .map(|_| ())
                }
                DiskAction::Keep => {
                    info!("{} {}: destroying snapshots newer than {} on {}", label, group.id, reference, disk.destination);
                    self.destroy_newer_snapshots(&disk.destination, reference).map(|_| ())
                }
                DiskAction::Skip | DiskAction::Pending => Ok(()),
            };
            if let Err(err) = result {
                error!("{} {}: {}: {}", label, group.id, disk.unique_name, err);
            }
        }
        Ok(())
    }

    fn restore_disk(&self, disk: &BackedUpDisk, live_config: Option<&str>) -> Result<()> {
        let local = Zfs::local(self.runner);
        let remote = Zfs::remote(self.runner, &self.options.hostname);

        if local.exists(&disk.destination)? {
            expect_success(local.destroy(&disk.destination, true)?, "zfs destroy")?;
        }

        let remote_encrypted = self.options.replicate && remote.is_encrypted(&disk.full_name)?;
        let flags = match (self.options.replicate, remote_encrypted) {
            (true, true) => "-Rw",
            (true, false) => "-R",
            _ => "",
        };
        expect_success(
            send_receive(
                self.runner,
                &self.options.hostname,
                &disk.last_snapshot,
                flags,
                &disk.destination,
            )?,
            "zfs send | zfs recv",
        )?;

        if let Some(keyfile) = &self.options.keyfile {
            if remote_encrypted {
                let location = format!("keylocation=file://{}", keyfile.display());
                expect_success(local.set(&location, &disk.destination)?, "zfs set keylocation")?;
                expect_success(local.load_key(&disk.destination)?, "zfs load-key")?;
                if let Some((parent, _)) = disk.destination.rsplit_once('/') {
                    if local.is_encrypted(parent)? {
                        expect_success(local.inherit_key(&disk.destination)?, "zfs change-key")?;
                    }
                }
            }
        }

        if disk.guest_type == GuestType::Container {
            if local.is_mounted(&disk.destination)? == Some(false) {
                expect_success(local.mount(&disk.destination)?, "zfs mount")?;
            }
            if let Some(config) = live_config {
                self.apply_refquota(disk, config);
            }
        }
        Ok(())
    }

    fn apply_refquota(&self, disk: &BackedUpDisk, config: &str) {
        let Some(line) = config
            .lines()
            .find(|line| references_disk(line, &disk.unique_name))
        else {
            warn!("{} not found in live config, refquota not set", disk.unique_name);
            return;
        };
        let options = disk_options(line);
        let Some(size) = size_option(&options) else {
            warn!("{} has no size option, refquota not set", disk.unique_name);
            return;
        };
        let local = Zfs::local(self.runner);
        match local.set(&format!("refquota={}", size), &disk.destination) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!("could not set refquota on {}: {}", disk.destination, out.stderr.trim()),
            Err(err) => warn!("could not set refquota on {}: {}", disk.destination, err),
        }
    }

    /// Destroys every snapshot of `dataset` taken after `@reference`.
    pub fn destroy_newer_snapshots(&self, dataset: &str, reference: &str) -> Result<usize> {
        let local = Zfs::local(self.runner);
        let snapshots = local.snapshots(dataset)?;
        let target = format!("{}@{}", dataset, reference);
        let position = snapshots
            .iter()
            .position(|snap| *snap == target)
            .ok_or_else(|| PzmError::message(format!("{} does not exist", target)))?;
        let mut destroyed = 0;
        for snapshot in &snapshots[position + 1..] {
            let out = local.destroy(snapshot, false)?;
            if out.success() {
                destroyed += 1;
            } else {
                out.log_failure();
            }
        }
        Ok(destroyed)
    }

    fn recreate_disks(&self, group: &DiskGroup, guest: &GuestCommand<'_>) -> Result<()> {
        if group.non_backed_up.is_empty() {
            return Ok(());
        }
        guest.unlock(&group.id)?;
        for extra in &group.non_backed_up {
            if extra.action != ExtraDiskAction::Recreate {
                continue;
            }
            info!("{} {}: recreating {}", group.guest_type.label(), group.id, extra.unique_name);
            if let Err(err) = self.recreate_disk(&group.id, extra, guest) {
                error!("{} {}: {}", group.guest_type.label(), group.id, err);
            }
        }
        guest.lock_backup(&group.id)?;
        Ok(())
    }

    fn recreate_disk(&self, id: &str, extra: &NonBackedUpDisk, guest: &GuestCommand<'_>) -> Result<()> {
        let key = disk_key(&extra.config_line)
            .ok_or_else(|| PzmError::message(format!("cannot parse {:?}", extra.config_line)))?;
        let options = disk_options(&extra.config_line);
        let raw = size_option(&options)
            .ok_or_else(|| PzmError::message(format!("{} has no size option", extra.unique_name)))?;
        let size = convert_to_gib(raw).ok_or_else(|| {
            PzmError::message(format!("can't convert {} to GiB, can't recreate {}", raw, extra.unique_name))
        })?;
        let value = format!(
            "{}:{},{}",
            storage_pool(&extra.unique_name),
            size,
            options.join(",")
        );
        expect_success(guest.set_option(id, key, &value)?, "attaching disk")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::disk::sample_disk;
    use crate::testing::{dry_runner, runner, ScriptedRunner};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn options() -> RestoreOptions {
        RestoreOptions {
            hostname: "backup01".to_string(),
            config_path: "/var/lib/pve-zsync".to_string(),
            keyfile: None,
            replicate: false,
        }
    }

    fn keep_group() -> DiskGroup {
        let config = "100.conf.lxc.rep_tag_2024-01-01_00:00:01";
        let mut group = DiskGroup::new("100", GuestType::Container);
        let mut root = sample_disk("100", 0, config, "tag_2024-01-01");
        root.action = DiskAction::Restore;
        let mut data = sample_disk("100", 1, config, "tag_2024-01-01");
        data.action = DiskAction::Keep;
        group.backed_up = vec![root, data];
        group
    }

    fn scp_writes(scripted: &ScriptedRunner, target: PathBuf, text: &'static str) {
        scripted.on_effect("scp -B", 0, "", move |_| {
            fs::write(&target, text).unwrap();
        });
    }

    #[test]
    fn keep_destroys_only_newer_snapshots() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lxc")).unwrap();
        let config_file = dir.path().join("lxc/100.conf");
        fs::write(&config_file, "old\n").unwrap();

        let scripted = Arc::new(ScriptedRunner::new());
        scp_writes(&scripted, config_file.clone(), "rootfs: vmssd:subvol-100-disk-0,size=8G\n");
        scripted.on(
            "zfs list -t snapshot -H -o name -s creation vmssd/subvol-100-disk-1",
            0,
            "vmssd/subvol-100-disk-1@tag_2023-12-31\nvmssd/subvol-100-disk-1@tag_2024-01-01\nvmssd/subvol-100-disk-1@tag_2024-01-02\nvmssd/subvol-100-disk-1@tag_2024-01-03\n",
        );
        scripted.on("zfs list vmssd/subvol-100-disk-0", 1, "");
        scripted.on("pct config 100", 0, "rootfs: vmssd:subvol-100-disk-0,size=8G\n");
        let runner = runner(&scripted);
        let options = options();
        let group = keep_group();

        let report = RestoreExecutor::new(&runner, dir.path(), &options).execute(std::slice::from_ref(&group));

        assert_eq!(report.finished, vec!["100".to_string()]);
        let destroyed: Vec<String> = scripted.calls_matching("zfs destroy vmssd/subvol-100-disk-1@");
        assert_eq!(
            destroyed,
            vec![
                "zfs destroy vmssd/subvol-100-disk-1@tag_2024-01-02".to_string(),
                "zfs destroy vmssd/subvol-100-disk-1@tag_2024-01-03".to_string(),
            ]
        );
        assert!(scripted.calls_matching("zfs rollback").is_empty());
        assert_eq!(group.backed_up[0].action, DiskAction::Restore);
        assert_eq!(group.backed_up[1].action, DiskAction::Keep);
        assert_eq!(
            scripted.calls_matching("zfs recv"),
            vec!["bash -c set -o pipefail; ssh -o \"BatchMode yes\" root@backup01 zfs send backup/subvol-100-disk-0@tag_2024-01-01 | zfs recv -F vmssd/subvol-100-disk-0".to_string()]
        );
        assert_eq!(scripted.calls_matching("zfs set refquota=8G vmssd/subvol-100-disk-0").len(), 1);
        assert_eq!(fs::read_to_string(backup_path(&config_file)).unwrap(), "old\n");
    }

    #[test]
    fn failed_copy_puts_config_back_and_continues() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lxc")).unwrap();
        let config_file = dir.path().join("lxc/100.conf");
        fs::write(&config_file, "old\n").unwrap();

        let scripted = Arc::new(ScriptedRunner::new());
        scripted.on("scp -B", 1, "");
        let runner = runner(&scripted);
        let options = options();
        let mut skipped = DiskGroup::new("200", GuestType::Vm);
        skipped.skip = true;

        let report = RestoreExecutor::new(&runner, dir.path(), &options).execute(&[keep_group(), skipped]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped, vec!["200".to_string()]);
        assert_eq!(fs::read_to_string(&config_file).unwrap(), "old\n");
        assert!(!backup_path(&config_file).exists());
        assert!(scripted.calls_matching("zfs recv").is_empty());
        assert_eq!(scripted.calls_matching("pct set 100 --lock=backup").len(), 1);
        assert_eq!(scripted.calls_matching("pct unlock 100"), vec!["pct unlock 100".to_string()]);
    }

    #[test]
    fn reconcile_error_still_unlocks_guest() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lxc")).unwrap();
        let config_file = dir.path().join("lxc/100.conf");
        fs::write(&config_file, "old\n").unwrap();

        // scp succeeds without writing, so the restored config is missing
        let scripted = Arc::new(ScriptedRunner::new());
        let runner = runner(&scripted);
        let options = options();

        let report = RestoreExecutor::new(&runner, dir.path(), &options).execute(&[keep_group()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "100");
        assert!(!scripted.calls_matching("pct unlock 100").is_empty());
    }

    #[test]
    fn replicated_encrypted_restore_loads_key() {
        let scripted = Arc::new(ScriptedRunner::new());
        scripted.on("root@backup01 zfs get encryption", 0, "aes-256-gcm\n");
        scripted.on("zfs get encryption -H -o value vmssd", 0, "aes-256-gcm\n");
        scripted.on("zfs get mounted", 0, "no\n");
        scripted.on("zfs list vmssd/subvol-100-disk-0", 0, "");
        let runner = runner(&scripted);
        let mut options = options();
        options.replicate = true;
        options.keyfile = Some(PathBuf::from("/root/key"));
        let executor = RestoreExecutor::new(&runner, Path::new("/etc/pve"), &options);
        let disk = sample_disk("100", 0, "c", "tag_2024-01-01");

        executor.restore_disk(&disk, None).unwrap();

        let calls = scripted.calls();
        let mutating: Vec<&String> = calls
            .iter()
            .filter(|c| !c.contains(" get ") && !c.starts_with("zfs list"))
            .collect();
        assert_eq!(
            mutating,
            vec![
                "zfs destroy -r vmssd/subvol-100-disk-0",
                "bash -c set -o pipefail; ssh -o \"BatchMode yes\" root@backup01 zfs send -Rw backup/subvol-100-disk-0@tag_2024-01-01 | zfs recv -F vmssd/subvol-100-disk-0",
                "zfs set keylocation=file:///root/key vmssd/subvol-100-disk-0",
                "zfs load-key vmssd/subvol-100-disk-0",
                "zfs change-key -i vmssd/subvol-100-disk-0",
                "zfs mount vmssd/subvol-100-disk-0",
            ]
        );
    }

    #[test]
    fn recreate_normalizes_size() {
        let scripted = Arc::new(ScriptedRunner::new());
        let runner = runner(&scripted);
        let options = options();
        let executor = RestoreExecutor::new(&runner, Path::new("/etc/pve"), &options);
        let mut group = keep_group();
        for (n, size) in [(2, "2T"), (3, "8X")] {
            group.non_backed_up.push(NonBackedUpDisk {
                unique_name: format!("vmsys:subvol-100-disk-{}", n),
                config_line: format!("mp{}: vmsys:subvol-100-disk-{},mp=/d{},size={}", n, n, n, size),
                destination: format!("vmsys/subvol-100-disk-{}", n),
                action: ExtraDiskAction::Recreate,
            });
        }
        let guest = GuestCommand::new(&runner, GuestType::Container);
        executor.recreate_disks(&group, &guest).unwrap();

        assert_eq!(
            scripted.calls(),
            vec![
                "pct unlock 100",
                "pct set 100 --mp2 vmsys:2048,mp=/d2,size=2T",
                "pct set 100 --lock=backup",
            ]
        );
    }

    #[test]
    fn dry_run_changes_nothing() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lxc")).unwrap();
        let config_file = dir.path().join("lxc/100.conf");
        fs::write(&config_file, "rootfs: vmssd:subvol-100-disk-0,size=8G\n").unwrap();
        let scripted = Arc::new(ScriptedRunner::new());
        scripted.on(
            "zfs list -t snapshot",
            0,
            "vmssd/subvol-100-disk-1@tag_2024-01-01\nvmssd/subvol-100-disk-1@tag_2024-01-02\n",
        );
        let runner = dry_runner(&scripted);
        let options = options();

        let report = RestoreExecutor::new(&runner, dir.path(), &options).execute(&[keep_group()]);
        assert_eq!(report.finished.len(), 1);
        assert!(!backup_path(&config_file).exists());
        assert!(scripted
            .calls()
            .iter()
            .all(|c| c.starts_with("zfs list") || c.contains(" get ") || c.starts_with("pct config") || c.starts_with("pct listsnapshot")));
    }
}
