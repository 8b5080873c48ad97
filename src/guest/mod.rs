pub mod config_doc;
pub mod storage;

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::Result;
use crate::types::GuestType;
use crate::util::command::{CommandOutput, Runner};

/// Live config file of a guest, e.g. `/etc/pve/lxc/100.conf`.
pub fn config_file_path(pve_root: &Path, guest_type: GuestType, id: &str) -> PathBuf {
    pve_root
        .join(guest_type.config_dir())
        .join(format!("{}.conf", id))
}

/// `pct`/`qm` verbs used by restore and sync.
#[derive(Clone, Copy)]
pub struct GuestCommand<'a> {
    runner: &'a Runner,
    guest_type: GuestType,
}

impl<'a> GuestCommand<'a> {
    pub fn new(runner: &'a Runner, guest_type: GuestType) -> Self {
        Self { runner, guest_type }
    }

    fn command(&self) -> Command {
        Command::new(self.guest_type.command())
    }

    /// IDs from `pct list` / `qm list`, header skipped.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let out = self.runner.read(self.command().arg("list"))?;
        Ok(out
            .lines()
            .iter()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    pub fn config(&self, id: &str) -> Result<CommandOutput> {
        self.runner.read(self.command().arg("config").arg(id))
    }

    pub fn snapshot_config(&self, id: &str, snapshot: &str) -> Result<CommandOutput> {
        self.runner
            .read(self.command().arg("config").arg(id).arg("--snapshot").arg(snapshot))
    }

    /// Snapshot names known to the management layer, without `current`.
    pub fn list_snapshots(&self, id: &str) -> Result<Vec<String>> {
        let out = self.runner.read(self.command().arg("listsnapshot").arg(id))?;
        Ok(parse_snapshot_listing(&out.stdout))
    }

    pub fn delete_snapshot(&self, id: &str, snapshot: &str) -> Result<CommandOutput> {
        self.runner
            .run(self.command().arg("delsnapshot").arg(id).arg(snapshot))
    }

    pub fn shutdown(&self, id: &str) -> Result<CommandOutput> {
        self.runner.run(self.command().arg("shutdown").arg(id))
    }

    pub fn lock_backup(&self, id: &str) -> Result<CommandOutput> {
        self.runner
            .run(self.command().arg("set").arg(id).arg("--lock=backup"))
    }

    pub fn unlock(&self, id: &str) -> Result<CommandOutput> {
        self.runner.run(self.command().arg("unlock").arg(id))
    }

    /// `set <id> --<key> <value>`, e.g. to attach a fresh disk.
    pub fn set_option(&self, id: &str, key: &str, value: &str) -> Result<CommandOutput> {
        self.runner.run(
            self.command()
                .arg("set")
                .arg(id)
                .arg(format!("--{}", key))
                .arg(value),
        )
    }
}

/// Parses `listsnapshot` output. Lines look like
/// `` `-> autodaily_2024-01-01   2024-01-01 00:00:01   description``;
/// the tree marker is optional and the `current` pseudo snapshot is dropped.
pub fn parse_snapshot_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let first = tokens.next()?;
            let name = if first.ends_with("->") {
                tokens.next()?
            } else {
                first
            };
            Some(name.to_string())
        })
        .filter(|name| name != "current")
        .collect()
}
