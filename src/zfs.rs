use std::process::Command;

use crate::error::{PzmError, Result};
use crate::util::command::{pipeline, ssh, CommandOutput, Runner};

/// Part of a snapshot name after `@`.
pub fn snapshot_suffix(snapshot: &str) -> &str {
    snapshot.split_once('@').map(|(_, s)| s).unwrap_or(snapshot)
}

/// Last path segment of a dataset name.
pub fn leaf_name(dataset: &str) -> &str {
    dataset.rsplit('/').next().unwrap_or(dataset)
}

/// `zfs` on this host, or on `remote` over ssh.
#[derive(Clone, Copy)]
pub struct Zfs<'a> {
    runner: &'a Runner,
    remote: Option<&'a str>,
}

impl<'a> Zfs<'a> {
    pub fn local(runner: &'a Runner) -> Self {
        Self {
            runner,
            remote: None,
        }
    }

    pub fn remote(runner: &'a Runner, hostname: &'a str) -> Self {
        Self {
            runner,
            remote: Some(hostname),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        match self.remote {
            Some(hostname) => ssh(hostname, std::iter::once("zfs").chain(args.iter().copied())),
            None => {
                let mut cmd = Command::new("zfs");
                cmd.args(args);
                cmd
            }
        }
    }

    /// All dataset names on the host; fails unless `pool` is among them.
    pub fn datasets_in_pool(&self, pool: &str) -> Result<Vec<String>> {
        let mut cmd = self.command(&["list", "-rH", "-o", "name"]);
        let out = self.runner.read(&mut cmd)?;
        if !out.success() || !out.stderr.trim().is_empty() {
            return Err(PzmError::message(format!(
                "(SSH) Error while getting zfs list names: {}",
                out.stderr.trim()
            )));
        }
        let names: Vec<String> = out.lines().iter().map(|l| l.trim().to_string()).collect();
        let prefix = format!("{}/", pool);
        if !names.iter().any(|n| n == pool || n.starts_with(&prefix)) {
            return Err(PzmError::message(format!(
                "ZFS pool {} does not exist on {}",
                pool,
                self.remote.unwrap_or("localhost")
            )));
        }
        Ok(names)
    }

    /// Full snapshot names of `dataset`, oldest first.
    pub fn snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let mut cmd = self.command(&["list", "-t", "snapshot", "-H", "-o", "name", "-s", "creation", dataset]);
        let out = self.runner.read_checked(&mut cmd)?;
        Ok(out.lines().iter().map(|l| l.trim().to_string()).collect())
    }

    pub fn exists(&self, dataset: &str) -> Result<bool> {
        let out = self.runner.read(&mut self.command(&["list", dataset]))?;
        Ok(out.success())
    }

    /// Unknown or failing lookups count as unencrypted.
    pub fn is_encrypted(&self, dataset: &str) -> Result<bool> {
        let out = self
            .runner
            .read(&mut self.command(&["get", "encryption", "-H", "-o", "value", dataset]))?;
        Ok(out.success() && !out.stdout.contains("off") && !out.stdout.trim().is_empty())
    }

    pub fn is_mounted(&self, dataset: &str) -> Result<Option<bool>> {
        let out = self
            .runner
            .read(&mut self.command(&["get", "mounted", "-H", "-o", "value", dataset]))?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(out.stdout.trim() == "yes"))
    }

    pub fn destroy(&self, target: &str, recursive: bool) -> Result<CommandOutput> {
        let mut args = vec!["destroy"];
        if recursive {
            args.push("-r");
        }
        args.push(target);
        self.runner.run(&mut self.command(&args))
    }

    pub fn rollback(&self, snapshot: &str) -> Result<CommandOutput> {
        self.runner.run(&mut self.command(&["rollback", "-r", snapshot]))
    }

    pub fn mount(&self, dataset: &str) -> Result<CommandOutput> {
        self.runner.run(&mut self.command(&["mount", dataset]))
    }

    pub fn set(&self, property: &str, dataset: &str) -> Result<CommandOutput> {
        self.runner.run(&mut self.command(&["set", property, dataset]))
    }

    pub fn load_key(&self, dataset: &str) -> Result<CommandOutput> {
        self.runner.run(&mut self.command(&["load-key", dataset]))
    }

    /// Makes `dataset` inherit its key from the parent encryption root.
    pub fn inherit_key(&self, dataset: &str) -> Result<CommandOutput> {
        self.runner.run(&mut self.command(&["change-key", "-i", dataset]))
    }
}

/// `ssh root@<host> zfs send <flags> <snapshot> | zfs recv -F <dest>`
pub fn send_receive(
    runner: &Runner,
    hostname: &str,
    snapshot: &str,
    send_flags: &str,
    destination: &str,
) -> Result<CommandOutput> {
    let mut send = format!("ssh -o \"BatchMode yes\" root@{} zfs send", hostname);
    if !send_flags.is_empty() {
        send.push(' ');
        send.push_str(send_flags);
    }
    let script = format!("{} {} | zfs recv -F {}", send, snapshot, destination);
    runner.run(&mut pipeline(&script))
}
