use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::error::{LockError, Result};
use crate::util::command::{ssh, Runner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Free,
    HeldBy(String),
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCreate {
    Created,
    Refused(String),
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRemove {
    Removed,
    Missing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCreate {
    Created,
    /// The marker already carries our identity: the remote side of a backup
    /// to this very host wrote it a moment ago.
    AlreadyOurs,
    HeldBy(String),
}

/// The marker file on the remote host, reached over ssh.
pub struct RemoteMarker<'a> {
    pub hostname: &'a str,
    pub path: &'a Path,
}

impl RemoteMarker<'_> {
    /// `cat` exits 1 when the file is missing; anything but 0 or 1 means
    /// ssh itself failed.
    pub fn check(&self, runner: &Runner) -> Result<RemoteState> {
        let out = runner.read(&mut ssh(
            self.hostname,
            ["cat".to_string(), self.path.display().to_string()],
        ))?;
        Ok(match out.code {
            0 => RemoteState::HeldBy(out.stdout.trim().to_string()),
            1 => RemoteState::Free,
            _ => RemoteState::Unreachable(out.stderr.trim().to_string()),
        })
    }

    pub fn create(&self, runner: &Runner, identity: &str) -> Result<RemoteCreate> {
        let path = self.path.display();
        let script = format!("echo -n {identity} > {path} && chattr +i {path}");
        let out = runner.run(&mut ssh(self.hostname, [script]))?;
        Ok(match out.code {
            0 => RemoteCreate::Created,
            1 => RemoteCreate::Refused(out.stderr.trim().to_string()),
            _ => RemoteCreate::Unreachable(out.stderr.trim().to_string()),
        })
    }

    pub fn remove(&self, runner: &Runner) -> Result<RemoteRemove> {
        let path = self.path.display();
        let script = format!("chattr -i {path} ; rm {path}");
        let out = runner.run(&mut ssh(self.hostname, [script]))?;
        Ok(match out.code {
            0 => RemoteRemove::Removed,
            1 => RemoteRemove::Missing,
            _ => RemoteRemove::Failed(out.stderr.trim().to_string()),
        })
    }
}

/// The marker file on this host.
pub struct LocalMarker {
    pub path: PathBuf,
}

impl LocalMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn holder(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text.trim().to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.marker_error(err).into()),
        }
    }

    pub fn create(&self, runner: &Runner, identity: &str) -> Result<LocalCreate> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut f) => {
                write!(f, "{}", identity).map_err(|e| self.marker_error(e))?;
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Ok(match self.holder()? {
                    Some(holder) if holder.to_ascii_lowercase() == identity => {
                        debug!("local lock already held by this process");
                        LocalCreate::AlreadyOurs
                    }
                    Some(holder) => LocalCreate::HeldBy(holder),
                    None => LocalCreate::HeldBy("<vanished>".to_string()),
                });
            }
            Err(err) => return Err(self.marker_error(err).into()),
        }
        let out = runner.run(Command::new("chattr").arg("+i").arg(&self.path))?;
        if !out.success() {
            warn!(
                "chattr +i {} failed: {}",
                self.path.display(),
                out.stderr.trim()
            );
        }
        Ok(LocalCreate::Created)
    }

    /// Returns false when there was nothing to remove.
    pub fn remove(&self, runner: &Runner) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let out = runner.run(Command::new("chattr").arg("-i").arg(&self.path))?;
        if !out.success() {
            warn!(
                "chattr -i {} failed: {}",
                self.path.display(),
                out.stderr.trim()
            );
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.marker_error(err).into()),
        }
    }

    fn marker_error(&self, err: io::Error) -> LockError {
        LockError::Marker {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }
}
