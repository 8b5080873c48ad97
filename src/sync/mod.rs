//! Backup of local guests to a remote pool through `pve-zsync sync`, and the
//! repair step (`sanitize`) that lets a failed incremental send be retried.

pub mod ids;
pub mod sanitize;

use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::error::{PzmError, Result};
use crate::lock::{CancelToken, LockCoordinator, LockGuard};
use crate::sync::ids::IdSelection;
use crate::sync::sanitize::{run_sanitize, SanitizeRequest};
use crate::util::command::{render_command, CommandOutput, Runner};
use crate::util::host::is_local_host;
use crate::zfs::Zfs;

/// pve-zsync reports guests without ZFS disks this way; not a failure.
const NO_ZFS_DISK: &str = "include no disk on zfs";
const SLEEP_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub hostname: String,
    pub pool: String,
    pub backup_name: String,
    pub ids: IdSelection,
    pub dest_config_path: Option<String>,
    pub replicate: bool,
    pub raw: bool,
    pub properties: bool,
    pub maxsnap: u32,
    pub retries: u32,
    pub prepend_storage_id: bool,
    pub lock_timeout: Option<Duration>,
}

impl SyncRequest {
    /// `host:pool`, or just the pool when the target is this machine.
    pub fn destination(&self) -> String {
        if is_local_host(&self.hostname) {
            self.pool.clone()
        } else {
            format!("{}:{}", self.hostname, self.pool)
        }
    }

    pub fn pve_zsync_command(&self, id: &str) -> Command {
        let mut cmd = Command::new("pve-zsync");
        cmd.arg("sync")
            .args(["--source", id])
            .args(["--dest", &self.destination()])
            .args(["--name", &self.backup_name])
            .args(["--maxsnap", &self.maxsnap.to_string()])
            .args(["--method", "ssh"])
            .args(["--source-user", "root"])
            .args(["--dest-user", "root"])
            .arg("--verbose");
        if let Some(path) = &self.dest_config_path {
            cmd.args(["--dest-config-path", path]);
        }
        if self.replicate {
            cmd.arg("--replicate");
        }
        if self.raw {
            cmd.arg("--raw");
        }
        if self.properties {
            cmd.arg("--properties");
        }
        if self.prepend_storage_id {
            cmd.arg("--prepend-storage-id");
        }
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Ok { attempts: u32 },
    Failed { attempts: u32 },
    /// The guest has no disk on ZFS.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub id: String,
    pub status: SyncStatus,
    pub duration: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub outcomes: Vec<SyncOutcome>,
    pub total: chrono::Duration,
}

impl SyncReport {
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, SyncStatus::Failed { .. }))
            .count()
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|outcome| {
                let label = match outcome.status {
                    SyncStatus::Ok { .. } => "OK!",
                    SyncStatus::Failed { .. } => "ERROR",
                    SyncStatus::Skipped => return None,
                };
                Some(format!(
                    "ID {} - {} - Took {}",
                    outcome.id,
                    label,
                    format_duration(outcome.duration)
                ))
            })
            .collect();
        lines.push(format!("Finished in {}", format_duration(self.total)));
        lines
    }
}

/// `H:MM:SS`
pub fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Selects the guests, takes the lock and backs every guest up in turn.
/// Dry runs do not lock.
pub fn run_sync(
    request: &SyncRequest,
    runner: &Runner,
    coordinator: &LockCoordinator,
    cancel: &CancelToken,
    retry_delay: Duration,
) -> Result<SyncReport> {
    Zfs::remote(runner, &request.hostname).datasets_in_pool(&request.pool)?;

    let ids: Vec<String> = request
        .ids
        .resolve(runner)?
        .into_iter()
        .map(|guest| guest.id)
        .collect();
    debug!("IDs to back up: {:?}", ids);
    if ids.is_empty() {
        info!("no guests selected");
        return Ok(SyncReport {
            outcomes: Vec::new(),
            total: chrono::Duration::zero(),
        });
    }

    if runner.run_mode().dry_run {
        info!("dry-run: not locking {}", request.hostname);
        return sync_guests(request, runner, cancel, retry_delay, &ids);
    }
    let deadline = request.lock_timeout.map(|timeout| Instant::now() + timeout);
    let handle = coordinator.acquire(&request.hostname, cancel, deadline)?;
    let guard = LockGuard::new(coordinator, handle);
    let report = sync_guests(request, runner, cancel, retry_delay, &ids);
    guard.release()?;
    let report = report?;
    info!("Backup/Sync finished");
    Ok(report)
}

fn sync_guests(
    request: &SyncRequest,
    runner: &Runner,
    cancel: &CancelToken,
    retry_delay: Duration,
    ids: &[String],
) -> Result<SyncReport> {
    info!(
        "Backing up to {}:{}@{} {} replication, config path: {}",
        request.hostname,
        request.pool,
        request.backup_name,
        if request.replicate { "with" } else { "without" },
        request.dest_config_path.as_deref().unwrap_or("default")
    );
    let started = Local::now();
    let mut outcomes = Vec::new();
    for id in ids {
        outcomes.push(sync_guest(request, runner, cancel, retry_delay, id)?);
    }
    let report = SyncReport {
        outcomes,
        total: Local::now() - started,
    };
    for line in report.summary_lines() {
        info!("{}", line);
    }
    Ok(report)
}

fn sync_guest(
    request: &SyncRequest,
    runner: &Runner,
    cancel: &CancelToken,
    retry_delay: Duration,
    id: &str,
) -> Result<SyncOutcome> {
    info!("ID {} syncing...", id);
    let started = Local::now();
    let mut cmd = request.pve_zsync_command(id);
    let mut out = runner.run(&mut cmd)?;
    let mut tries = 0;
    while !out.success() && tries < request.retries && !out.stderr.contains(NO_ZFS_DISK) {
        tries += 1;
        warn!("ID {} failed, will retry after {}s...", id, retry_delay.as_secs());
        sleep_unless_cancelled(retry_delay, cancel)?;
        info!("Sanitizing remote side...");
        let sanitize = SanitizeRequest {
            hostname: request.hostname.clone(),
            pool: request.pool.clone(),
            backup_name: request.backup_name.clone(),
            ids: IdSelection::Explicit(vec![id.to_string()]),
        };
        if let Err(err) = run_sanitize(&sanitize, runner) {
            warn!("ID {}: sanitize failed: {}", id, err);
        }
        info!("Retrying backup...");
        out = runner.run(&mut cmd)?;
    }
    let duration = Local::now() - started;
    let status = classify(&out, tries + 1);

    match status {
        SyncStatus::Ok { attempts } => info!(
            "ID {} done successfully with {} attempts. Took {}",
            id,
            attempts,
            format_duration(duration)
        ),
        SyncStatus::Failed { attempts } => {
            out.log_failure();
            error!(
                "Command \"{}\" failed {} times, no retries left",
                render_command(&cmd),
                attempts
            );
        }
        SyncStatus::Skipped => info!("ID {} has no disk on ZFS, skipped", id),
    }
    Ok(SyncOutcome {
        id: id.to_string(),
        status,
        duration,
    })
}

fn classify(out: &CommandOutput, attempts: u32) -> SyncStatus {
    if out.success() {
        SyncStatus::Ok { attempts }
    } else if out.stderr.contains(NO_ZFS_DISK) {
        SyncStatus::Skipped
    } else {
        SyncStatus::Failed { attempts }
    }
}

fn sleep_unless_cancelled(duration: Duration, cancel: &CancelToken) -> Result<()> {
    let until = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(PzmError::message("sync cancelled"));
        }
        let now = Instant::now();
        if now >= until {
            return Ok(());
        }
        thread::sleep(SLEEP_SLICE.min(until - now));
    }
}
