//! Restore of guests from a pve-zsync backup host.
//!
//! Remote datasets are discovered and grouped by guest, the operator
//! decides per disk, and the confirmed plan is applied under the shared
//! lock. Afterwards each guest config is reconciled with the snapshots that
//! actually exist.

pub mod catalog;
pub mod consistency;
pub mod disk;
pub mod execute;
pub mod group;
pub mod plan;
pub mod size;

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{PzmError, Result};
use crate::lock::{CancelToken, LockCoordinator, LockGuard};
use crate::restore::catalog::DiskCatalog;
use crate::restore::disk::DiskGroup;
use crate::restore::execute::{ExecutionReport, RestoreExecutor};
use crate::restore::group::{find_extra_disks, group_disks};
use crate::restore::plan::build_plan;
use crate::util::command::Runner;
use crate::util::prompt::Prompter;
use crate::zfs::Zfs;

pub use execute::RestoreOptions;

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub options: RestoreOptions,
    pub source_pool: String,
    pub backup_name: String,
    pub filter: Option<String>,
    pub lock_timeout: Option<Duration>,
}

/// Discovers, groups and asks. Returns the confirmed groups, or
/// `PzmError::Aborted` when the operator declines.
pub fn prepare_plan(
    request: &RestoreRequest,
    runner: &Runner,
    prompter: &mut dyn Prompter,
) -> Result<Vec<DiskGroup>> {
    let options = &request.options;
    let mut catalog = DiskCatalog::new(runner, &options.hostname, &options.config_path);
    let disks = catalog.discover(
        &request.source_pool,
        &request.backup_name,
        request.filter.as_deref(),
    )?;
    let mut groups = group_disks(disks);
    attach_extra_disks(&mut groups, &mut catalog, runner);
    let (readable, unreadable): (Vec<DiskGroup>, Vec<DiskGroup>) =
        groups.into_iter().partition(|group| !group.skip);
    for group in &unreadable {
        info!("{} {} will not be restored", group.guest_type.label(), group.id);
    }
    if readable.is_empty() {
        return Ok(Vec::new());
    }
    build_plan(readable, prompter, runner)?.ok_or(PzmError::Aborted)
}

/// Looks up the non-backed-up disks of every group. A group whose remote
/// config cannot be read is marked skipped.
fn attach_extra_disks(groups: &mut [DiskGroup], catalog: &mut DiskCatalog<'_>, runner: &Runner) {
    for group in groups.iter_mut() {
        if let Err(err) = find_extra_disks(group, catalog, runner) {
            warn!("{} {}: skipping, remote config unreadable: {}", group.guest_type.label(), group.id, err);
            group.skip = true;
        }
    }
}

/// Full restore run: plan, lock, execute, unlock. Dry runs do not lock.
pub fn run_restore(
    request: &RestoreRequest,
    runner: &Runner,
    prompter: &mut dyn Prompter,
    coordinator: &LockCoordinator,
    cancel: &CancelToken,
    pve_root: &std::path::Path,
) -> Result<ExecutionReport> {
    // the remote pool has to exist before anything is asked
    Zfs::remote(runner, &request.options.hostname).datasets_in_pool(&request.source_pool)?;

    let groups = prepare_plan(request, runner, prompter)?;
    if groups.is_empty() {
        info!("nothing to restore");
        return Ok(ExecutionReport::default());
    }

    let executor = RestoreExecutor::new(runner, pve_root, &request.options);
    if runner.run_mode().dry_run {
        info!("dry-run: not locking {}", request.options.hostname);
        return Ok(executor.execute(&groups));
    }

    let deadline = request.lock_timeout.map(|timeout| Instant::now() + timeout);
    let handle = coordinator.acquire(&request.options.hostname, cancel, deadline)?;
    let guard = LockGuard::new(coordinator, handle);
    let report = executor.execute(&groups);
    guard.release()?;
    Ok(report)
}
