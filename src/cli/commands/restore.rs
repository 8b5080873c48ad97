use std::time::Duration;

use tracing::{error, info};

use crate::cli::args::RestoreArgs;
use crate::cli::commands::CommandContext;
use crate::error::{PzmError, Result};
use crate::restore::{run_restore, RestoreOptions, RestoreRequest};
use crate::util::prompt::StdinPrompter;

pub fn run_restore_command(ctx: &CommandContext, args: RestoreArgs) -> Result<()> {
    let request = RestoreRequest {
        options: RestoreOptions {
            hostname: args.hostname,
            config_path: args.config_path,
            keyfile: args.keyfile,
            replicate: args.replicate,
        },
        source_pool: args.zfs_source_pool,
        backup_name: args.backupname,
        filter: args.filter,
        lock_timeout: args.lock_timeout.map(Duration::from_secs),
    };
    let mut prompter = StdinPrompter;
    let report = run_restore(
        &request,
        &ctx.runner,
        &mut prompter,
        &ctx.coordinator,
        &ctx.cancel,
        &ctx.settings.pve_root,
    )?;

    for id in &report.finished {
        info!("ID {} restored", id);
    }
    for (id, reason) in &report.failed {
        error!("ID {} failed: {}", id, reason);
    }
    if !report.failed.is_empty() {
        return Err(PzmError::message(format!(
            "{} guest(s) could not be restored",
            report.failed.len()
        )));
    }
    Ok(())
}
