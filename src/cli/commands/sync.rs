use std::time::Duration;

use crate::cli::args::SyncArgs;
use crate::cli::commands::CommandContext;
use crate::error::{PzmError, Result};
use crate::sync::ids::IdSelection;
use crate::sync::{run_sync, SyncRequest};

pub fn run_sync_command(ctx: &CommandContext, args: SyncArgs) -> Result<()> {
    let ids: IdSelection = args.ids.parse()?;
    let request = SyncRequest {
        hostname: args.hostname,
        pool: args.zfspool,
        backup_name: args.backupname,
        ids,
        dest_config_path: args.dest_config_path,
        replicate: args.replicate,
        raw: args.raw,
        properties: args.properties,
        maxsnap: args.maxsnap,
        retries: args.retries,
        prepend_storage_id: args.prepend_storage_id,
        lock_timeout: args.lock_timeout.map(Duration::from_secs),
    };
    let report = run_sync(
        &request,
        &ctx.runner,
        &ctx.coordinator,
        &ctx.cancel,
        ctx.settings.sync_retry_delay,
    )?;
    if report.failed() > 0 {
        return Err(PzmError::message(format!(
            "{} guest(s) failed to sync",
            report.failed()
        )));
    }
    Ok(())
}
