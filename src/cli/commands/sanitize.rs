use tracing::info;

use crate::cli::args::SanitizeArgs;
use crate::cli::commands::CommandContext;
use crate::error::Result;
use crate::sync::sanitize::{run_sanitize, SanitizeRequest};
use crate::zfs::Zfs;

pub fn run_sanitize_command(ctx: &CommandContext, args: SanitizeArgs) -> Result<()> {
    let request = SanitizeRequest {
        ids: args.ids.parse()?,
        hostname: args.hostname,
        pool: args.zfspool,
        backup_name: args.backupname,
    };
    Zfs::remote(&ctx.runner, &request.hostname).datasets_in_pool(&request.pool)?;
    let report = run_sanitize(&request, &ctx.runner)?;
    info!(
        "checked {} disk(s), rolled back {}",
        report.checked,
        report.rolled_back.len()
    );
    for snapshot in &report.rolled_back {
        println!("{}", snapshot);
    }
    Ok(())
}
