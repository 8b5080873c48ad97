use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "pve-zsync-manager",
    version,
    about = "Lock-coordinated ZFS backup, restore and repair of Proxmox VE guests"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Only show what would be done; mutating commands are not executed
    #[arg(long, alias = "test", global = true)]
    pub dry_run: bool,
    #[arg(long, short = 'v', alias = "debug", global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Restore guests from a pve-zsync backup host
    Restore(RestoreArgs),
    /// Back up guests with pve-zsync
    Sync(SyncArgs),
    /// Roll remote backup snapshots back to the newest local one
    Sanitize(SanitizeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    /// Backup source host
    #[arg(long)]
    pub hostname: String,
    /// ZFS pool holding the backups on the source host
    #[arg(long)]
    pub zfs_source_pool: String,
    /// Name of the pve-zsync snapshots
    #[arg(long)]
    pub backupname: String,
    /// Directory on the source host holding the guest config copies
    #[arg(long)]
    pub config_path: String,
    /// Key file used to inherit the ZFS key after a raw restore
    #[arg(long)]
    pub keyfile: Option<PathBuf>,
    /// Only consider datasets containing this string
    #[arg(long)]
    pub filter: Option<String>,
    /// Receive the full replication stream, all snapshots and properties
    #[arg(long)]
    pub replicate: bool,
    /// Give up waiting for the lock after this many seconds
    #[arg(long)]
    pub lock_timeout: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Destination host for backups
    #[arg(long)]
    pub hostname: String,
    /// Destination ZFS pool
    #[arg(long)]
    pub zfspool: String,
    #[arg(long)]
    pub backupname: String,
    /// Guest IDs separated by commas, or `all` with optional `-<id>` exclusions
    #[arg(long, allow_hyphen_values = true)]
    pub ids: String,
    #[arg(long)]
    pub dest_config_path: Option<String>,
    #[arg(long)]
    pub replicate: bool,
    /// Send encrypted datasets raw
    #[arg(long)]
    pub raw: bool,
    #[arg(long)]
    pub properties: bool,
    /// Snapshots to keep
    #[arg(long, default_value_t = 1)]
    pub maxsnap: u32,
    /// Retries of a failed guest, each preceded by a sanitize
    #[arg(long, default_value_t = 0)]
    pub retries: u32,
    /// Put each disk under `<pool>/<storage-id>/` on the destination
    #[arg(long)]
    pub prepend_storage_id: bool,
    #[arg(long)]
    pub lock_timeout: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct SanitizeArgs {
    #[arg(long)]
    pub hostname: String,
    #[arg(long)]
    pub zfspool: String,
    #[arg(long)]
    pub backupname: String,
    #[arg(long, allow_hyphen_values = true)]
    pub ids: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_accepts_exclusions_and_test_alias() {
        let cli = Cli::try_parse_from([
            "pve-zsync-manager",
            "sync",
            "--hostname",
            "backup01",
            "--zfspool",
            "tank",
            "--backupname",
            "rep_daily",
            "--ids",
            "all,-101",
            "--retries",
            "2",
            "--test",
        ])
        .unwrap();
        assert!(cli.dry_run);
        match cli.command {
            Command::Sync(args) => {
                assert_eq!(args.ids, "all,-101");
                assert_eq!(args.retries, 2);
                assert_eq!(args.maxsnap, 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn restore_requires_config_path() {
        let err = Cli::try_parse_from([
            "pve-zsync-manager",
            "restore",
            "--hostname",
            "backup01",
            "--zfs-source-pool",
            "tank",
            "--backupname",
            "rep_daily",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
