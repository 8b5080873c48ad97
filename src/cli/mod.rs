use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use chrono::Local;
use tracing_subscriber::EnvFilter;

use crate::cli::args::{Cli, Command};
use crate::cli::commands::{exit_for_error, restore, sanitize, sync, CommandContext};
use crate::config::load::load_settings;
use crate::lock::{CancelToken, LockCoordinator};
use crate::signal_handler::signal_handler;
use crate::types::RunMode;
use crate::util::command::Runner;
use crate::util::host::current_lock_identity;

const CONFIG_FILE: &str = "/etc/pve-zsync-manager.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod args;
pub mod commands;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    print_banner();
    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let settings = match load_settings(&config_path) {
        Ok(settings) => settings,
        Err(err) => exit_for_error(&err),
    };
    let run_mode = RunMode {
        dry_run: cli.dry_run,
        verbose: cli.verbose,
    };

    let runner = Runner::system(run_mode);
    let coordinator = Arc::new(LockCoordinator::new(
        runner.clone(),
        &settings,
        current_lock_identity(),
    ));
    let cancel = CancelToken::new();
    signal_handler(&cancel, &coordinator);

    let ctx = CommandContext {
        settings,
        runner,
        coordinator,
        cancel,
    };
    let result = match cli.command {
        Command::Restore(args) => restore::run_restore_command(&ctx, args),
        Command::Sync(args) => sync::run_sync_command(&ctx, args),
        Command::Sanitize(args) => sanitize::run_sanitize_command(&ctx, args),
    };
    if let Err(err) = result {
        exit_for_error(&err);
    }
    Ok(())
}

fn print_banner() {
    println!(
        "pve-zsync-manager {} - {}",
        VERSION,
        Local::now().format("%d-%m-%Y %H:%M")
    );
}

/// `info` by default, `debug` with `--verbose`; `RUST_LOG` wins over both.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
