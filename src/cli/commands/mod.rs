pub mod restore;
pub mod sanitize;
pub mod sync;

use std::sync::Arc;

use crate::config::model::Settings;
use crate::error::PzmError;
use crate::lock::{CancelToken, LockCoordinator};
use crate::util::command::Runner;

/// Everything a subcommand needs besides its own arguments.
pub struct CommandContext {
    pub settings: Settings,
    pub runner: Runner,
    pub coordinator: Arc<LockCoordinator>,
    pub cancel: CancelToken,
}

pub fn exit_code(err: &PzmError) -> i32 {
    match err {
        PzmError::Lock(_) => 3,
        PzmError::Config(_) => 2,
        PzmError::Aborted => 4,
        _ => 1,
    }
}

pub fn exit_for_error(err: &PzmError) -> ! {
    println!("{}", err);
    std::process::exit(exit_code(err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, LockError};

    #[test]
    fn exit_codes_by_error_kind() {
        assert_eq!(exit_code(&LockError::TimedOut("backup01".to_string()).into()), 3);
        assert_eq!(exit_code(&ConfigError::Invalid("ids".to_string()).into()), 2);
        assert_eq!(exit_code(&PzmError::Aborted), 4);
        assert_eq!(exit_code(&PzmError::message("zfs failed")), 1);
    }
}
