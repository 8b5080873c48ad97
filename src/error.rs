use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PzmError {
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Lock(LockError),
    #[error("{0}")]
    Config(ConfigError),
    #[error("{0}")]
    Command(CommandError),
    #[error("restore aborted by user")]
    Aborted,
    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse config: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock acquisition cancelled")]
    Cancelled,
    #[error("timed out waiting for lock on {0}")]
    TimedOut(String),
    #[error("lock file {path}: {message}")]
    Marker { path: String, message: String },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{program}: {message}")]
    Spawn { program: String, message: String },
    #[error("{command} failed with exit code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },
}

pub type Result<T> = std::result::Result<T, PzmError>;

impl PzmError {
    pub fn message(msg: impl Into<String>) -> Self {
        PzmError::Message(msg.into())
    }
}

impl From<LockError> for PzmError {
    fn from(err: LockError) -> Self {
        PzmError::Lock(err)
    }
}

impl From<ConfigError> for PzmError {
    fn from(err: ConfigError) -> Self {
        PzmError::Config(err)
    }
}

impl From<CommandError> for PzmError {
    fn from(err: CommandError) -> Self {
        PzmError::Command(err)
    }
}
