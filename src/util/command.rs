use std::process::Command;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::{CommandError, Result};
use crate::types::RunMode;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Non-empty stdout lines, in order.
    pub fn lines(&self) -> Vec<&str> {
        self.stdout
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .collect()
    }

    pub fn log_failure(&self) {
        if !self.stdout.trim().is_empty() {
            error!("{}", self.stdout.trim_end());
        }
        if !self.stderr.trim().is_empty() {
            error!("{}", self.stderr.trim_end());
        }
    }
}

/// Spawns a command and captures its exit code and output.
pub trait CommandRunner: Send + Sync {
    fn output(&self, cmd: &mut Command) -> std::io::Result<CommandOutput>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn output(&self, cmd: &mut Command) -> std::io::Result<CommandOutput> {
        let output = cmd.output()?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub fn render_command(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy();
    let args: Vec<String> = cmd
        .get_args()
        .map(|a| a.to_string_lossy().to_string())
        .collect();
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// `ssh -o "BatchMode yes" root@<host> <args...>`
pub fn ssh<I, S>(hostname: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = Command::new("ssh");
    cmd.arg("-o")
        .arg("BatchMode yes")
        .arg(format!("root@{}", hostname))
        .args(args);
    cmd
}

/// Runs a pipeline through bash so the exit code reflects every stage.
pub fn pipeline(script: &str) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(format!("set -o pipefail; {}", script));
    cmd
}

/// Command runner bound to the run mode. Mutating commands go through
/// [`Runner::run`] and are suppressed in dry-run; read-only commands go
/// through [`Runner::read`] and always execute.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<dyn CommandRunner>,
    run_mode: RunMode,
}

impl Runner {
    pub fn new(inner: Arc<dyn CommandRunner>, run_mode: RunMode) -> Self {
        Self { inner, run_mode }
    }

    pub fn system(run_mode: RunMode) -> Self {
        Self::new(Arc::new(SystemRunner), run_mode)
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    pub fn run(&self, cmd: &mut Command) -> Result<CommandOutput> {
        if self.run_mode.dry_run {
            info!("dry-run: {}", render_command(cmd));
            return Ok(CommandOutput::default());
        }
        self.spawn(cmd)
    }

    pub fn read(&self, cmd: &mut Command) -> Result<CommandOutput> {
        self.spawn(cmd)
    }

    pub fn read_checked(&self, cmd: &mut Command) -> Result<CommandOutput> {
        let output = self.read(cmd)?;
        if !output.success() {
            return Err(CommandError::Failed {
                command: render_command(cmd),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    fn spawn(&self, cmd: &mut Command) -> Result<CommandOutput> {
        debug!("exec: {}", render_command(cmd));
        self.inner.output(cmd).map_err(|e| {
            CommandError::Spawn {
                program: cmd.get_program().to_string_lossy().to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }
}
