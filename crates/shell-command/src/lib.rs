//! `sh -c` execution behind a replaceable runner, shared by the photo cache
//! (HEIC conversion) and the frame agent (screen power commands).

use std::process::{Command, ExitStatus};
use std::sync::Arc;

use anyhow::{Context, Result};

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Runs one shell command line. Tests swap in stubs.
pub type CommandRunner = Arc<dyn Fn(&str) -> Result<CommandOutput> + Send + Sync>;

pub fn shell_runner() -> CommandRunner {
    Arc::new(|command: &str| run_shell(command))
}

fn run_shell(command: &str) -> Result<CommandOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("failed to spawn shell for command: {command}"))?;

    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
