use std::process::Command;

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn mentions(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }
}

/// Seam for every external tool the installer drives.
///
/// `Err` means the process could not be started at all; a non-zero exit
/// status is reported through `CommandOutput::status`.
pub trait CommandRunner {
    fn run(&self, command: &mut Command) -> Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, command: &mut Command) -> Result<CommandOutput> {
        let output = command
            .output()
            .with_context(|| format!("failed to start {}", describe_command(command)))?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub(crate) fn run_checked(
    runner: &dyn CommandRunner,
    command: &mut Command,
    context_message: &str,
) -> Result<CommandOutput> {
    let output = runner
        .run(command)
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.success() {
        return Ok(output);
    }

    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        render_status(output.status),
        output.stdout.trim(),
        output.stderr.trim()
    ))
}

pub(crate) fn describe_command(command: &Command) -> String {
    let mut rendered = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

fn render_status(status: Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}
