//! Command execution primitives with consistent error handling.

use serde::Serialize;
use std::path::Path;
use std::process::{Command, Output};

use crate::error::{Error, Result};

/// Captured result of a finished external command.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

impl CommandOutput {
    fn from_output(output: &Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
        }
    }

    /// Stderr if present, stdout otherwise.
    pub fn error_text(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.trim().to_string()
        } else {
            self.stdout.trim().to_string()
        }
    }
}

/// Run a program to completion, capturing its output.
///
/// Only a failure to launch is an `Err`; a non-zero exit is reported through
/// `CommandOutput::success` so callers can map it to their own error code.
pub fn execute(
    program: &str,
    args: &[String],
    current_dir: Option<&Path>,
    env: &[(String, String)],
    context: &str,
) -> Result<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args);

    if let Some(dir) = current_dir {
        cmd.current_dir(dir);
    }

    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let output = cmd.output().map_err(|e| {
        Error::internal_io(
            format!("Failed to run {}: {}", context, e),
            Some(context.to_string()),
        )
    })?;

    Ok(CommandOutput::from_output(&output))
}

/// Render a program and its arguments as a single display string.
pub fn display(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}
