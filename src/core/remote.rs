//! Administrative command invocation against the synced application.

use serde::Serialize;
use std::path::PathBuf;

use crate::error::{Error, RemoteCommandFailedDetails, Result};
use crate::utils::command;

pub const RESET_PIPELINES_COMMAND: &str = "reset_pipelines";
pub const FLASK_APP: &str = "run_ibackend.py";
pub const BACKENDS_DIR: &str = "backends";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl RemoteCommand {
    /// `python -m flask reset_pipelines` inside `<workdir>/backends`.
    pub fn reset_pipelines(
        python: &str,
        workdir: &std::path::Path,
        gcloud_sdk_dir: &std::path::Path,
        service_account: &std::path::Path,
    ) -> Self {
        let python_path = format!(
            "{}:lib",
            gcloud_sdk_dir.join("platform/google_appengine").display()
        );

        Self {
            program: python.to_string(),
            args: vec![
                "-m".to_string(),
                "flask".to_string(),
                RESET_PIPELINES_COMMAND.to_string(),
            ],
            current_dir: workdir.join(BACKENDS_DIR),
            env: vec![
                ("FLASK_APP".to_string(), FLASK_APP.to_string()),
                ("PYTHONPATH".to_string(), python_path),
                (
                    "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                    service_account.display().to_string(),
                ),
            ],
        }
    }

    pub fn display(&self) -> String {
        command::display(&self.program, &self.args)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOutcome {
    pub command: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
}

/// Run `cmd` once. Only pass/fail is interpreted; there is no retry.
pub fn invoke(cmd: &RemoteCommand) -> Result<RemoteOutcome> {
    let command_line = cmd.display();
    tracing::info!(
        command = %command_line,
        dir = %cmd.current_dir.display(),
        "Invoking reset command"
    );

    let output = command::execute(
        &cmd.program,
        &cmd.args,
        Some(&cmd.current_dir),
        &cmd.env,
        "reset command",
    )?;

    if !output.success {
        tracing::warn!(
            command = %command_line,
            exit_code = output.exit_code,
            "Reset command failed"
        );
        return Err(Error::remote_command_failed(RemoteCommandFailedDetails {
            command: command_line,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        }));
    }

    Ok(RemoteOutcome {
        command: command_line,
        exit_code: output.exit_code,
        stdout: output.stdout.trim().to_string(),
    })
}
