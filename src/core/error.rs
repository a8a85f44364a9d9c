use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    StageFileMissing,
    StageMissingVariable,
    StageInvalidLine,

    ValidationMissingArgument,
    ValidationInvalidArgument,

    InstallFailed,
    MaterializeWriteFailed,
    SyncFailed,

    ProxySpawnFailed,
    ProxyNotReady,

    RemoteCommandFailed,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::StageFileMissing => "stage.file_missing",
            ErrorCode::StageMissingVariable => "stage.missing_variable",
            ErrorCode::StageInvalidLine => "stage.invalid_line",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::InstallFailed => "install.failed",
            ErrorCode::MaterializeWriteFailed => "materialize.write_failed",
            ErrorCode::SyncFailed => "sync.failed",

            ErrorCode::ProxySpawnFailed => "proxy.spawn_failed",
            ErrorCode::ProxyNotReady => "proxy.not_ready",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFileMissingDetails {
    pub project_id: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingVariableDetails {
    pub keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidLineDetails {
    pub path: String,
    pub line: usize,
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingArgumentDetails {
    pub args: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallFailedDetails {
    pub target_dir: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFailedDetails {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailedDetails {
    pub path: String,
    pub error: String,
    pub copied_before_failure: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpawnFailedDetails {
    pub binary: String,
    pub instance: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyNotReadyDetails {
    pub socket_path: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn stage_file_missing(project_id: impl Into<String>, path: impl Into<String>) -> Self {
        let project_id = project_id.into();
        let path = path.into();
        Self::new(
            ErrorCode::StageFileMissing,
            format!("Stage file not found for project '{}'", project_id),
            to_details(StageFileMissingDetails {
                project_id,
                path: path.clone(),
            }),
        )
        .with_hint(format!("Create {} before running a reset", path))
    }

    pub fn stage_missing_variable(keys: Vec<String>, path: Option<String>) -> Self {
        let message = format!("Stage is missing required variable(s): {}", keys.join(", "));
        Self::new(
            ErrorCode::StageMissingVariable,
            message,
            to_details(MissingVariableDetails { keys, path }),
        )
    }

    pub fn stage_invalid_line(
        path: impl Into<String>,
        line: usize,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCode::StageInvalidLine,
            format!("Unparseable line {} in stage file", line),
            to_details(InvalidLineDetails {
                path: path.into(),
                line,
                content: content.into(),
            }),
        )
        .with_hint("Stage files hold one key=value assignment per line")
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ValidationMissingArgument,
            "Missing required argument",
            to_details(MissingArgumentDetails { args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self::new(
            ErrorCode::ValidationInvalidArgument,
            "Invalid argument",
            to_details(InvalidArgumentDetails {
                field: field.into(),
                problem: problem.into(),
                value,
            }),
        )
    }

    pub fn install_failed(details: InstallFailedDetails) -> Self {
        let message = format!("SDK installation failed: {}", details.problem);
        Self::new(ErrorCode::InstallFailed, message, to_details(details))
    }

    pub fn materialize_write_failed(path: impl Into<String>, error: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::MaterializeWriteFailed,
            format!("Failed to write generated config {}", path),
            to_details(WriteFailedDetails {
                path,
                error: error.into(),
            }),
        )
    }

    pub fn sync_failed(
        path: impl Into<String>,
        error: impl Into<String>,
        copied_before_failure: usize,
    ) -> Self {
        Self::new(
            ErrorCode::SyncFailed,
            "Workspace sync failed",
            to_details(SyncFailedDetails {
                path: path.into(),
                error: error.into(),
                copied_before_failure,
            }),
        )
        .with_hint("The working directory may be partially synced; re-running is safe")
    }

    pub fn proxy_spawn_failed(details: ProxySpawnFailedDetails) -> Self {
        Self::new(
            ErrorCode::ProxySpawnFailed,
            "Database proxy failed to start",
            to_details(details),
        )
    }

    pub fn proxy_not_ready(socket_path: impl Into<String>, timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::ProxyNotReady,
            "Database proxy socket did not appear in time",
            to_details(ProxyNotReadyDetails {
                socket_path: socket_path.into(),
                timeout_ms,
            }),
        )
        .with_hint("Raise STAGE_RESET_PROXY_TIMEOUT_SECS or check the instance connection name")
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        Self::new(
            ErrorCode::RemoteCommandFailed,
            "Reset command failed",
            to_details(details),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalIoError,
            "IO error",
            to_details(InternalIoErrorDetails {
                error: error.into(),
                context,
            }),
        )
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalJsonError,
            "JSON error",
            serde_json::json!({ "error": error.into(), "context": context }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::internal_unexpected(message)
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    /// Exit code of the external tool that caused this error, if any.
    pub fn tool_exit_code(&self) -> Option<i32> {
        self.details
            .get("exitCode")
            .and_then(Value::as_i64)
            .map(|code| code as i32)
    }
}
