//! Process-level settings read once from the environment.
//!
//! Everything a run needs that is not part of the stage descriptor lives
//! here. Settings are immutable after construction.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_STAGES_SUBDIR: &str = "scripts/variables/stages";
pub const DEFAULT_SOCKET_DIR: &str = "/tmp/cloudsql";
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PYTHON: &str = "python";
pub const GCLOUD_SDK_VERSION: &str = "470.0.0";

pub struct EnvKeys;

impl EnvKeys {
    pub const PROJECT_ID: &'static str = "project_id";
    pub const PROJECT_ID_UPPER: &'static str = "PROJECT_ID";
    pub const SOURCE_DIR: &'static str = "STAGE_RESET_SOURCE_DIR";
    pub const STAGES_DIR: &'static str = "STAGE_RESET_STAGES_DIR";
    pub const GCLOUD_SDK_DIR: &'static str = "gcloud_sdk_dir";
    pub const CLOUD_SQL_PROXY: &'static str = "cloud_sql_proxy";
    pub const SOCKET_DIR: &'static str = "STAGE_RESET_SOCKET_DIR";
    pub const PROXY_TIMEOUT_SECS: &'static str = "STAGE_RESET_PROXY_TIMEOUT_SECS";
    pub const SDK_URL: &'static str = "STAGE_RESET_SDK_URL";
    pub const SDK_SHA256: &'static str = "STAGE_RESET_SDK_SHA256";
    pub const PYTHON: &'static str = "STAGE_RESET_PYTHON";
}

pub fn default_sdk_url() -> String {
    format!(
        "https://dl.google.com/dl/cloudsdk/channels/rapid/downloads/google-cloud-sdk-{}-linux-x86_64.tar.gz",
        GCLOUD_SDK_VERSION
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub project_id: String,
    pub source_dir: PathBuf,
    pub stages_dir: PathBuf,
    pub gcloud_sdk_dir_override: Option<String>,
    pub cloud_sql_proxy_override: Option<String>,
    pub socket_dir: PathBuf,
    pub proxy_timeout: Duration,
    pub sdk_url: String,
    pub sdk_sha256: Option<String>,
    pub python: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| {
            Error::internal_io(e.to_string(), Some("resolve current dir".to_string()))
        })?;
        Self::from_lookup(|key| std::env::var(key).ok(), cwd)
    }

    /// Build settings from an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F, cwd: PathBuf) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let project_id = get(EnvKeys::PROJECT_ID)
            .or_else(|| get(EnvKeys::PROJECT_ID_UPPER))
            .ok_or_else(|| {
                Error::validation_missing_argument(vec![EnvKeys::PROJECT_ID.to_string()])
                    .with_hint("Export project_id=<cloud project id> before running")
            })?;

        if project_id.contains('/') || project_id.contains("..") {
            return Err(Error::validation_invalid_argument(
                EnvKeys::PROJECT_ID,
                "Project id must not contain path separators",
                Some(project_id),
            ));
        }

        let source_dir = get(EnvKeys::SOURCE_DIR)
            .map(PathBuf::from)
            .unwrap_or(cwd);

        let stages_dir = get(EnvKeys::STAGES_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| source_dir.join(DEFAULT_STAGES_SUBDIR));

        let proxy_timeout = match get(EnvKeys::PROXY_TIMEOUT_SECS) {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    Error::validation_invalid_argument(
                        EnvKeys::PROXY_TIMEOUT_SECS,
                        "Expected a whole number of seconds",
                        Some(raw.clone()),
                    )
                })?;
                if secs == 0 {
                    return Err(Error::validation_invalid_argument(
                        EnvKeys::PROXY_TIMEOUT_SECS,
                        "Timeout must be greater than zero",
                        Some(raw),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_PROXY_TIMEOUT_SECS),
        };

        Ok(Self {
            project_id,
            source_dir,
            stages_dir,
            gcloud_sdk_dir_override: get(EnvKeys::GCLOUD_SDK_DIR),
            cloud_sql_proxy_override: get(EnvKeys::CLOUD_SQL_PROXY),
            socket_dir: get(EnvKeys::SOCKET_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_DIR)),
            proxy_timeout,
            sdk_url: get(EnvKeys::SDK_URL).unwrap_or_else(default_sdk_url),
            sdk_sha256: get(EnvKeys::SDK_SHA256).map(|s| s.trim().to_lowercase()),
            python: get(EnvKeys::PYTHON).unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
        })
    }

    /// Path of the stage descriptor for the configured project.
    pub fn stage_file(&self) -> PathBuf {
        self.stages_dir.join(format!("{}.sh", self.project_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| env.get(k).cloned(), PathBuf::from("/src"))
    }

    #[test]
    fn defaults_apply_with_only_project_id() {
        let s = settings(&[("project_id", "acme-prod")]).unwrap();
        assert_eq!(s.project_id, "acme-prod");
        assert_eq!(s.source_dir, PathBuf::from("/src"));
        assert_eq!(s.stages_dir, PathBuf::from("/src/scripts/variables/stages"));
        assert_eq!(s.stage_file(), PathBuf::from("/src/scripts/variables/stages/acme-prod.sh"));
        assert_eq!(s.socket_dir, PathBuf::from(DEFAULT_SOCKET_DIR));
        assert_eq!(s.proxy_timeout, Duration::from_secs(30));
        assert_eq!(s.python, "python");
        assert!(s.sdk_url.contains(GCLOUD_SDK_VERSION));
        assert!(s.gcloud_sdk_dir_override.is_none());
    }

    #[test]
    fn uppercase_project_id_is_accepted() {
        let s = settings(&[("PROJECT_ID", "acme-dev")]).unwrap();
        assert_eq!(s.project_id, "acme-dev");
    }

    #[test]
    fn missing_project_id_is_a_validation_error() {
        let err = settings(&[]).unwrap_err();
        assert_eq!(err.code.as_str(), "validation.missing_argument");
    }

    #[test]
    fn project_id_with_separator_is_rejected() {
        let err = settings(&[("project_id", "../etc")]).unwrap_err();
        assert_eq!(err.code.as_str(), "validation.invalid_argument");
    }

    #[test]
    fn overrides_are_read() {
        let s = settings(&[
            ("project_id", "p"),
            ("gcloud_sdk_dir", "/opt/sdk"),
            ("cloud_sql_proxy", "/usr/local/bin/proxy"),
            ("STAGE_RESET_PROXY_TIMEOUT_SECS", "5"),
            ("STAGE_RESET_SDK_SHA256", " ABCDEF "),
            ("STAGE_RESET_SOCKET_DIR", "/run/sql"),
        ])
        .unwrap();
        assert_eq!(s.gcloud_sdk_dir_override.as_deref(), Some("/opt/sdk"));
        assert_eq!(s.cloud_sql_proxy_override.as_deref(), Some("/usr/local/bin/proxy"));
        assert_eq!(s.proxy_timeout, Duration::from_secs(5));
        assert_eq!(s.sdk_sha256.as_deref(), Some("abcdef"));
        assert_eq!(s.socket_dir, PathBuf::from("/run/sql"));
    }

    #[test]
    fn invalid_timeout_is_rejected() {
        let err = settings(&[("project_id", "p"), ("STAGE_RESET_PROXY_TIMEOUT_SECS", "soon")])
            .unwrap_err();
        assert_eq!(err.code.as_str(), "validation.invalid_argument");

        let err = settings(&[("project_id", "p"), ("STAGE_RESET_PROXY_TIMEOUT_SECS", "0")])
            .unwrap_err();
        assert_eq!(err.code.as_str(), "validation.invalid_argument");
    }
}
