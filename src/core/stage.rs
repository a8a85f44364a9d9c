//! Stage descriptors: per-project `key=value` files in shell syntax.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::settings::Settings;
use crate::utils::io;

pub struct StageKeys;

impl StageKeys {
    pub const WORKDIR: &'static str = "workdir";
    pub const SERVICE_ACCOUNT_FILE: &'static str = "service_account_file";
    pub const NOTIFICATION_SENDER_EMAIL: &'static str = "notification_sender_email";
    pub const APP_TITLE: &'static str = "app_title";
    pub const DB_USERNAME: &'static str = "db_username";
    pub const DB_PASSWORD: &'static str = "db_password";
    pub const DB_NAME: &'static str = "db_name";
    pub const DB_INSTANCE_CONN_NAME: &'static str = "db_instance_conn_name";
    pub const CLOUD_SQL_PROXY: &'static str = "cloud_sql_proxy";
    pub const GCLOUD_SDK_DIR: &'static str = "gcloud_sdk_dir";
    pub const DB_DRIVER: &'static str = "db_driver";
}

pub const REQUIRED_KEYS: &[&str] = &[
    StageKeys::WORKDIR,
    StageKeys::SERVICE_ACCOUNT_FILE,
    StageKeys::NOTIFICATION_SENDER_EMAIL,
    StageKeys::APP_TITLE,
    StageKeys::DB_USERNAME,
    StageKeys::DB_PASSWORD,
    StageKeys::DB_NAME,
    StageKeys::DB_INSTANCE_CONN_NAME,
    StageKeys::CLOUD_SQL_PROXY,
    StageKeys::GCLOUD_SDK_DIR,
];

static ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)=(.*)$").unwrap());

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDescriptor {
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip)]
    vars: Vec<(String, String)>,
}

impl StageDescriptor {
    pub fn from_pairs(project_id: &str, pairs: &[(&str, &str)]) -> Self {
        Self {
            project_id: project_id.to_string(),
            path: None,
            vars: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Value of `key`; the last assignment wins, as in a sourced script.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::stage_missing_variable(vec![key.to_string()], self.path.clone()))
    }

    /// Fail with every absent key at once.
    pub fn require_all(&self, keys: &[&str]) -> Result<()> {
        let missing: Vec<String> = keys
            .iter()
            .filter(|key| self.get(key).is_none())
            .map(|key| key.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::stage_missing_variable(missing, self.path.clone()))
        }
    }

    /// All variables as a map, for template rendering.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.vars.iter().cloned().collect()
    }
}

/// Load the stage descriptor named by `settings.project_id`.
///
/// Nothing on disk is touched when the file is missing.
pub fn load(settings: &Settings) -> Result<StageDescriptor> {
    let path = settings.stage_file();
    if !path.is_file() {
        return Err(Error::stage_file_missing(
            settings.project_id.clone(),
            path.display().to_string(),
        ));
    }

    let content = io::read_file(&path, "read stage file")?;
    let env = |key: &str| std::env::var(key).ok();
    parse(&content, &settings.project_id, Some(&path), &env)
}

/// Parse stage file content.
///
/// `$var` and `${var}` resolve against earlier assignments, then
/// `project_id`, then `env`. Single-quoted values are literal.
pub fn parse(
    content: &str,
    project_id: &str,
    path: Option<&Path>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<StageDescriptor> {
    let display_path = path.map(|p| p.display().to_string());
    let mut vars: Vec<(String, String)> = Vec::new();

    for (idx, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let invalid = || {
            Error::stage_invalid_line(
                display_path.clone().unwrap_or_else(|| "<inline>".to_string()),
                idx + 1,
                raw_line,
            )
        };

        let caps = ASSIGNMENT.captures(line).ok_or_else(invalid)?;
        let key = caps[1].to_string();
        let raw_value = caps[2].trim();

        let value = match classify(raw_value).ok_or_else(invalid)? {
            RawValue::Literal(text) => text.to_string(),
            RawValue::Expandable(text) => {
                let lookup = |name: &str| -> Option<String> {
                    vars.iter()
                        .rev()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v.clone())
                        .or_else(|| (name == "project_id").then(|| project_id.to_string()))
                        .or_else(|| env(name))
                };
                expand_value(text, || env("HOME"), lookup)
            }
        };

        vars.push((key, value));
    }

    Ok(StageDescriptor {
        project_id: project_id.to_string(),
        path: display_path,
        vars,
    })
}

/// Expand variables and a leading `~`. Backslash before `$`, `` ` ``, `"` or
/// `\` yields that character literally; unset variables expand to nothing.
fn expand_value(
    text: &str,
    home: impl Fn() -> Option<String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> String {
    let context = |name: &str| Some(lookup(name).unwrap_or_default());
    let mut expanded = String::with_capacity(text.len());
    let mut pending = String::new();
    let mut leading = true;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next @ ('$' | '`' | '"' | '\\')) = chars.peek() {
                chars.next();
                expanded.push_str(&expand_chunk(&pending, leading, &home, &context));
                pending.clear();
                leading = false;
                expanded.push(next);
                continue;
            }
        }
        pending.push(c);
    }
    expanded.push_str(&expand_chunk(&pending, leading, &home, &context));
    expanded
}

fn expand_chunk(
    chunk: &str,
    leading: bool,
    home: &dyn Fn() -> Option<String>,
    context: &dyn Fn(&str) -> Option<String>,
) -> String {
    if leading {
        shellexpand::full_with_context_no_errors(chunk, home, context).into_owned()
    } else {
        shellexpand::env_with_context_no_errors(chunk, context).into_owned()
    }
}

enum RawValue<'a> {
    Literal(&'a str),
    Expandable(&'a str),
}

fn classify(raw: &str) -> Option<RawValue<'_>> {
    if let Some(rest) = raw.strip_prefix('\'') {
        let end = rest.find('\'')?;
        return trailing_ok(&rest[end + 1..]).then_some(RawValue::Literal(&rest[..end]));
    }

    if let Some(rest) = raw.strip_prefix('"') {
        let end = closing_double_quote(rest)?;
        return trailing_ok(&rest[end + 1..]).then_some(RawValue::Expandable(&rest[..end]));
    }

    let bare = match raw.find(" #") {
        Some(pos) => raw[..pos].trim_end(),
        None => raw,
    };
    if bare.contains(char::is_whitespace) {
        return None;
    }
    Some(RawValue::Expandable(bare))
}

fn closing_double_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn trailing_ok(rest: &str) -> bool {
    let rest = rest.trim();
    rest.is_empty() || rest.starts_with('#')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn parse_str(content: &str) -> Result<StageDescriptor> {
        parse(content, "acme-prod", None, &no_env)
    }

    #[test]
    fn parses_quoted_and_bare_values() {
        let stage = parse_str(
            "# stage for acme\n\
             workdir=/tmp/acme\n\
             export app_title=\"Acme Pipelines\"\n\
             db_password='p$ss word'\n\
             db_name=crmintapp # trailing comment\n",
        )
        .unwrap();

        assert_eq!(stage.get("workdir"), Some("/tmp/acme"));
        assert_eq!(stage.get("app_title"), Some("Acme Pipelines"));
        assert_eq!(stage.get("db_password"), Some("p$ss word"));
        assert_eq!(stage.get("db_name"), Some("crmintapp"));
    }

    #[test]
    fn expands_earlier_keys_and_project_id() {
        let stage = parse_str(
            "workdir=\"/tmp/$project_id\"\n\
             service_account_file=\"${project_id}.json\"\n\
             backends=\"$workdir/backends\"\n",
        )
        .unwrap();

        assert_eq!(stage.get("workdir"), Some("/tmp/acme-prod"));
        assert_eq!(stage.get("service_account_file"), Some("acme-prod.json"));
        assert_eq!(stage.get("backends"), Some("/tmp/acme-prod/backends"));
    }

    #[test]
    fn backslash_escapes_are_literal_in_double_quotes() {
        let stage = parse_str(
            "db_password=\"pa\\$s\"\n\
             share=\"a\\\\b\"\n\
             literal=\"\\$HOME/x\"\n\
             tick=\"run \\`date\\`\"\n\
             title=\"The \\\"Big\\\" Board\"\n",
        )
        .unwrap();

        assert_eq!(stage.get("db_password"), Some("pa$s"));
        assert_eq!(stage.get("share"), Some("a\\b"));
        assert_eq!(stage.get("literal"), Some("$HOME/x"));
        assert_eq!(stage.get("tick"), Some("run `date`"));
        assert_eq!(stage.get("title"), Some("The \"Big\" Board"));
    }

    #[test]
    fn unset_variable_expands_to_empty() {
        let stage = parse_str("workdir=\"$undefined/x\"\nother=${missing}tail\n").unwrap();
        assert_eq!(stage.get("workdir"), Some("/x"));
        assert_eq!(stage.get("other"), Some("tail"));
    }

    #[test]
    fn expands_environment_and_home() {
        let env = |key: &str| match key {
            "HOME" => Some("/home/ops".to_string()),
            "SDK_ROOT" => Some("/opt/google".to_string()),
            _ => None,
        };
        let stage = parse(
            "gcloud_sdk_dir=~/google-cloud-sdk\ncloud_sql_proxy=$SDK_ROOT/cloud_sql_proxy\n",
            "p",
            None,
            &env,
        )
        .unwrap();

        assert_eq!(stage.get("gcloud_sdk_dir"), Some("/home/ops/google-cloud-sdk"));
        assert_eq!(stage.get("cloud_sql_proxy"), Some("/opt/google/cloud_sql_proxy"));
    }

    #[test]
    fn last_assignment_wins() {
        let stage = parse_str("app_title=One\napp_title=Two\n").unwrap();
        assert_eq!(stage.get("app_title"), Some("Two"));
    }

    #[test]
    fn empty_value_is_present() {
        let stage = parse_str("db_password=\n").unwrap();
        assert_eq!(stage.get("db_password"), Some(""));
        assert!(stage.require("db_password").is_ok());
    }

    #[test]
    fn rejects_unclosed_quote() {
        let err = parse_str("app_title=\"Acme\n").unwrap_err();
        assert_eq!(err.code.as_str(), "stage.invalid_line");
        assert_eq!(err.details["line"], 1);
    }

    #[test]
    fn rejects_non_assignment_lines() {
        let err = parse_str("workdir=/tmp\necho hello\n").unwrap_err();
        assert_eq!(err.code.as_str(), "stage.invalid_line");
        assert_eq!(err.details["line"], 2);
    }

    #[test]
    fn require_all_reports_all_missing_keys() {
        let stage = StageDescriptor::from_pairs("p", &[("workdir", "/tmp/p")]);
        let err = stage.require_all(REQUIRED_KEYS).unwrap_err();
        assert_eq!(err.code.as_str(), "stage.missing_variable");
        let keys = err.details["keys"].as_array().unwrap();
        assert_eq!(keys.len(), REQUIRED_KEYS.len() - 1);
        assert!(!keys.iter().any(|k| k == "workdir"));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let env: HashMap<&str, String> = [
            ("project_id", "ghost".to_string()),
            ("STAGE_RESET_STAGES_DIR", dir.path().display().to_string()),
        ]
        .into_iter()
        .collect();
        let settings =
            Settings::from_lookup(|k| env.get(k).cloned(), PathBuf::from("/src")).unwrap();

        let err = load(&settings).unwrap_err();
        assert_eq!(err.code.as_str(), "stage.file_missing");
        assert_eq!(err.details["projectId"], "ghost");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn load_reads_stage_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("acme.sh"), "workdir=\"/tmp/$project_id\"\n").unwrap();
        let env: HashMap<&str, String> = [
            ("project_id", "acme".to_string()),
            ("STAGE_RESET_STAGES_DIR", dir.path().display().to_string()),
        ]
        .into_iter()
        .collect();
        let settings =
            Settings::from_lookup(|k| env.get(k).cloned(), PathBuf::from("/src")).unwrap();

        let stage = load(&settings).unwrap();
        assert_eq!(stage.get("workdir"), Some("/tmp/acme"));
        assert!(stage.path.unwrap().ends_with("acme.sh"));
    }
}
