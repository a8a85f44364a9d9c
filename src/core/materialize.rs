//! Generated app config: `app.json`, the database URI line and the
//! service account key, rendered from a stage descriptor.

use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{Error, Result};
use crate::stage::{StageDescriptor, StageKeys};
use crate::utils::io;
use crate::utils::template;

pub const DEFAULT_DB_DRIVER: &str = "mysqldb";

/// Template variable holding the proxy socket directory.
pub const SOCKET_DIR_VAR: &str = "socket_dir";

pub const APP_JSON_TEMPLATE: &str =
    r#"{"notification_sender_email": "{{notification_sender_email}}", "app_title": "{{app_title}}"}"#;

pub const DATABASE_URI_TEMPLATE: &str = "mysql+{{db_driver}}://{{db_username}}:{{db_password}}@/{{db_name}}?unix_socket={{socket_dir}}/{{db_instance_conn_name}}";

pub const APP_JSON_PATH: &str = "backends/data/app.json";
pub const CONFIG_PY_PATH: &str = "backends/instance/config.py";
pub const SERVICE_ACCOUNT_PATH: &str = "backends/data/service-account.json";
pub const SERVICE_ACCOUNT_SOURCE_DIR: &str = "backends/data";

/// Fully rendered artifacts, held in memory until written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedConfig {
    pub app_json: String,
    pub database_uri: String,
    pub service_account_source: PathBuf,
}

impl GeneratedConfig {
    pub fn config_py(&self) -> String {
        format!("SQLALCHEMY_DATABASE_URI=\"{}\"\n", self.database_uri)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeResult {
    pub app_json: String,
    pub config_py: String,
    pub service_account: String,
}

/// Render every artifact, failing before any write if a key is missing.
pub fn render(
    stage: &StageDescriptor,
    source_dir: &Path,
    socket_dir: &Path,
) -> Result<GeneratedConfig> {
    let mut vars = stage.to_map();
    vars.entry(StageKeys::DB_DRIVER.to_string())
        .or_insert_with(|| DEFAULT_DB_DRIVER.to_string());
    vars.insert(
        SOCKET_DIR_VAR.to_string(),
        socket_dir.display().to_string(),
    );

    let json_vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.clone(), json_escape(v)))
        .collect();
    encode_credentials(&mut vars)?;

    let mut missing: Vec<String> = Vec::new();
    let app_json = template::render_strict(APP_JSON_TEMPLATE, &json_vars)
        .map_err(|keys| missing.extend(keys))
        .ok();
    let database_uri = template::render_strict(DATABASE_URI_TEMPLATE, &vars)
        .map_err(|keys| missing.extend(keys))
        .ok();
    let service_account = stage.get(StageKeys::SERVICE_ACCOUNT_FILE);
    if service_account.is_none() {
        missing.push(StageKeys::SERVICE_ACCOUNT_FILE.to_string());
    }

    match (app_json, database_uri, service_account) {
        (Some(app_json), Some(database_uri), Some(service_account)) => {
            if database_uri.contains(['"', '\\', '\n', '\r']) {
                return Err(Error::materialize_write_failed(
                    CONFIG_PY_PATH,
                    "database URI contains a quote, backslash or line break",
                ));
            }
            Ok(GeneratedConfig {
                app_json,
                database_uri,
                service_account_source: source_dir
                    .join(SERVICE_ACCOUNT_SOURCE_DIR)
                    .join(service_account),
            })
        }
        _ => {
            missing.dedup();
            Err(Error::stage_missing_variable(missing, stage.path.clone()))
        }
    }
}

/// Write rendered artifacts into `workdir`, replacing earlier copies.
pub fn write(generated: &GeneratedConfig, workdir: &Path) -> Result<MaterializeResult> {
    let app_json_path = workdir.join(APP_JSON_PATH);
    let config_py_path = workdir.join(CONFIG_PY_PATH);
    let service_account_path = workdir.join(SERVICE_ACCOUNT_PATH);

    let service_account = fs::read(&generated.service_account_source).map_err(|e| {
        Error::materialize_write_failed(
            service_account_path.display().to_string(),
            format!(
                "cannot read {}: {}",
                generated.service_account_source.display(),
                e
            ),
        )
    })?;

    write_one(&app_json_path, generated.app_json.as_bytes())?;
    write_one(&config_py_path, generated.config_py().as_bytes())?;
    write_one(&service_account_path, &service_account)?;

    tracing::info!(workdir = %workdir.display(), "Generated app config written");

    Ok(MaterializeResult {
        app_json: app_json_path.display().to_string(),
        config_py: config_py_path.display().to_string(),
        service_account: service_account_path.display().to_string(),
    })
}

fn write_one(path: &Path, content: &[u8]) -> Result<()> {
    let fail = |e: std::io::Error| {
        Error::materialize_write_failed(path.display().to_string(), e.to_string())
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(fail)?;
    }
    io::write_atomic(path, content).map_err(fail)
}

/// Percent-encode the username and password for the URI userinfo.
fn encode_credentials(vars: &mut HashMap<String, String>) -> Result<()> {
    let fail = || {
        Error::materialize_write_failed(CONFIG_PY_PATH, "cannot encode database credentials")
    };
    let mut uri = Url::parse("mysql://localhost").map_err(|_| fail())?;

    if let Some(username) = vars.get(StageKeys::DB_USERNAME).cloned() {
        uri.set_username(&username).map_err(|_| fail())?;
        vars.insert(StageKeys::DB_USERNAME.to_string(), uri.username().to_string());
    }
    if let Some(password) = vars.get(StageKeys::DB_PASSWORD).cloned() {
        uri.set_password(Some(&password)).map_err(|_| fail())?;
        let encoded = uri.password().unwrap_or_default().to_string();
        vars.insert(StageKeys::DB_PASSWORD.to_string(), encoded);
    }
    Ok(())
}

/// Escape a value for placement inside a JSON string literal.
fn json_escape(value: &str) -> String {
    let quoted = serde_json::to_string(value).unwrap_or_default();
    quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or_default()
        .to_string()
}
