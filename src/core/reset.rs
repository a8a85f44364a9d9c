//! The stage reset run: install, sync, materialize, bridge, reset.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::installer::{self, ArchiveFetcher, HttpFetcher, SdkSource};
use crate::materialize;
use crate::proxy::{LibcSignaller, ProxyBridge, ProxyConfig, Signaller};
use crate::remote::{self, RemoteCommand};
use crate::settings::Settings;
use crate::stage::{self, StageDescriptor, StageKeys, REQUIRED_KEYS};
use crate::sync::{self, DEFAULT_EXCLUDES};
use crate::workflow::{RunContext, Workflow, WorkflowReport, WorkflowStep};

/// Everything a run needs, resolved once and shared read-only by all steps.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub project_id: String,
    pub source_dir: PathBuf,
    pub stages_dir: PathBuf,
    pub workdir: PathBuf,
    pub gcloud_sdk_dir: PathBuf,
    pub cloud_sql_proxy: String,
    pub instance_conn_name: String,
    pub socket_dir: PathBuf,
    pub proxy_timeout: Duration,
    pub sdk: SdkSource,
    pub python: String,
    pub stage: StageDescriptor,
}

impl DeployConfig {
    /// Validate the stage and merge it with environment overrides.
    ///
    /// Fails with every missing key before anything is touched on disk.
    pub fn resolve(settings: &Settings, stage: StageDescriptor) -> Result<Self> {
        let overridden = |key: &str| match key {
            StageKeys::GCLOUD_SDK_DIR => settings.gcloud_sdk_dir_override.is_some(),
            StageKeys::CLOUD_SQL_PROXY => settings.cloud_sql_proxy_override.is_some(),
            _ => false,
        };
        let required: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !overridden(key))
            .collect();
        stage.require_all(&required)?;

        let gcloud_sdk_dir = match &settings.gcloud_sdk_dir_override {
            Some(dir) => dir.clone(),
            None => stage.require(StageKeys::GCLOUD_SDK_DIR)?.to_string(),
        };
        let cloud_sql_proxy = match &settings.cloud_sql_proxy_override {
            Some(bin) => bin.clone(),
            None => stage.require(StageKeys::CLOUD_SQL_PROXY)?.to_string(),
        };

        Ok(Self {
            project_id: settings.project_id.clone(),
            source_dir: settings.source_dir.clone(),
            stages_dir: settings.stages_dir.clone(),
            workdir: PathBuf::from(stage.require(StageKeys::WORKDIR)?),
            gcloud_sdk_dir: PathBuf::from(gcloud_sdk_dir),
            cloud_sql_proxy,
            instance_conn_name: stage.require(StageKeys::DB_INSTANCE_CONN_NAME)?.to_string(),
            socket_dir: settings.socket_dir.clone(),
            proxy_timeout: settings.proxy_timeout,
            sdk: SdkSource {
                url: settings.sdk_url.clone(),
                sha256: settings.sdk_sha256.clone(),
            },
            python: settings.python.clone(),
            stage,
        })
    }

    /// Sync excludes, plus the stage files when they live inside the source
    /// tree under a non-default directory.
    pub fn sync_excludes(&self) -> Vec<String> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect();
        if let Ok(relative) = self.stages_dir.strip_prefix(&self.source_dir) {
            let relative = relative.to_string_lossy();
            if !relative.is_empty() {
                let pattern = format!("{}/*.sh", relative);
                if !excludes.contains(&pattern) {
                    excludes.push(pattern);
                }
            }
        }
        excludes
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig::cloud_sql(
            self.cloud_sql_proxy.clone(),
            self.instance_conn_name.clone(),
            self.socket_dir.clone(),
            self.proxy_timeout,
        )
    }

    pub fn reset_command(&self) -> RemoteCommand {
        RemoteCommand::reset_pipelines(
            &self.python,
            &self.workdir,
            &self.gcloud_sdk_dir,
            &self.workdir.join(materialize::SERVICE_ACCOUNT_PATH),
        )
    }
}

struct InstallSdk<'a> {
    config: &'a DeployConfig,
    fetcher: &'a dyn ArchiveFetcher,
}

impl WorkflowStep for InstallSdk<'_> {
    fn id(&self) -> &'static str {
        "install_sdk"
    }

    fn run(&mut self, _ctx: &mut RunContext) -> Result<serde_json::Value> {
        let outcome =
            installer::ensure_sdk(&self.config.gcloud_sdk_dir, &self.config.sdk, self.fetcher)?;
        to_data(&outcome)
    }
}

struct SyncWorkdir<'a> {
    config: &'a DeployConfig,
}

impl WorkflowStep for SyncWorkdir<'_> {
    fn id(&self) -> &'static str {
        "sync_workdir"
    }

    fn run(&mut self, _ctx: &mut RunContext) -> Result<serde_json::Value> {
        let excludes = self.config.sync_excludes();
        let patterns: Vec<&str> = excludes.iter().map(String::as_str).collect();
        let report = sync::sync_tree(&self.config.source_dir, &self.config.workdir, &patterns)?;
        to_data(&report)
    }
}

struct Materialize<'a> {
    config: &'a DeployConfig,
}

impl WorkflowStep for Materialize<'_> {
    fn id(&self) -> &'static str {
        "materialize"
    }

    fn run(&mut self, _ctx: &mut RunContext) -> Result<serde_json::Value> {
        let generated = materialize::render(
            &self.config.stage,
            &self.config.source_dir,
            &self.config.socket_dir,
        )?;
        let written = materialize::write(&generated, &self.config.workdir)?;
        to_data(&written)
    }
}

struct StartProxy<'a> {
    config: &'a DeployConfig,
    signaller: Arc<dyn Signaller>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProxyStarted {
    pid: Option<u32>,
    socket: String,
}

impl WorkflowStep for StartProxy<'_> {
    fn id(&self) -> &'static str {
        "start_proxy"
    }

    fn run(&mut self, ctx: &mut RunContext) -> Result<serde_json::Value> {
        let bridge = ProxyBridge::start(self.config.proxy_config(), self.signaller.clone())?;
        let started = ProxyStarted {
            pid: bridge.pid(),
            socket: bridge.socket_path().display().to_string(),
        };
        ctx.register_cleanup(Box::new(bridge));
        to_data(&started)
    }
}

struct ResetPipelines<'a> {
    config: &'a DeployConfig,
}

impl WorkflowStep for ResetPipelines<'_> {
    fn id(&self) -> &'static str {
        "reset_pipelines"
    }

    fn run(&mut self, _ctx: &mut RunContext) -> Result<serde_json::Value> {
        let outcome = remote::invoke(&self.config.reset_command())?;
        to_data(&outcome)
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::internal_json(e.to_string(), Some("serialize step result".to_string())))
}

/// Run the whole reset for `settings.project_id` with production
/// collaborators.
pub fn run(settings: &Settings) -> Result<WorkflowReport> {
    let fetcher = HttpFetcher::new()?;
    run_with(settings, &fetcher, Arc::new(LibcSignaller))
}

pub fn run_with(
    settings: &Settings,
    fetcher: &dyn ArchiveFetcher,
    signaller: Arc<dyn Signaller>,
) -> Result<WorkflowReport> {
    let stage = stage::load(settings)?;
    let config = DeployConfig::resolve(settings, stage)?;

    tracing::info!(
        project_id = %config.project_id,
        workdir = %config.workdir.display(),
        "Resetting stage"
    );

    let run = Workflow::new()
        .step(InstallSdk {
            config: &config,
            fetcher,
        })
        .step(SyncWorkdir { config: &config })
        .step(Materialize { config: &config })
        .step(StartProxy {
            config: &config,
            signaller,
        })
        .step(ResetPipelines { config: &config })
        .run();

    match run.error {
        None => Ok(run.report),
        Some(err) => Err(attach_report(err, &run.report)),
    }
}

fn attach_report(mut err: Error, report: &WorkflowReport) -> Error {
    if let (Some(details), Ok(value)) =
        (err.details.as_object_mut(), serde_json::to_value(report))
    {
        details.insert("report".to_string(), value);
    }
    err
}
