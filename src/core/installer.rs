//! Cloud SDK installation: download-if-absent, reuse-if-present.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Error, InstallFailedDetails, Result};
use crate::utils::command;

/// Where to fetch the SDK archive from.
#[derive(Debug, Clone)]
pub struct SdkSource {
    pub url: String,
    pub sha256: Option<String>,
}

pub trait ArchiveFetcher {
    /// Download `url` into the file at `dest`.
    fn fetch(&self, url: &str, dest: &Path) -> std::result::Result<(), String>;
}

/// Fetches archives over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("stage-reset/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::internal_unexpected(format!("HTTP client init failed: {}", e)))?;
        Ok(Self { client })
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> std::result::Result<(), String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| format!("request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("server returned {}", response.status()));
        }

        let mut file = fs::File::create(dest).map_err(|e| e.to_string())?;
        response
            .copy_to(&mut file)
            .map_err(|e| format!("download interrupted: {}", e))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum InstallOutcome {
    AlreadyPresent { target_dir: String },
    Installed { target_dir: String, url: String },
}

/// Make sure the SDK exists at `target_dir`.
///
/// When the directory is already there nothing is fetched. Otherwise the
/// archive is downloaded and unpacked into a staging directory beside the
/// target, then renamed into place so a failed install never leaves a
/// half-populated `target_dir` behind.
pub fn ensure_sdk(
    target_dir: &Path,
    source: &SdkSource,
    fetcher: &dyn ArchiveFetcher,
) -> Result<InstallOutcome> {
    let target_display = target_dir.display().to_string();

    if target_dir.exists() {
        tracing::info!(target_dir = %target_display, "SDK already present, skipping install");
        return Ok(InstallOutcome::AlreadyPresent {
            target_dir: target_display,
        });
    }

    let fail = |problem: String, exit_code: Option<i32>| {
        Error::install_failed(InstallFailedDetails {
            target_dir: target_display.clone(),
            problem,
            url: Some(source.url.clone()),
            exit_code,
        })
    };

    let parent = target_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| fail(format!("cannot create {}: {}", parent.display(), e), None))?;

    let staging = parent.join(format!(".sdk-install-{}", uuid::Uuid::new_v4()));
    fs::create_dir(&staging)
        .map_err(|e| fail(format!("cannot create staging dir: {}", e), None))?;

    let result = install_into(target_dir, &staging, source, fetcher);
    let _ = fs::remove_dir_all(&staging);

    match result {
        Ok(()) => {
            tracing::info!(target_dir = %target_display, url = %source.url, "SDK installed");
            Ok(InstallOutcome::Installed {
                target_dir: target_dir.display().to_string(),
                url: source.url.clone(),
            })
        }
        Err((problem, exit_code)) => Err(fail(problem, exit_code)),
    }
}

fn install_into(
    target_dir: &Path,
    staging: &Path,
    source: &SdkSource,
    fetcher: &dyn ArchiveFetcher,
) -> std::result::Result<(), (String, Option<i32>)> {
    let archive = staging.join("sdk.tar.gz");
    tracing::info!(url = %source.url, "Downloading SDK archive");
    fetcher
        .fetch(&source.url, &archive)
        .map_err(|e| (format!("download failed: {}", e), None))?;

    if let Some(expected) = &source.sha256 {
        let actual =
            sha256_file(&archive).map_err(|e| (format!("cannot hash archive: {}", e), None))?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err((
                format!("checksum mismatch: expected {}, got {}", expected, actual),
                None,
            ));
        }
    }

    let unpack_dir = staging.join("unpacked");
    fs::create_dir(&unpack_dir).map_err(|e| (e.to_string(), None))?;

    let args = vec![
        "-xzf".to_string(),
        archive.display().to_string(),
        "-C".to_string(),
        unpack_dir.display().to_string(),
    ];
    let output = command::execute("tar", &args, None, &[], "unpack SDK")
        .map_err(|e| (e.to_string(), None))?;
    if !output.success {
        return Err((
            format!("unpack failed: {}", output.error_text()),
            Some(output.exit_code),
        ));
    }

    let root = single_top_level_dir(&unpack_dir).unwrap_or(unpack_dir);
    fs::rename(&root, target_dir).map_err(|e| {
        (
            format!("cannot move SDK into {}: {}", target_dir.display(), e),
            None,
        )
    })?;

    Ok(())
}

/// SDK archives wrap everything in one directory (`google-cloud-sdk/`).
fn single_top_level_dir(dir: &Path) -> Option<PathBuf> {
    let mut entries = fs::read_dir(dir).ok()?.filter_map(|e| e.ok());
    let first = entries.next()?;
    if entries.next().is_some() || !first.path().is_dir() {
        return None;
    }
    Some(first.path())
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
