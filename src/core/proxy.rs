//! Database proxy lifecycle.
//!
//! The proxy tunnels a local Unix socket to a managed database instance.
//! `ProxyBridge` owns the child process: it is signaled exactly once when
//! stopped, and `Drop` stops it on every exit path.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, ProxySpawnFailedDetails, Result};
use crate::interrupt;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TerminateOutcome {
    Delivered,
    /// No such process (`ESRCH`).
    AlreadyGone,
    Failed { error: String },
}

pub trait Signaller: Send + Sync {
    /// Send a termination request (SIGTERM) to `pid`.
    fn terminate(&self, pid: u32) -> TerminateOutcome;
}

pub struct LibcSignaller;

impl Signaller for LibcSignaller {
    fn terminate(&self, pid: u32) -> TerminateOutcome {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return TerminateOutcome::Failed {
                error: format!("pid {} out of range", pid),
            };
        };

        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            return TerminateOutcome::Delivered;
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            TerminateOutcome::AlreadyGone
        } else {
            TerminateOutcome::Failed {
                error: err.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub instance: String,
    pub socket_dir: PathBuf,
    /// File whose appearance means the proxy accepts connections.
    pub socket_path: PathBuf,
    pub readiness_timeout: Duration,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
}

impl ProxyConfig {
    pub fn cloud_sql(
        binary: impl Into<String>,
        instance: impl Into<String>,
        socket_dir: impl Into<PathBuf>,
        readiness_timeout: Duration,
    ) -> Self {
        let instance = instance.into();
        let socket_dir = socket_dir.into();
        Self {
            binary: binary.into(),
            args: vec![
                format!("-instances={}", instance),
                format!("-dir={}", socket_dir.display()),
            ],
            socket_path: socket_dir.join(&instance),
            instance,
            socket_dir,
            readiness_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum StopOutcome {
    /// The proxy was signaled by this call.
    Signaled {
        pid: u32,
        terminate: TerminateOutcome,
        forced: bool,
    },
    /// The interrupt handler already signaled it.
    SignaledOnInterrupt { pid: u32 },
    /// The proxy exited on its own before it was asked to.
    ExitedEarly { pid: u32 },
    AlreadyStopped,
}

pub struct ProxyBridge {
    config: ProxyConfig,
    signaller: Arc<dyn Signaller>,
    child: Option<Child>,
    pid: Option<u32>,
    state: ProxyState,
}

impl ProxyBridge {
    /// Spawn the proxy and wait until its socket exists.
    ///
    /// On any failure after the spawn the process is stopped before the
    /// error is returned.
    pub fn start(config: ProxyConfig, signaller: Arc<dyn Signaller>) -> Result<Self> {
        let spawn_failed = |error: String, exit_code: Option<i32>| {
            Error::proxy_spawn_failed(ProxySpawnFailedDetails {
                binary: config.binary.clone(),
                instance: config.instance.clone(),
                error,
                exit_code,
            })
        };

        std::fs::create_dir_all(&config.socket_dir).map_err(|e| {
            spawn_failed(
                format!("cannot create socket dir {}: {}", config.socket_dir.display(), e),
                None,
            )
        })?;

        // A socket left by an earlier proxy would pass the readiness check.
        remove_stale_socket(&config.socket_path).map_err(|e| {
            spawn_failed(
                format!("cannot remove stale socket {}: {}", config.socket_path.display(), e),
                None,
            )
        })?;

        tracing::info!(
            binary = %config.binary,
            instance = %config.instance,
            socket_dir = %config.socket_dir.display(),
            "Starting database proxy"
        );

        let child = interrupt::registry()
            .spawn_registered(|| {
                Command::new(&config.binary)
                    .args(&config.args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::inherit())
                    .spawn()
            })
            .map_err(|e| spawn_failed(e.to_string(), None))?;

        let pid = child.id();

        let mut bridge = Self {
            config,
            signaller,
            child: Some(child),
            pid: Some(pid),
            state: ProxyState::Starting,
        };

        match bridge.wait_ready() {
            Ok(()) => Ok(bridge),
            Err(err) => {
                bridge.stop();
                Err(err)
            }
        }
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    fn wait_ready(&mut self) -> Result<()> {
        let started = Instant::now();

        loop {
            if self.config.socket_path.exists() {
                self.state = ProxyState::Running;
                tracing::info!(
                    socket = %self.config.socket_path.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Database proxy ready"
                );
                return Ok(());
            }

            if let Some(status) = self.try_reap() {
                return Err(Error::proxy_spawn_failed(ProxySpawnFailedDetails {
                    binary: self.config.binary.clone(),
                    instance: self.config.instance.clone(),
                    error: format!("proxy exited before becoming ready ({})", status),
                    exit_code: status.code(),
                }));
            }

            if started.elapsed() >= self.config.readiness_timeout {
                return Err(Error::proxy_not_ready(
                    self.config.socket_path.display().to_string(),
                    self.config.readiness_timeout.as_millis() as u64,
                ));
            }

            thread::sleep(self.config.poll_interval);
        }
    }

    /// Collect the child if it already exited. A reaped pid may be reused
    /// by the OS, so it is dropped from the registry and never signaled.
    fn try_reap(&mut self) -> Option<ExitStatus> {
        let pid = self.pid?;
        let child = self.child.as_mut()?;
        let status = interrupt::registry().reap(pid, || child.try_wait().ok().flatten())?;
        self.child = None;
        self.state = ProxyState::Stopped;
        Some(status)
    }

    /// Terminate the proxy. Safe to call repeatedly; only the first call
    /// that finds it alive sends a signal.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(pid) = self.pid else {
            return StopOutcome::AlreadyStopped;
        };
        self.pid = None;
        let Some(mut child) = self.child.take() else {
            self.state = ProxyState::Stopped;
            return StopOutcome::ExitedEarly { pid };
        };

        self.state = ProxyState::Stopping;

        let exited = interrupt::registry().reap(pid, || child.try_wait().ok().flatten());
        if exited.is_some() {
            self.state = ProxyState::Stopped;
            tracing::info!(pid, "Database proxy had already exited");
            return StopOutcome::ExitedEarly { pid };
        }

        if !interrupt::release(pid) {
            let _ = child.wait();
            self.state = ProxyState::Stopped;
            return StopOutcome::SignaledOnInterrupt { pid };
        }

        let terminate = self.signaller.terminate(pid);
        match &terminate {
            TerminateOutcome::Delivered => tracing::info!(pid, "Sent SIGTERM to database proxy"),
            TerminateOutcome::AlreadyGone => {
                tracing::info!(pid, "Database proxy already stopped")
            }
            TerminateOutcome::Failed { error } => {
                tracing::warn!(pid, error = %error, "Failed to signal database proxy")
            }
        }

        let forced = !wait_with_grace(&mut child, self.config.stop_grace);
        if forced {
            tracing::warn!(pid, "Database proxy ignored SIGTERM, killing it");
            let _ = child.kill();
            let _ = child.wait();
            let _ = remove_stale_socket(&self.config.socket_path);
        }

        self.state = ProxyState::Stopped;
        StopOutcome::Signaled {
            pid,
            terminate,
            forced,
        }
    }
}

impl Drop for ProxyBridge {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.stop();
        }
    }
}

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Wait for `child` to exit, returning false if it is still running after
/// `grace`.
fn wait_with_grace(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Ok(None) => return false,
            Err(_) => return true,
        }
    }
}
