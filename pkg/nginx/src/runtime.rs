use std::collections::VecDeque;
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pkg_constants::network::PROXY_HEALTH_PATH;
use pkg_constants::state::{PROXY_MAX_RESTARTS, PROXY_RESTART_WINDOW_SECS};
use pkg_types::error::GatewayError;

const RESTART_DELAY: Duration = Duration::from_secs(1);

/// The three interactions the controller has with the proxy binary.
#[async_trait]
pub trait ProxyRuntime: Send + Sync {
    /// Validate a configuration tree without applying it.
    async fn test(&self, main_conf: &Path) -> anyhow::Result<()>;

    /// Ask the running proxy to re-read the live configuration.
    async fn reload(&self) -> anyhow::Result<()>;

    /// Whether the proxy process is up and answers its status endpoint.
    async fn healthy(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct NginxConfig {
    pub binary: PathBuf,
    pub main_conf: PathBuf,
    pub status_port: u16,
    pub call_timeout: Duration,
}

/// nginx run as a supervised child process.
pub struct NginxRuntime {
    config: NginxConfig,
    client: reqwest::Client,
    pid: Mutex<Option<u32>>,
}

/// Bounded count of recent restarts.
struct RestartWindow {
    max: usize,
    window: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartWindow {
    fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart at `now`. Returns false once more than `max`
    /// restarts fall inside the window.
    fn record(&mut self, now: Instant) -> bool {
        self.restarts.push_back(now);
        while let Some(first) = self.restarts.front() {
            if now.duration_since(*first) > self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.len() <= self.max
    }
}

impl NginxRuntime {
    pub fn new(config: NginxConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.call_timeout).build()?;
        Ok(Self {
            config,
            client,
            pid: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &NginxConfig {
        &self.config
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }

    /// Fails with a fatal error if the binary is missing or not executable.
    pub fn check_binary(&self) -> anyhow::Result<()> {
        let binary = &self.config.binary;
        let meta = std::fs::metadata(binary).map_err(|e| {
            GatewayError::Fatal(format!("proxy binary {}: {}", binary.display(), e))
        })?;
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            return Err(GatewayError::Fatal(format!(
                "proxy binary {} is not executable",
                binary.display()
            ))
            .into());
        }
        Ok(())
    }

    async fn exec(&self, args: &[&OsStr]) -> anyhow::Result<std::process::Output> {
        let output = tokio::time::timeout(
            self.config.call_timeout,
            Command::new(&self.config.binary).args(args).output(),
        )
        .await
        .map_err(|_| GatewayError::Transient(format!("{} timed out", self.config.binary.display())))?
        .with_context(|| format!("running {}", self.config.binary.display()))?;
        Ok(output)
    }

    /// Run the proxy in the foreground, restarting it whenever it exits.
    /// The task ends with a fatal error once restarts exceed the allowed
    /// rate, or with `Ok` after `cancel` fires and the child has stopped.
    pub fn supervise(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut window = RestartWindow::new(
                PROXY_MAX_RESTARTS,
                Duration::from_secs(PROXY_RESTART_WINDOW_SECS),
            );
            info!(
                "Proxy supervisor started (binary={}, conf={})",
                self.config.binary.display(),
                self.config.main_conf.display()
            );
            loop {
                match self.spawn() {
                    Ok(mut child) => {
                        self.set_pid(child.id());
                        info!("Proxy process started (pid={:?})", child.id());
                        tokio::select! {
                            status = child.wait() => {
                                self.set_pid(None);
                                match status {
                                    Ok(s) => warn!("Proxy process exited: {}", s),
                                    Err(e) => warn!("Proxy process wait error: {}", e),
                                }
                            }
                            _ = cancel.cancelled() => {
                                self.stop(&mut child).await;
                                self.set_pid(None);
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => warn!("Proxy process spawn error: {}", e),
                }

                if cancel.is_cancelled() {
                    return Ok(());
                }
                if !window.record(Instant::now()) {
                    error!(
                        "Proxy restarted more than {} times in {}s, giving up",
                        PROXY_MAX_RESTARTS, PROXY_RESTART_WINDOW_SECS
                    );
                    return Err(GatewayError::Fatal("proxy process keeps exiting".to_string()).into());
                }
                tokio::select! {
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
            }
        })
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        let child = Command::new(&self.config.binary)
            .arg("-c")
            .arg(&self.config.main_conf)
            .args(["-g", "daemon off;"])
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.config.binary.display()))?;
        Ok(child)
    }

    /// SIGTERM, then SIGKILL if the child outlives the call timeout.
    async fn stop(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("SIGTERM to proxy pid {} failed: {}", pid, e);
            }
        }
        match tokio::time::timeout(self.config.call_timeout, child.wait()).await {
            Ok(Ok(status)) => info!("Proxy process stopped: {}", status),
            Ok(Err(e)) => warn!("Proxy process wait error: {}", e),
            Err(_) => {
                warn!("Proxy process ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
    }
}

#[async_trait]
impl ProxyRuntime for NginxRuntime {
    async fn test(&self, main_conf: &Path) -> anyhow::Result<()> {
        let output = self
            .exec(&[OsStr::new("-t"), OsStr::new("-c"), main_conf.as_os_str()])
            .await?;
        if output.status.success() {
            return Ok(());
        }
        Err(GatewayError::ConfigRejected(String::from_utf8_lossy(&output.stderr).trim().to_string()).into())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        let output = self
            .exec(&[
                OsStr::new("-c"),
                self.config.main_conf.as_os_str(),
                OsStr::new("-s"),
                OsStr::new("reload"),
            ])
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "nginx -s reload failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn healthy(&self) -> bool {
        if self.pid().is_none() {
            return false;
        }
        let url = format!("http://127.0.0.1:{}{}", self.config.status_port, PROXY_HEALTH_PATH);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
