//! Lifecycle of the inference service subprocess.
//!
//! Port ownership is the liveness oracle: the service is "running" when
//! some socket is listening on the configured port. On Linux the owning
//! process is found through `/proc/net/tcp{,6}` and `/proc/<pid>/fd`.
//! Where `/proc` is unavailable a plain TCP connect stands in for the
//! listening check.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use comfyrun_comfyui::service::ComfyService;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::config::RunnerConfig;

/// How long a terminated service may take to exit before it is killed.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// TCP state code for `LISTEN` in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceProcessState {
    Stopped,
    Starting,
    Running,
    /// The port is held by something that does not answer as the service.
    Blocked,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Port {port} blocked")]
    PortBlocked { port: u16 },

    #[error("Failed to spawn service: {0}")]
    Spawn(std::io::Error),

    #[error("Service did not accept requests within {0:?}")]
    StartupTimeout(Duration),

    #[error("Service exited during startup ({0})")]
    ExitedDuringStartup(String),

    #[error("Failed to signal pid {pid}: {detail}")]
    Signal { pid: u32, detail: String },
}

/// Start/stop control over the service process.
#[async_trait]
pub trait ServiceProcess: Send + Sync {
    /// Last state observed by this manager.
    fn state(&self) -> ServiceProcessState;

    /// Non-blocking port-ownership check.
    async fn is_running(&self) -> bool;

    /// Spawn the service if nothing owns the port, otherwise verify that
    /// the owner is a healthy service.
    async fn ensure_running(&self) -> Result<(), ProcessError>;

    /// Terminate the port owner and wait for it to exit. No-op when
    /// nothing is running.
    async fn stop(&self) -> Result<(), ProcessError>;
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Launch parameters for the service.
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub python: String,
    /// Service checkout; the process runs with this as working directory.
    pub base_path: PathBuf,
    /// Entry point passed to the interpreter.
    pub main_script: PathBuf,
    pub server_addr: String,
    pub port: u16,
    pub debug_log: bool,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&RunnerConfig> for ProcessSettings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            python: config.python.clone(),
            base_path: config.base_path.clone(),
            main_script: config.main_script(),
            server_addr: config.server_addr.clone(),
            port: config.port,
            debug_log: config.debug_log,
            startup_timeout: config.startup_timeout,
            poll_interval: config.startup_poll_interval,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the service subprocess for one port.
pub struct ServiceProcessManager {
    settings: ProcessSettings,
    service: Arc<dyn ComfyService>,
    state: Mutex<ServiceProcessState>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl ServiceProcessManager {
    pub fn new(settings: ProcessSettings, service: Arc<dyn ComfyService>) -> Self {
        Self {
            settings,
            service,
            state: Mutex::new(ServiceProcessState::Stopped),
            child: tokio::sync::Mutex::new(None),
        }
    }

    fn set_state(&self, state: ServiceProcessState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn healthy(&self) -> bool {
        matches!(self.service.health_check().await, Ok(true))
    }

    fn spawn(&self) -> Result<Child, ProcessError> {
        let mut cmd = Command::new(&self.settings.python);
        cmd.arg(&self.settings.main_script)
            .arg("--port")
            .arg(self.settings.port.to_string())
            .current_dir(&self.settings.base_path)
            .stdin(Stdio::null())
            .kill_on_drop(false);

        if !self.settings.debug_log {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        cmd.spawn().map_err(ProcessError::Spawn)
    }

    /// Poll until the port is listening and the service answers.
    async fn wait_until_ready(&self, child: &mut Child) -> Result<(), ProcessError> {
        let deadline = Instant::now() + self.settings.startup_timeout;

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ProcessError::ExitedDuringStartup(status.to_string()));
            }
            if self.is_running().await && self.healthy().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(ProcessError::StartupTimeout(self.settings.startup_timeout));
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

#[async_trait]
impl ServiceProcess for ServiceProcessManager {
    fn state(&self) -> ServiceProcessState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn is_running(&self) -> bool {
        port_is_listening(&self.settings.server_addr, self.settings.port).await
    }

    async fn ensure_running(&self) -> Result<(), ProcessError> {
        let port = self.settings.port;

        if self.is_running().await {
            if self.healthy().await {
                tracing::debug!(port, "Server already running");
                self.set_state(ServiceProcessState::Running);
                return Ok(());
            }
            tracing::error!(port, "Port is held by a process that does not answer as the service");
            self.set_state(ServiceProcessState::Blocked);
            return Err(ProcessError::PortBlocked { port });
        }

        self.set_state(ServiceProcessState::Starting);
        tracing::info!(port, base_path = %self.settings.base_path.display(), "Starting service");

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_state(ServiceProcessState::Stopped);
                return Err(e);
            }
        };

        if let Err(e) = self.wait_until_ready(&mut child).await {
            self.set_state(ServiceProcessState::Stopped);
            return Err(e);
        }

        tracing::info!(port, pid = ?child.id(), "Service is running");
        *self.child.lock().await = Some(child);
        self.set_state(ServiceProcessState::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessError> {
        let port = self.settings.port;
        let mut own_child = self.child.lock().await;

        let owner = find_port_owner(port).await;
        let pid = owner.or_else(|| own_child.as_ref().and_then(Child::id));

        let Some(pid) = pid else {
            tracing::debug!(port, "No service process to stop");
            *own_child = None;
            self.set_state(ServiceProcessState::Stopped);
            return Ok(());
        };

        tracing::info!(port, pid, "Stopping service");
        send_signal(pid, libc::SIGTERM)?;

        let exited = match own_child.as_mut() {
            Some(child) if child.id() == Some(pid) => {
                tokio::time::timeout(STOP_TIMEOUT, child.wait()).await.is_ok()
            }
            _ => wait_for_exit(pid, STOP_TIMEOUT).await,
        };

        if !exited {
            tracing::warn!(pid, "Service ignored SIGTERM, killing");
            send_signal(pid, libc::SIGKILL)?;
            wait_for_exit(pid, STOP_TIMEOUT).await;
        }

        if let Some(mut child) = own_child.take() {
            // Reap our own child so it does not linger as a zombie.
            let _ = child.try_wait();
        }

        // The listening socket can outlive the process for a moment.
        let deadline = Instant::now() + STOP_TIMEOUT;
        while self.is_running().await && Instant::now() < deadline {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        self.set_state(ServiceProcessState::Stopped);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Port and process inspection
// ---------------------------------------------------------------------------

/// Socket inodes listening on `port` in a `/proc/net/tcp`-format table.
pub fn parse_listening_inodes(table: &str, port: u16) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            if local_port != port {
                return None;
            }
            fields[9].parse().ok().filter(|inode| *inode != 0)
        })
        .collect()
}

fn listening_inodes(port: u16) -> std::io::Result<HashSet<u64>> {
    let mut inodes = HashSet::new();
    let mut any_table = false;
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            any_table = true;
            inodes.extend(parse_listening_inodes(&content, port));
        }
    }
    if any_table {
        Ok(inodes)
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no /proc/net/tcp tables",
        ))
    }
}

async fn port_is_listening(addr: &str, port: u16) -> bool {
    match tokio::task::spawn_blocking(move || listening_inodes(port)).await {
        Ok(Ok(inodes)) => !inodes.is_empty(),
        _ => {
            let host = addr
                .trim_start_matches("http://")
                .trim_start_matches("https://");
            tokio::net::TcpStream::connect((host, port)).await.is_ok()
        }
    }
}

/// Pid of the process holding a listening socket on `port`, if visible.
pub async fn find_port_owner(port: u16) -> Option<u32> {
    tokio::task::spawn_blocking(move || {
        let inodes = listening_inodes(port).ok()?;
        if inodes.is_empty() {
            return None;
        }
        owner_of_inodes(Path::new("/proc"), &inodes)
    })
    .await
    .ok()
    .flatten()
}

fn owner_of_inodes(proc_root: &Path, inodes: &HashSet<u64>) -> Option<u32> {
    let entries = std::fs::read_dir(proc_root).ok()?;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = socket_inode(&target.to_string_lossy()) {
                if inodes.contains(&inode) {
                    return Some(pid);
                }
            }
        }
    }
    None
}

/// Inode of a `socket:[12345]` fd link target.
fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), ProcessError> {
    // Safety: kill(2) has no memory-safety preconditions.
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    Err(ProcessError::Signal {
        pid,
        detail: err.to_string(),
    })
}

fn process_alive(pid: u32) -> bool {
    // Safety: signal 0 only performs the existence and permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while process_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    true
}
