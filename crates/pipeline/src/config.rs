use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use comfyrun_core::model_refs::ModelFileRules;

use crate::nodes::InstallPolicy;

/// Name of the manager component's folder under `custom_nodes/`.
pub const MANAGER_DIR_NAME: &str = "ComfyUI-Manager";

/// Glob-style pattern of the service's log files: `comfyui*.log`.
pub const LOG_FILE_PREFIX: &str = "comfyui";
pub const LOG_FILE_SUFFIX: &str = ".log";

/// Runner configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local checkout next to the
/// working directory.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Host the service binds to (default: `127.0.0.1`).
    pub server_addr: String,
    /// Service port (default: `8188`).
    pub port: u16,
    /// Service checkout directory (default: `./ComfyUI`).
    pub base_path: PathBuf,
    /// Repository cloned into `base_path` when it is missing.
    pub repo_url: String,
    /// Repository of the manager component cloned into `custom_nodes/`.
    pub manager_url: String,
    /// Interpreter used to run the service and pip.
    pub python: String,
    /// Directory holding the service's `comfyui*.log` files.
    pub log_dir: PathBuf,
    /// JSON model catalogs consulted for name-based downloads.
    pub model_lists: Vec<PathBuf>,
    /// Which input values count as model references.
    pub model_rules: ModelFileRules,
    /// Upper bound on a cold start.
    pub startup_timeout: Duration,
    /// Interval between readiness polls during startup.
    pub startup_poll_interval: Duration,
    /// Upper bound on waiting for a submitted job to finish.
    pub execution_timeout: Duration,
    /// Whether a failed custom-node install aborts the run.
    pub install_policy: InstallPolicy,
    /// Let the service write to our stdout/stderr.
    pub debug_log: bool,
}

/// A configuration variable held a value that could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("{var} has invalid value {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".into(),
            port: 8188,
            base_path: PathBuf::from("./ComfyUI"),
            repo_url: "https://github.com/comfyanonymous/ComfyUI".into(),
            manager_url: "https://github.com/ltdrdata/ComfyUI-Manager".into(),
            python: "python3".into(),
            log_dir: PathBuf::from("."),
            model_lists: Vec::new(),
            model_rules: ModelFileRules::default(),
            startup_timeout: Duration::from_secs(300),
            startup_poll_interval: Duration::from_millis(500),
            execution_timeout: Duration::from_secs(3600),
            install_policy: InstallPolicy::BestEffort,
            debug_log: false,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                       |
    /// |--------------------------------|-------------------------------|
    /// | `COMFY_SERVER_ADDR`            | `127.0.0.1`                   |
    /// | `COMFY_PORT`                   | `8188`                        |
    /// | `COMFY_BASE_PATH`              | `./ComfyUI`                   |
    /// | `COMFY_REPO_URL`               | upstream ComfyUI repository   |
    /// | `COMFY_MANAGER_URL`            | upstream ComfyUI-Manager      |
    /// | `COMFY_PYTHON`                 | `python3`                     |
    /// | `COMFY_LOG_GLOB_DIR`           | `.`                           |
    /// | `COMFY_MODEL_LIST`             | (none, comma-separated)       |
    /// | `COMFY_MODEL_EXTENSIONS`       | `.ckpt,.safetensors,...`      |
    /// | `COMFY_OPTIONAL_MODELS`        | (none, comma-separated)       |
    /// | `COMFY_STARTUP_TIMEOUT_SECS`   | `300`                         |
    /// | `COMFY_STARTUP_POLL_MS`        | `500`                         |
    /// | `COMFY_EXECUTION_TIMEOUT_SECS` | `3600`                        |
    /// | `COMFY_INSTALL_POLICY`         | `best_effort`                 |
    /// | `COMFY_DEBUG_LOG`              | `false`                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let extensions = env_list("COMFY_MODEL_EXTENSIONS");
        let model_rules = ModelFileRules {
            extensions: if extensions.is_empty() {
                defaults.model_rules.extensions
            } else {
                extensions
            },
            optional_suffixes: env_list("COMFY_OPTIONAL_MODELS"),
        };

        Ok(Self {
            server_addr: env_or("COMFY_SERVER_ADDR", defaults.server_addr),
            port: env_parse("COMFY_PORT", defaults.port)?,
            base_path: env_or("COMFY_BASE_PATH", defaults.base_path),
            repo_url: env_or("COMFY_REPO_URL", defaults.repo_url),
            manager_url: env_or("COMFY_MANAGER_URL", defaults.manager_url),
            python: env_or("COMFY_PYTHON", defaults.python),
            log_dir: env_or("COMFY_LOG_GLOB_DIR", defaults.log_dir),
            model_lists: env_list("COMFY_MODEL_LIST")
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            model_rules,
            startup_timeout: Duration::from_secs(env_parse(
                "COMFY_STARTUP_TIMEOUT_SECS",
                defaults.startup_timeout.as_secs(),
            )?),
            startup_poll_interval: Duration::from_millis(env_parse(
                "COMFY_STARTUP_POLL_MS",
                defaults.startup_poll_interval.as_millis() as u64,
            )?),
            execution_timeout: Duration::from_secs(env_parse(
                "COMFY_EXECUTION_TIMEOUT_SECS",
                defaults.execution_timeout.as_secs(),
            )?),
            install_policy: env_parse("COMFY_INSTALL_POLICY", defaults.install_policy)?,
            debug_log: env_parse("COMFY_DEBUG_LOG", defaults.debug_log)?,
        })
    }

    /// HTTP base URL of the service, e.g. `http://127.0.0.1:8188`.
    pub fn api_url(&self) -> String {
        let host = self
            .server_addr
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        format!("http://{host}:{}", self.port)
    }

    pub fn model_dir(&self) -> PathBuf {
        self.base_path.join("models")
    }

    pub fn input_dir(&self) -> PathBuf {
        self.base_path.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base_path.join("output")
    }

    pub fn custom_nodes_dir(&self) -> PathBuf {
        self.base_path.join("custom_nodes")
    }

    pub fn manager_dir(&self) -> PathBuf {
        self.custom_nodes_dir().join(MANAGER_DIR_NAME)
    }

    pub fn requirements_file(&self) -> PathBuf {
        self.base_path.join("requirements.txt")
    }

    pub fn main_script(&self) -> PathBuf {
        self.base_path.join("main.py")
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_or<T: From<String>>(var: &str, default: T) -> T {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => T::from(v),
        _ => default,
    }
}

fn env_parse<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse().map_err(|_| ConfigError {
            var,
            value: v,
        }),
        _ => Ok(default),
    }
}

fn env_list(var: &str) -> Vec<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
