//! Configuration management for the sandboxed executor.
//!
//! Configuration can be set via environment variables:
//! - `SANDBOXED_EXEC_HOST` - Optional. HTTP server host. Defaults to `127.0.0.1`.
//! - `SANDBOXED_EXEC_PORT` - Optional. HTTP server port. Defaults to `3100`.
//! - `WORKSPACE_PATH` - Optional. Workspace shared with sandboxed code. Defaults to current directory.
//! - `SANDBOX_ISOLATION` - Optional. `local` (virtual environment) or `docker`. Defaults to `local`.
//! - `SANDBOX_PYTHON_BIN` - Optional. Interpreter used to create the local venv. Defaults to `python3`.
//! - `SANDBOX_DOCKER_BIN` - Optional. Container runtime binary. Defaults to `docker`.
//! - `SANDBOX_DOCKER_IMAGE` - Optional. Container image. Defaults to `python:3.12`.
//! - `SANDBOX_CONTAINER_WORKSPACE_PATH` - Optional. Workspace mount inside the container. Defaults to `/workspace`.
//! - `SANDBOX_CONTAINER_RUNTIME_PATH` - Optional. Runtime mount inside the container. Defaults to `/opt/sandboxed/runtime`.
//! - `SANDBOX_EXTRA_PACKAGES` - Optional. Comma-separated packages installed for every run.
//! - `SANDBOX_STREAM_OUTPUT` - Optional. Echo subprocess output to the log. Defaults to `true`.
//! - `SANDBOX_WORKSPACE_SYNC` - Optional. Copy files in/out explicitly instead of running in the workspace. Defaults to `false`.
//! - `SANDBOX_EXEC_TIMEOUT_SECS` - Optional. Kill a script after this many seconds. Unset means no limit.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::{env_var_bool, parse_comma_list};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

pub const DEFAULT_PYTHON_BIN: &str = "python3";
pub const DEFAULT_DOCKER_BIN: &str = "docker";
pub const DEFAULT_DOCKER_IMAGE: &str = "python:3.12";
pub const DEFAULT_CONTAINER_WORKSPACE_PATH: &str = "/workspace";
pub const DEFAULT_CONTAINER_RUNTIME_PATH: &str = "/opt/sandboxed/runtime";

/// Which isolation variant runs the generated script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationKind {
    /// Local virtual environment, OS process isolation only.
    Local,
    /// Container with bind-mounted runtime and workspace volumes.
    Docker,
}

impl std::str::FromStr for IsolationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "venv" => Ok(IsolationKind::Local),
            "docker" | "container" => Ok(IsolationKind::Docker),
            other => Err(ConfigError::InvalidValue(
                "SANDBOX_ISOLATION".to_string(),
                other.to_string(),
            )),
        }
    }
}

/// Settings for the local virtual-environment executor.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Interpreter used for `-m venv`
    pub python_bin: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            python_bin: DEFAULT_PYTHON_BIN.to_string(),
        }
    }
}

/// Settings for the container executor.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Container runtime binary (`docker`, `podman`, ...)
    pub docker_bin: String,

    /// Image the script runs in
    pub image: String,

    /// Where the workspace is mounted inside the container
    pub container_workspace_path: String,

    /// Where the runtime directory (script + venv) is mounted inside the container
    pub container_runtime_path: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: DEFAULT_DOCKER_BIN.to_string(),
            image: DEFAULT_DOCKER_IMAGE.to_string(),
            container_workspace_path: DEFAULT_CONTAINER_WORKSPACE_PATH.to_string(),
            container_runtime_path: DEFAULT_CONTAINER_RUNTIME_PATH.to_string(),
        }
    }
}

/// Settings shared by both executors.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Packages installed for every run, on top of the request's own
    pub extra_packages: Vec<String>,

    /// Echo subprocess output to the log, line by line
    pub stream_output: bool,

    /// Kill a script that runs longer than this
    pub timeout: Option<Duration>,

    pub local: LocalConfig,

    pub docker: DockerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            extra_packages: Vec::new(),
            stream_output: true,
            timeout: None,
            local: LocalConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Workspace directory shared with sandboxed code
    pub workspace_path: PathBuf,

    /// Isolation variant
    pub isolation: IsolationKind,

    /// Sync workspace files over the RPC bridge instead of running inside the workspace
    pub workspace_sync: bool,

    pub executor: ExecutorConfig,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric or enum variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_or("SANDBOXED_EXEC_HOST", "127.0.0.1");

        let port = env_or("SANDBOXED_EXEC_PORT", "3100")
            .parse()
            .map_err(|e| ConfigError::InvalidValue("SANDBOXED_EXEC_PORT".to_string(), format!("{}", e)))?;

        let workspace_path = std::env::var("WORKSPACE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let isolation = env_or("SANDBOX_ISOLATION", "local").parse()?;

        let timeout = match std::env::var("SANDBOX_EXEC_TIMEOUT_SECS") {
            Ok(value) if !value.trim().is_empty() => {
                let secs: u64 = value.trim().parse().map_err(|e| {
                    ConfigError::InvalidValue("SANDBOX_EXEC_TIMEOUT_SECS".to_string(), format!("{}", e))
                })?;
                Some(Duration::from_secs(secs))
            }
            _ => None,
        };

        let executor = ExecutorConfig {
            extra_packages: parse_comma_list(&env_or("SANDBOX_EXTRA_PACKAGES", "")),
            stream_output: env_var_bool("SANDBOX_STREAM_OUTPUT", true),
            timeout,
            local: LocalConfig {
                python_bin: env_or("SANDBOX_PYTHON_BIN", DEFAULT_PYTHON_BIN),
            },
            docker: DockerConfig {
                docker_bin: env_or("SANDBOX_DOCKER_BIN", DEFAULT_DOCKER_BIN),
                image: env_or("SANDBOX_DOCKER_IMAGE", DEFAULT_DOCKER_IMAGE),
                container_workspace_path: env_or(
                    "SANDBOX_CONTAINER_WORKSPACE_PATH",
                    DEFAULT_CONTAINER_WORKSPACE_PATH,
                ),
                container_runtime_path: env_or(
                    "SANDBOX_CONTAINER_RUNTIME_PATH",
                    DEFAULT_CONTAINER_RUNTIME_PATH,
                ),
            },
        };

        Ok(Self {
            host,
            port,
            workspace_path,
            isolation,
            workspace_sync: env_var_bool("SANDBOX_WORKSPACE_SYNC", false),
            executor,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(workspace_path: PathBuf, isolation: IsolationKind) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3100,
            workspace_path,
            isolation,
            workspace_sync: false,
            executor: ExecutorConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_kind_parses_aliases() {
        assert_eq!("Docker".parse::<IsolationKind>().unwrap(), IsolationKind::Docker);
        assert_eq!("venv".parse::<IsolationKind>().unwrap(), IsolationKind::Local);
        assert!("vm".parse::<IsolationKind>().is_err());
    }

    #[test]
    fn new_uses_defaults() {
        let config = Config::new(PathBuf::from("/tmp/ws"), IsolationKind::Local);
        assert_eq!(config.port, 3100);
        assert!(config.executor.stream_output);
        assert!(config.executor.timeout.is_none());
        assert_eq!(config.executor.docker.image, DEFAULT_DOCKER_IMAGE);
        assert_eq!(config.executor.local.python_bin, "python3");
    }
}
