//! Interpreter environment provisioning.
//!
//! The environment (a venv on disk, possibly inside a container volume) is
//! created once per executor instance and then grown incrementally: each
//! request only installs the packages that are not already present.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tempfile::TempDir;
use thiserror::Error;

use crate::util::sanitize_name_list;

/// Packages the generated RPC server itself needs.
pub const INTERNAL_PACKAGES: &[&str] = &["nest_asyncio", "uvicorn", "fastapi_websocket_rpc"];

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Failed to create python virtual environment in {location}: {output}")]
    EnvironmentCreation { location: String, output: String },

    #[error("Failed to run provisioning command: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a provisioning command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The commands that create an environment and install into it.
///
/// Implemented by each isolation variant; provisioning logic stays the same.
#[async_trait]
pub trait EnvironmentBackend: Send + Sync {
    /// Human-readable location for log and error messages.
    fn location(&self) -> String;

    async fn create_environment(&self) -> std::io::Result<CommandOutput>;

    async fn install_package(&self, package: &str) -> std::io::Result<CommandOutput>;
}

/// Per-executor environment state. Lives as long as the executor.
#[derive(Debug, Default)]
pub struct ProvisionedEnvironment {
    /// Runtime directory on the host (venv and scripts live here)
    runtime_dir: Option<TempDir>,
    installed: HashSet<String>,
    initialized: bool,
}

impl ProvisionedEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host runtime directory, created on first use.
    pub fn runtime_dir(&mut self, prefix: &str) -> std::io::Result<PathBuf> {
        match &self.runtime_dir {
            Some(dir) => Ok(dir.path().to_path_buf()),
            None => {
                let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
                let path = dir.path().to_path_buf();
                tracing::info!("Created runtime directory: {}", path.display());
                self.runtime_dir = Some(dir);
                Ok(path)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_installed(&self, package: &str) -> bool {
        self.installed.contains(package)
    }

    pub fn installed_count(&self) -> usize {
        self.installed.len()
    }
}

/// A package that failed to install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageFailure {
    pub package: String,
    pub exit_code: i32,
    pub output: String,
}

/// What one provisioning pass did.
#[derive(Debug, Default, Clone)]
pub struct ProvisionReport {
    pub created: bool,
    pub installed: Vec<String>,
    pub failed: Vec<PackageFailure>,
}

impl ProvisionReport {
    /// Failure output of every package, newest first, separated like pip logs.
    pub fn failure_summary(&self) -> String {
        self.failed
            .iter()
            .rev()
            .map(|f| format!("{} (exit code {}):\n{}", f.package, f.exit_code, f.output))
            .collect::<Vec<_>>()
            .join("\n------\n")
    }
}

/// Packages still missing from `env`, internal dependencies first.
pub fn packages_to_install(env: &ProvisionedEnvironment, required: &[String]) -> Vec<String> {
    sanitize_name_list(
        INTERNAL_PACKAGES
            .iter()
            .map(|p| p.to_string())
            .chain(required.iter().cloned()),
    )
    .into_iter()
    .filter(|p| !env.is_installed(p))
    .collect()
}

/// Make sure the environment exists and holds every required package.
///
/// Environment creation failure aborts. Package failures are collected and
/// logged; the remaining packages are still attempted.
pub async fn ensure_ready<B>(
    env: &mut ProvisionedEnvironment,
    backend: &B,
    required: &[String],
) -> Result<ProvisionReport, ProvisionError>
where
    B: EnvironmentBackend + ?Sized,
{
    let mut report = ProvisionReport::default();

    if !env.initialized {
        tracing::info!(location = %backend.location(), "Creating python virtual environment");
        let created = backend.create_environment().await?;
        if !created.success() {
            return Err(ProvisionError::EnvironmentCreation {
                location: backend.location(),
                output: created.output,
            });
        }
        env.initialized = true;
        report.created = true;
        tracing::info!("Python virtual environment initialized");
    }

    let to_install = packages_to_install(env, required);
    if to_install.is_empty() {
        tracing::info!("No new libraries to install. Reusing cached environment.");
        return Ok(report);
    }
    tracing::info!("Installing missing libraries: {}", to_install.join(", "));

    for package in to_install {
        tracing::debug!(package = %package, "Installing library");
        match backend.install_package(&package).await {
            Ok(result) if result.success() => {
                tracing::info!(package = %package, "Library installed");
                env.installed.insert(package.clone());
                report.installed.push(package);
            }
            Ok(result) => report.failed.push(PackageFailure {
                package,
                exit_code: result.exit_code,
                output: result.output,
            }),
            Err(e) => report.failed.push(PackageFailure {
                package,
                exit_code: -1,
                output: e.to_string(),
            }),
        }
    }

    if !report.failed.is_empty() {
        tracing::warn!("Failed to install libraries:\n{}", report.failure_summary());
    }

    Ok(report)
}
