//! Local virtual-environment isolation.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use super::Isolation;
use crate::config::LocalConfig;

/// Runs scripts with a venv interpreter on the host.
#[derive(Debug, Clone)]
pub struct LocalVenv {
    config: LocalConfig,
}

impl LocalVenv {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    fn venv_dir(runtime_dir: &Path) -> PathBuf {
        runtime_dir.join("venv")
    }

    /// Interpreter inside the venv.
    pub fn venv_python(runtime_dir: &Path) -> PathBuf {
        let venv = Self::venv_dir(runtime_dir);
        if cfg!(windows) {
            venv.join("Scripts").join("python.exe")
        } else {
            venv.join("bin").join("python")
        }
    }
}

impl Isolation for LocalVenv {
    fn label(&self) -> &'static str {
        "venv"
    }

    fn environment_location(&self, runtime_dir: &Path) -> String {
        Self::venv_dir(runtime_dir).display().to_string()
    }

    fn create_command(&self, runtime_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.python_bin);
        cmd.arg("-m").arg("venv").arg(Self::venv_dir(runtime_dir));
        cmd
    }

    fn install_command(&self, runtime_dir: &Path, package: &str) -> Command {
        let mut cmd = Command::new(Self::venv_python(runtime_dir));
        cmd.args(["-m", "pip", "install", "--disable-pip-version-check", package]);
        cmd
    }

    fn script_command(
        &self,
        runtime_dir: &Path,
        script_name: &str,
        workspace: &Path,
        _port: u16,
    ) -> Command {
        let mut cmd = Command::new(Self::venv_python(runtime_dir));
        cmd.arg(runtime_dir.join(script_name))
            .current_dir(workspace)
            .env("PYTHONUNBUFFERED", "1");
        cmd
    }

    fn sandbox_workspace_path(&self, host_workspace: &Path) -> String {
        host_workspace.display().to_string()
    }

    fn bind_host(&self) -> &'static str {
        "127.0.0.1"
    }
}
