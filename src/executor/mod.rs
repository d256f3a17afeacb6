//! Code executors.
//!
//! An executor provisions the interpreter environment, renders the script,
//! runs it, and calls back once the script's RPC server is up so the caller
//! can attach a bridge. Two isolation variants share one implementation:
//! [`LocalVenv`] runs on the host, [`DockerSandbox`] runs each script in a
//! throw-away container.

pub mod docker;
pub mod local;
pub mod port;
pub mod process;
pub mod provision;
pub mod script;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use walkdir::WalkDir;

pub use docker::DockerSandbox;
pub use local::LocalVenv;

use crate::config::{Config, ExecutorConfig, IsolationKind};
use process::{run_and_trigger, run_command, StreamLog};
use provision::{
    ensure_ready, CommandOutput, EnvironmentBackend, PackageFailure, ProvisionError, ProvisionedEnvironment,
};
use script::{ScriptParams, ScriptWorkspace};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Provisioning(#[from] ProvisionError),

    #[error("Failed to allocate a port: {0}")]
    Port(#[source] std::io::Error),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the code runs and what it can see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceMode {
    /// Fresh temporary directory, removed after the run
    Ephemeral,
    /// Run directly inside this directory
    Shared(PathBuf),
    /// Run in a temporary copy; files move through `load_file`/`save_file`
    Synced(PathBuf),
}

/// One script run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub packages: Vec<String>,
    pub workspace: WorkspaceMode,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            packages: Vec::new(),
            workspace: WorkspaceMode::Ephemeral,
        }
    }

    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    pub fn with_workspace(mut self, workspace: WorkspaceMode) -> Self {
        self.workspace = workspace;
        self
    }
}

/// File-transfer endpoint and the host directory it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEndpoint {
    pub url: String,
    pub workspace: PathBuf,
}

/// Stops a running script from outside, e.g. when its bridge cannot connect.
#[derive(Debug, Clone, Default)]
pub struct RunAbort {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl RunAbort {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Handle that goes nowhere.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Kill the run; `reason` is appended to its output.
    pub fn abort(&self, reason: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(reason.into());
        }
    }
}

/// Connection details handed to the caller when the script is ready.
#[derive(Debug, Clone)]
pub struct SandboxEndpoints {
    pub port: u16,
    pub tools_url: String,
    pub files: Option<FileEndpoint>,
    pub abort: RunAbort,
}

impl SandboxEndpoints {
    fn new(port: u16, files_workspace: Option<PathBuf>, abort: RunAbort) -> Self {
        let base = format!("ws://127.0.0.1:{port}");
        Self {
            port,
            tools_url: format!("{base}{}", script::TOOLS_ENDPOINT),
            files: files_workspace.map(|workspace| FileEndpoint {
                url: format!("{base}{}", script::FILES_ENDPOINT),
                workspace,
            }),
            abort,
        }
    }
}

/// Console output of one run, wrapper markers already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub output: String,
    pub exit_code: i32,
    pub ready: bool,
    pub timed_out: bool,
    /// Packages this run asked for that could not be installed
    pub package_failures: Vec<PackageFailure>,
}

pub type ReadyCallback<'a> = dyn FnMut(&SandboxEndpoints) + Send + 'a;

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Workspace path as seen by code inside the sandbox.
    fn workspace_path(&self, workspace: &WorkspaceMode) -> Option<String>;

    /// Packages installed for every run.
    fn available_packages(&self) -> Vec<String>;

    /// Run `request` with one stub per entry of `tool_identifiers`.
    ///
    /// `on_ready` is invoked at most once, after the script's server is listening.
    async fn execute(
        &mut self,
        request: &ExecutionRequest,
        tool_identifiers: &[String],
        on_ready: &mut ReadyCallback<'_>,
    ) -> Result<ExecutionOutput, ExecutorError>;
}

/// Commands for one isolation variant.
pub trait Isolation: Send + Sync {
    /// Short name used in log lines.
    fn label(&self) -> &'static str;

    fn environment_location(&self, runtime_dir: &Path) -> String;

    fn create_command(&self, runtime_dir: &Path) -> Command;

    fn install_command(&self, runtime_dir: &Path, package: &str) -> Command;

    fn script_command(&self, runtime_dir: &Path, script_name: &str, workspace: &Path, port: u16) -> Command;

    /// Command that tears down whatever `script_command` left running once the
    /// launched process itself has been killed.
    fn terminate_command(&self, _script_name: &str) -> Option<Command> {
        None
    }

    fn sandbox_workspace_path(&self, host_workspace: &Path) -> String;

    /// Address the script's server listens on, as seen from inside the sandbox.
    fn bind_host(&self) -> &'static str;
}

struct VariantBackend<'a, I: Isolation> {
    isolation: &'a I,
    runtime_dir: &'a Path,
    log: StreamLog,
}

#[async_trait]
impl<'a, I: Isolation> EnvironmentBackend for VariantBackend<'a, I> {
    fn location(&self) -> String {
        self.isolation.environment_location(self.runtime_dir)
    }

    async fn create_environment(&self) -> std::io::Result<CommandOutput> {
        run_command(self.isolation.create_command(self.runtime_dir), &self.log).await
    }

    async fn install_package(&self, package: &str) -> std::io::Result<CommandOutput> {
        run_command(self.isolation.install_command(self.runtime_dir, package), &self.log).await
    }
}

/// Per-run files removed when the run ends, however it ends.
///
/// `terminate` is still set if the run was cancelled mid-flight; it is then
/// started in the background and not awaited.
struct RunCleanup {
    script_path: PathBuf,
    scratch: Option<TempDir>,
    terminate: Option<Command>,
}

impl Drop for RunCleanup {
    fn drop(&mut self) {
        if let Some(mut cmd) = self.terminate.take() {
            if tokio::runtime::Handle::try_current().is_ok() {
                cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
                if let Err(e) = cmd.spawn() {
                    tracing::warn!("Failed to tear down sandbox: {}", e);
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.script_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove script {}: {}", self.script_path.display(), e);
            }
        }
        if let Some(dir) = self.scratch.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!("Failed to remove temporary workspace {}: {}", path.display(), e);
            }
        }
    }
}

/// Relative paths of every file under `root`, sorted, `/`-separated.
pub fn list_workspace_files(root: &Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(docker::to_mount_path(rel));
        }
    }
    Ok(files)
}

/// Executor shared by both isolation variants.
pub struct Executor<I: Isolation> {
    isolation: I,
    config: ExecutorConfig,
    environment: ProvisionedEnvironment,
}

impl<I: Isolation> Executor<I> {
    pub fn new(isolation: I, config: ExecutorConfig) -> Self {
        Self {
            isolation,
            config,
            environment: ProvisionedEnvironment::new(),
        }
    }

    pub fn environment(&self) -> &ProvisionedEnvironment {
        &self.environment
    }

    fn log(&self) -> StreamLog {
        StreamLog::new(self.isolation.label(), self.config.stream_output)
    }
}

impl Executor<LocalVenv> {
    pub fn local(config: ExecutorConfig) -> Self {
        let isolation = LocalVenv::new(config.local.clone());
        Self::new(isolation, config)
    }
}

impl Executor<DockerSandbox> {
    pub fn docker(config: ExecutorConfig) -> Self {
        let isolation = DockerSandbox::new(config.docker.clone());
        Self::new(isolation, config)
    }
}

/// Build the executor selected by `config.isolation`.
pub fn from_config(config: &Config) -> Box<dyn CodeExecutor> {
    match config.isolation {
        IsolationKind::Local => Box::new(Executor::local(config.executor.clone())),
        IsolationKind::Docker => Box::new(Executor::docker(config.executor.clone())),
    }
}

#[async_trait]
impl<I: Isolation + 'static> CodeExecutor for Executor<I> {
    fn workspace_path(&self, workspace: &WorkspaceMode) -> Option<String> {
        match workspace {
            WorkspaceMode::Shared(path) => Some(self.isolation.sandbox_workspace_path(path)),
            WorkspaceMode::Ephemeral | WorkspaceMode::Synced(_) => None,
        }
    }

    fn available_packages(&self) -> Vec<String> {
        self.config.extra_packages.clone()
    }

    async fn execute(
        &mut self,
        request: &ExecutionRequest,
        tool_identifiers: &[String],
        on_ready: &mut ReadyCallback<'_>,
    ) -> Result<ExecutionOutput, ExecutorError> {
        let log = self.log();
        let runtime_dir = self.environment.runtime_dir("sandboxed-exec-")?;

        let required: Vec<String> = self
            .config
            .extra_packages
            .iter()
            .chain(request.packages.iter())
            .cloned()
            .collect();
        let backend = VariantBackend {
            isolation: &self.isolation,
            runtime_dir: &runtime_dir,
            log: log.clone(),
        };
        let report = ensure_ready(&mut self.environment, &backend, &required).await?;

        let lease = port::allocate_port().await.map_err(ExecutorError::Port)?;
        let port = lease.port();

        let (host_workspace, scratch, sync_source) = match &request.workspace {
            WorkspaceMode::Ephemeral => {
                let dir = tempfile::Builder::new().prefix("sandboxed-ws-").tempdir()?;
                (dir.path().to_path_buf(), Some(dir), None)
            }
            WorkspaceMode::Shared(path) => {
                if !path.is_dir() {
                    return Err(ExecutorError::Workspace(format!(
                        "{} is not a directory",
                        path.display()
                    )));
                }
                (path.clone(), None, None)
            }
            WorkspaceMode::Synced(path) => {
                if !path.is_dir() {
                    return Err(ExecutorError::Workspace(format!(
                        "{} is not a directory",
                        path.display()
                    )));
                }
                let dir = tempfile::Builder::new().prefix("sandboxed-ws-").tempdir()?;
                (dir.path().to_path_buf(), Some(dir), Some(path.clone()))
            }
        };

        let workspace = ScriptWorkspace {
            path: match &sync_source {
                Some(_) => None,
                None => Some(self.isolation.sandbox_workspace_path(&host_workspace)),
            },
            files: match &sync_source {
                Some(source) => Some(list_workspace_files(source)?),
                None => None,
            },
        };
        let script_text = script::render(&ScriptParams {
            port,
            bind_host: self.isolation.bind_host(),
            tool_identifiers,
            user_code: &request.code,
            workspace,
        });

        let script_name = format!("script-{}.py", uuid::Uuid::new_v4().simple());
        let script_path = runtime_dir.join(&script_name);
        let mut cleanup = RunCleanup {
            script_path: script_path.clone(),
            scratch,
            terminate: self.isolation.terminate_command(&script_name),
        };
        tokio::fs::write(&script_path, script_text).await?;

        tracing::info!(label = %log.label, port, script = %script_name, "Launching script");
        let cmd = self
            .isolation
            .script_command(&runtime_dir, &script_name, &host_workspace, port);

        let (abort, abort_rx) = RunAbort::channel();
        let endpoints = SandboxEndpoints::new(port, sync_source, abort);
        let result = run_and_trigger(cmd, &log, self.config.timeout, Some(abort_rx), |chunk| {
            if chunk.contains(script::READY_SIGNAL) {
                tracing::debug!(port, "Sandbox server ready");
                on_ready(&endpoints);
                true
            } else {
                false
            }
        })
        .await;

        match cleanup.terminate.take() {
            Some(terminate) if result.timed_out || result.aborted => {
                tracing::info!(label = %log.label, "Tearing down sandbox of stopped run");
                if let Err(e) = run_command(terminate, &log).await {
                    tracing::warn!(label = %log.label, "Failed to tear down sandbox: {}", e);
                }
            }
            _ => {}
        }
        drop(cleanup);
        drop(lease);

        if result.exit_code != 0 {
            tracing::warn!(label = %log.label, exit_code = result.exit_code, "Script exited with non-zero status");
        }
        if !result.triggered {
            tracing::warn!(label = %log.label, "Script exited before its server became ready");
        }

        Ok(ExecutionOutput {
            output: script::strip_wrapper_markers(&result.output),
            exit_code: result.exit_code,
            ready: result.triggered,
            timed_out: result.timed_out,
            package_failures: report.failed,
        })
    }
}
