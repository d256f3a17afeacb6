//! Container isolation.
//!
//! Every command is a throw-away `run --rm` container. The runtime directory
//! (venv and generated scripts) and the workspace are bind mounts, so the venv
//! persists across containers while the container itself does not.

use std::path::Path;

use tokio::process::Command;

use super::Isolation;
use crate::config::DockerConfig;
use crate::util::shell_escape;

#[derive(Debug, Clone)]
pub struct DockerSandbox {
    config: DockerConfig,
}

/// Name of the container that runs `script_name`.
pub fn container_name(script_name: &str) -> String {
    let id = script_name.trim_end_matches(".py").trim_start_matches("script-");
    format!("sandboxed-exec-{id}")
}

/// Translate a host path into bind-mount syntax.
///
/// Backslashes become forward slashes so Windows hosts produce a path the
/// container runtime accepts.
pub fn to_mount_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

impl DockerSandbox {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    fn venv_mount(&self) -> String {
        format!("{}/venv", self.config.container_runtime_path.trim_end_matches('/'))
    }

    fn activate(&self) -> String {
        format!(". {}/bin/activate", shell_escape(&self.venv_mount()))
    }

    /// Arguments for one `run` invocation, up to and including the image.
    pub fn run_args(
        &self,
        runtime_dir: &Path,
        workspace: Option<&Path>,
        port: Option<u16>,
        name: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];
        if let Some(name) = name {
            args.push("--name".to_string());
            args.push(name.to_string());
        }
        if let Some(port) = port {
            args.push("-p".to_string());
            args.push(format!("{port}:{port}"));
        }
        args.push("-e".to_string());
        args.push("PYTHONUNBUFFERED=1".to_string());
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}",
            to_mount_path(runtime_dir),
            self.config.container_runtime_path
        ));
        if let Some(workspace) = workspace {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}",
                to_mount_path(workspace),
                self.config.container_workspace_path
            ));
            args.push("-w".to_string());
            args.push(self.config.container_workspace_path.clone());
        }
        args.push(self.config.image.clone());
        args
    }

    fn command(&self, mut args: Vec<String>, chain: &str) -> Command {
        args.push("sh".to_string());
        args.push("-lc".to_string());
        args.push(format!("set -e && {chain}"));
        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.args(args);
        cmd
    }
}

impl Isolation for DockerSandbox {
    fn label(&self) -> &'static str {
        "docker"
    }

    fn environment_location(&self, runtime_dir: &Path) -> String {
        format!(
            "{} ({} -> {})",
            self.config.image,
            runtime_dir.display(),
            self.venv_mount()
        )
    }

    fn create_command(&self, runtime_dir: &Path) -> Command {
        let chain = format!("python -m venv {}", shell_escape(&self.venv_mount()));
        self.command(self.run_args(runtime_dir, None, None, None), &chain)
    }

    fn install_command(&self, runtime_dir: &Path, package: &str) -> Command {
        let chain = format!(
            "{} && python -m pip install --disable-pip-version-check {}",
            self.activate(),
            shell_escape(package)
        );
        self.command(self.run_args(runtime_dir, None, None, None), &chain)
    }

    fn script_command(&self, runtime_dir: &Path, script_name: &str, workspace: &Path, port: u16) -> Command {
        let script = format!(
            "{}/{}",
            self.config.container_runtime_path.trim_end_matches('/'),
            script_name
        );
        let chain = format!(
            "{} && cd {} && python {}",
            self.activate(),
            shell_escape(&self.config.container_workspace_path),
            shell_escape(&script)
        );
        let name = container_name(script_name);
        self.command(
            self.run_args(runtime_dir, Some(workspace), Some(port), Some(&name)),
            &chain,
        )
    }

    /// Killing the CLI client leaves the container running, so remove it by name.
    fn terminate_command(&self, script_name: &str) -> Option<Command> {
        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.args(["rm", "-f"]).arg(container_name(script_name));
        Some(cmd)
    }

    fn sandbox_workspace_path(&self, _host_workspace: &Path) -> String {
        self.config.container_workspace_path.clone()
    }

    // Published ports only reach a server listening on all container interfaces.
    fn bind_host(&self) -> &'static str {
        "0.0.0.0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn mount_path_normalizes_backslashes() {
        assert_eq!(to_mount_path(Path::new(r"C:\Users\me\ws")), "C:/Users/me/ws");
        assert_eq!(to_mount_path(Path::new("/srv/ws")), "/srv/ws");
    }

    #[test]
    fn script_command_publishes_port_and_mounts_both_volumes() {
        let sandbox = DockerSandbox::new(DockerConfig::default());
        let cmd = sandbox.script_command(Path::new("/tmp/rt"), "script-1.py", Path::new("/srv/ws"), 41000);
        assert_eq!(cmd.as_std().get_program(), "docker");

        let args = args_of(&cmd);
        assert_eq!(
            &args[..7],
            ["run", "--rm", "-i", "--name", "sandboxed-exec-1", "-p", "41000:41000"]
        );
        assert!(args.contains(&"/tmp/rt:/opt/sandboxed/runtime".to_string()));
        assert!(args.contains(&"/srv/ws:/workspace".to_string()));
        let image_pos = args.iter().position(|a| a == "python:3.12").unwrap();
        assert_eq!(args[image_pos - 2], "-w");
        assert_eq!(&args[image_pos + 1..image_pos + 3], ["sh", "-lc"]);
        assert_eq!(
            args.last().unwrap(),
            "set -e && . '/opt/sandboxed/runtime/venv'/bin/activate && cd '/workspace' && python '/opt/sandboxed/runtime/script-1.py'"
        );
    }

    #[test]
    fn provisioning_commands_skip_workspace_and_port() {
        let sandbox = DockerSandbox::new(DockerConfig {
            docker_bin: "podman".to_string(),
            ..Default::default()
        });
        let create = sandbox.create_command(Path::new("/tmp/rt"));
        assert_eq!(create.as_std().get_program(), "podman");
        let args = args_of(&create);
        assert!(!args.contains(&"-p".to_string()));
        assert!(!args.contains(&"-w".to_string()));
        assert!(!args.contains(&"--name".to_string()));
        assert_eq!(args.last().unwrap(), "set -e && python -m venv '/opt/sandboxed/runtime/venv'");

        let install = args_of(&sandbox.install_command(Path::new("/tmp/rt"), "it's"));
        assert!(install.last().unwrap().ends_with("pip install --disable-pip-version-check 'it'\"'\"'s'"));
    }

    #[test]
    fn terminate_removes_the_named_script_container() {
        let sandbox = DockerSandbox::new(DockerConfig {
            docker_bin: "podman".to_string(),
            ..Default::default()
        });
        let run = args_of(&sandbox.script_command(Path::new("/tmp/rt"), "script-ab12.py", Path::new("/srv/ws"), 4000));
        let name_pos = run.iter().position(|a| a == "--name").unwrap();
        assert_eq!(run[name_pos + 1], "sandboxed-exec-ab12");

        let terminate = sandbox.terminate_command("script-ab12.py").unwrap();
        assert_eq!(terminate.as_std().get_program(), "podman");
        assert_eq!(args_of(&terminate), ["rm", "-f", "sandboxed-exec-ab12"]);
    }

    #[test]
    fn container_server_listens_on_all_interfaces() {
        let sandbox = DockerSandbox::new(DockerConfig::default());
        assert_eq!(sandbox.bind_host(), "0.0.0.0");
    }

    #[test]
    fn code_sees_container_workspace_path() {
        let sandbox = DockerSandbox::new(DockerConfig::default());
        assert_eq!(sandbox.sandbox_workspace_path(Path::new("/srv/ws")), "/workspace");
    }
}
