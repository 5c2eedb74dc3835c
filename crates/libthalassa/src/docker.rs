use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thalassa_protocol::ExecOutput;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info};

use crate::engine::{
    AgentConnector, AgentTransport, ContainerEngine, ContainerSpec, ContainerStatus, LogStream,
};
use crate::error::EngineError;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DockerConfig {
    /// Engine binary, `docker` or a compatible CLI such as `podman`.
    pub binary: PathBuf,
    pub container_prefix: String,
    /// Directory inside the container holding project checkouts.
    pub projects_root: String,
    /// Command that starts an ACP agent on stdio inside the container.
    pub agent_command: Vec<String>,
    /// Image used when a project has no ship template.
    pub default_image: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("docker"),
            container_prefix: "thalassa-".to_string(),
            projects_root: "/home/devuser/projects".to_string(),
            agent_command: vec!["opencode".to_string(), "acp".to_string()],
            default_image: "thalassa/devbox:latest".to_string(),
        }
    }
}

/// Container engine backed by the docker command line.
#[derive(Debug, Clone, Default)]
pub struct DockerCli {
    config: DockerConfig,
}

impl DockerCli {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    pub fn container_name(&self, name: &str) -> String {
        format!("{}{}", self.config.container_prefix, name)
    }

    pub fn project_dir(&self, name: &str) -> String {
        format!("{}/{}", self.config.projects_root, name)
    }

    fn image_for(&self, spec: &ContainerSpec) -> String {
        match &spec.ship {
            Some(ship) if ship.dockerfile.is_some() => format!("thalassa/{}:latest", ship.name),
            Some(ship) => ship.image.clone(),
            None => self.config.default_image.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command, label: &str) -> Result<ExecOutput, EngineError> {
        let shown = format!("{label} {:?}", cmd.as_std());
        debug!(command = %shown, "running engine command");
        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command: shown,
                status: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: output.status.code(),
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn build(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        let image = self.image_for(spec);
        let mut cmd = self.command();
        match spec.ship.as_ref().and_then(|ship| ship.dockerfile.as_ref()) {
            Some(dockerfile) => {
                let context = PathBuf::from(dockerfile)
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                cmd.arg("build")
                    .arg("-t")
                    .arg(&image)
                    .arg("-f")
                    .arg(dockerfile)
                    .arg(context);
            }
            None => {
                cmd.arg("pull").arg(&image);
            }
        }
        self.run(cmd, "build").await?;
        info!(environment = %spec.name, %image, "image ready");
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        let container = self.container_name(&spec.name);
        match self.status(&spec.name).await? {
            ContainerStatus::Running => return Ok(()),
            ContainerStatus::Stopped => {
                let mut cmd = self.command();
                cmd.arg("start").arg(&container);
                self.run(cmd, "start").await?;
            }
            ContainerStatus::Missing => {
                let workdir = self.project_dir(&spec.name);
                let mut cmd = self.command();
                cmd.arg("run")
                    .arg("-d")
                    .arg("--name")
                    .arg(&container)
                    .arg("--label")
                    .arg(format!("thalassa.project={}", spec.name))
                    .arg(self.image_for(spec))
                    .args(["sleep", "infinity"]);
                self.run(cmd, "run").await?;

                if let Some(git_url) = &spec.git_url {
                    let mut clone = self.command();
                    clone
                        .arg("exec")
                        .arg(&container)
                        .args(["git", "clone", git_url.as_str(), workdir.as_str()]);
                    self.run(clone, "clone").await?;
                } else {
                    let mut mkdir = self.command();
                    mkdir
                        .arg("exec")
                        .arg(&container)
                        .args(["mkdir", "-p", workdir.as_str()]);
                    self.run(mkdir, "mkdir").await?;
                }
            }
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), EngineError> {
        let mut cmd = self.command();
        cmd.arg("stop").arg(self.container_name(name));
        self.run(cmd, "stop").await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        if self.status(name).await? == ContainerStatus::Missing {
            return Ok(());
        }
        let mut cmd = self.command();
        cmd.arg("rm").arg("-f").arg(self.container_name(name));
        self.run(cmd, "rm").await.map(|_| ())
    }

    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput, EngineError> {
        let mut cmd = self.command();
        cmd.arg("exec")
            .arg("-w")
            .arg(self.project_dir(name))
            .arg(self.container_name(name))
            .args(["sh", "-lc", command]);
        // A non-zero exit from the user's command is output, not an engine failure.
        let output = cmd.output().await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    async fn status(&self, name: &str) -> Result<ContainerStatus, EngineError> {
        let mut cmd = self.command();
        cmd.args(["inspect", "-f", "{{.State.Running}}"])
            .arg(self.container_name(name));
        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Ok(ContainerStatus::Missing);
            }
            return Err(EngineError::Unavailable(stderr.trim().to_string()));
        }
        match String::from_utf8_lossy(&output.stdout).trim() {
            "true" => Ok(ContainerStatus::Running),
            _ => Ok(ContainerStatus::Stopped),
        }
    }

    async fn logs(&self, name: &str, follow: bool) -> Result<LogStream, EngineError> {
        let mut cmd = self.command();
        cmd.arg("logs");
        if follow {
            cmd.arg("-f");
        }
        cmd.arg(self.container_name(name))
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Unavailable("log stream has no stdout".to_string()))?;
        let lines = LinesStream::new(tokio::io::BufReader::new(stdout).lines());
        // The child is moved into the stream so it lives as long as the reader.
        let stream = lines.map(move |line| {
            let _keep_alive = &child;
            line.map_err(EngineError::from)
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl AgentConnector for DockerCli {
    async fn connect(&self, environment: &str) -> Result<AgentTransport, EngineError> {
        let (program, args) = self
            .config
            .agent_command
            .split_first()
            .ok_or_else(|| EngineError::Unavailable("agent_command is empty".to_string()))?;
        let mut cmd = self.command();
        cmd.arg("exec")
            .arg("-i")
            .arg("-w")
            .arg(self.project_dir(environment))
            .arg(self.container_name(environment))
            .arg(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Unavailable("agent process has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Unavailable("agent process has no stdout".to_string()))?;
        info!(%environment, "agent process started");
        Ok(AgentTransport {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    fn workdir(&self, environment: &str) -> String {
        self.project_dir(environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thalassa_protocol::ShipInfo;

    #[test]
    fn naming_follows_config() {
        let docker = DockerCli::new(DockerConfig {
            container_prefix: "tl-".to_string(),
            projects_root: "/work".to_string(),
            ..DockerConfig::default()
        });
        assert_eq!(docker.container_name("alpha"), "tl-alpha");
        assert_eq!(docker.project_dir("alpha"), "/work/alpha");
    }

    #[test]
    fn image_selection() {
        let docker = DockerCli::default();
        let mut spec = ContainerSpec {
            name: "alpha".to_string(),
            ship: None,
            git_url: None,
        };
        assert_eq!(docker.image_for(&spec), "thalassa/devbox:latest");

        spec.ship = Some(ShipInfo {
            name: "rusty".to_string(),
            image: "rust:1".to_string(),
            dockerfile: None,
            description: None,
        });
        assert_eq!(docker.image_for(&spec), "rust:1");

        if let Some(ship) = spec.ship.as_mut() {
            ship.dockerfile = Some("ships/rusty/Dockerfile".to_string());
        }
        assert_eq!(docker.image_for(&spec), "thalassa/rusty:latest");
    }

    /// A stand-in engine CLI that answers the handful of subcommands used here.
    fn scripted_engine(dir: &std::path::Path) -> DockerCli {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-docker");
        std::fs::write(
            &script,
            r#"#!/bin/sh
case "$1" in
  inspect) echo true ;;
  logs) echo "booting"; echo "ready" ;;
  exec) echo "out"; echo "err" >&2; exit 7 ;;
  stop) echo "no such container" >&2; exit 1 ;;
esac
"#,
        )
        .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        DockerCli::new(DockerConfig {
            binary: script,
            ..DockerConfig::default()
        })
    }

    #[tokio::test]
    async fn cli_output_is_interpreted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let docker = scripted_engine(dir.path());

        assert_eq!(
            docker.status("alpha").await.expect("status"),
            ContainerStatus::Running
        );

        let output = docker.exec("alpha", "make test").await.expect("exec");
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, Some(7));

        let lines: Vec<String> = docker
            .logs("alpha", false)
            .await
            .expect("logs")
            .map(|line| line.expect("log line"))
            .collect()
            .await;
        assert_eq!(lines, vec!["booting", "ready"]);

        match docker.stop("alpha").await {
            Err(EngineError::CommandFailed { status, stderr, .. }) => {
                assert_eq!(status, Some(1));
                assert_eq!(stderr, "no such container");
            }
            other => panic!("expected command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_reports_io_error() {
        let docker = DockerCli::new(DockerConfig {
            binary: PathBuf::from("/nonexistent/thalassa-engine"),
            ..DockerConfig::default()
        });
        let err = docker.status("alpha").await.unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
