//! Narrow contracts the orchestration core needs from the outside world.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thalassa_protocol::{ExecOutput, ShipInfo};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::EngineError;

pub type LogStream = BoxStream<'static, Result<String, EngineError>>;

/// Observed state of a project container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Missing,
}

impl ContainerStatus {
    pub fn is_running(self) -> bool {
        self == ContainerStatus::Running
    }
}

/// Everything the engine needs to materialize a project container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub ship: Option<ShipInfo>,
    pub git_url: Option<String>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Prepare the image for the project.
    async fn build(&self, spec: &ContainerSpec) -> Result<(), EngineError>;
    /// Create the container if needed and start it.
    async fn start(&self, spec: &ContainerSpec) -> Result<(), EngineError>;
    async fn stop(&self, name: &str) -> Result<(), EngineError>;
    /// Remove the container. Removing a missing container is not an error.
    async fn remove(&self, name: &str) -> Result<(), EngineError>;
    /// Run a shell command in the container and capture its output.
    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput, EngineError>;
    async fn status(&self, name: &str) -> Result<ContainerStatus, EngineError>;
    async fn logs(&self, name: &str, follow: bool) -> Result<LogStream, EngineError>;
}

/// Byte pipes to an agent process plus whatever keeps it alive.
pub struct AgentTransport {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub child: Option<tokio::process::Child>,
}

impl AgentTransport {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }
}

/// Opens a fresh transport to the agent process inside an environment.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, environment: &str) -> Result<AgentTransport, EngineError>;
    /// Working directory the agent session is opened in.
    fn workdir(&self, environment: &str) -> String;
}
