pub mod model;
pub mod paths;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub use model::*;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_JSON_LINE_BYTES: usize = 1024 * 1024;

/// Orchestration commands, published on the bus and carried by `call` requests.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    ListShips,
    ListProjects,
    CreateProject {
        name: String,
        ship: String,
        #[serde(default)]
        git_url: Option<String>,
    },
    BuildProject {
        name: String,
    },
    LaunchProject {
        name: String,
    },
    StopProject {
        name: String,
    },
    DeleteProject {
        name: String,
    },
    ProjectStatus {
        name: String,
    },
    ExecCommand {
        name: String,
        command: String,
    },
    SpawnAgent {
        name: String,
        #[serde(default)]
        initial_prompt: Option<String>,
    },
    SendPrompt {
        name: String,
        text: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    CloseAgent {
        name: String,
    },
    ListSessions,
    Reconcile,
    ChatHistory {
        chat_id: String,
        #[serde(default = "default_history_limit")]
        limit: usize,
    },
}

impl Command {
    /// Environment the command targets, if any.
    pub fn environment(&self) -> Option<&str> {
        match self {
            Command::CreateProject { name, .. }
            | Command::BuildProject { name }
            | Command::LaunchProject { name }
            | Command::StopProject { name }
            | Command::DeleteProject { name }
            | Command::ProjectStatus { name }
            | Command::ExecCommand { name, .. }
            | Command::SpawnAgent { name, .. }
            | Command::SendPrompt { name, .. }
            | Command::CloseAgent { name } => Some(name),
            Command::ListShips
            | Command::ListProjects
            | Command::ListSessions
            | Command::Reconcile
            | Command::ChatHistory { .. } => None,
        }
    }
}

/// Result of a command, carried by `CommandResult` events.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    EnvironmentBusy,
    EnvironmentNotReady,
    EnvironmentNotFound,
    EnvironmentExists,
    UnknownShip,
    SessionAlreadyActive,
    SessionNotReady,
    SessionNotFound,
    SessionLost,
    TimedOut,
    EngineFailure,
    ReconcileDrift,
    AgentError,
    InvalidRequest,
    ServerError,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Immutable envelope published once on the bus and shared by every subscriber.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub at_epoch_ms: u64,
    /// Component that published the event.
    pub source: String,
    pub kind: EventKind,
}

impl Event {
    pub fn new(source: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            at_epoch_ms: now_epoch_ms(),
            source: source.into(),
            kind,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    EnvironmentStateChanged {
        name: String,
        old_state: EnvironmentState,
        new_state: EnvironmentState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    CommandRequested {
        request_id: String,
        command: Command,
        #[serde(default)]
        metadata: Metadata,
    },
    CommandResult {
        request_id: String,
        outcome: CommandOutcome,
        #[serde(default)]
        metadata: Metadata,
    },
    AgentMessage {
        environment: String,
        /// Set when the message answers a request sent through the bridge.
        #[serde(default)]
        correlation_id: Option<u64>,
        unsolicited: bool,
        message: ChatMessage,
    },
    ChatMessage {
        message: ChatMessage,
    },
    SystemNotice {
        level: NoticeLevel,
        #[serde(default)]
        code: Option<ErrorCode>,
        #[serde(default)]
        environment: Option<String>,
        message: String,
        #[serde(default)]
        metadata: Metadata,
    },
}

impl EventKind {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::EnvironmentStateChanged { .. } => "environment_state_changed",
            EventKind::CommandRequested { .. } => "command_requested",
            EventKind::CommandResult { .. } => "command_result",
            EventKind::AgentMessage { .. } => "agent_message",
            EventKind::ChatMessage { .. } => "chat_message",
            EventKind::SystemNotice { .. } => "system_notice",
        }
    }

    /// Environment the event concerns, if any.
    pub fn environment(&self) -> Option<&str> {
        match self {
            EventKind::EnvironmentStateChanged { name, .. } => Some(name),
            EventKind::CommandRequested { command, .. } => command.environment(),
            EventKind::CommandResult { .. } => None,
            EventKind::AgentMessage { environment, .. } => Some(environment),
            EventKind::ChatMessage { message } => message.target_environment(),
            EventKind::SystemNotice { environment, .. } => environment.as_deref(),
        }
    }

    /// Routing metadata carried by the event, if it has any.
    pub fn metadata(&self) -> Option<&Metadata> {
        match self {
            EventKind::EnvironmentStateChanged { .. } => None,
            EventKind::CommandRequested { metadata, .. }
            | EventKind::CommandResult { metadata, .. }
            | EventKind::SystemNotice { metadata, .. } => Some(metadata),
            EventKind::AgentMessage { message, .. } | EventKind::ChatMessage { message } => {
                Some(&message.metadata)
            }
        }
    }
}

/// Client-to-server requests sent as JSON-lines over the control socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Call {
        command: Command,
        #[serde(default)]
        metadata: Metadata,
    },
    Subscribe {
        /// Only forward events concerning this environment.
        #[serde(default)]
        environment: Option<String>,
    },
    Unsubscribe,
    Chat {
        chat_id: String,
        environment: String,
        user: String,
        text: String,
    },
    Shutdown,
}

/// Server-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Hello {
        protocol_version: u32,
        features: Vec<String>,
    },
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Event {
        event: Box<Event>,
    },
}

impl From<CommandOutcome> for Response {
    fn from(outcome: CommandOutcome) -> Self {
        match outcome {
            CommandOutcome::Ok { data } => Response::Ok { data },
            CommandOutcome::Error { code, message } => Response::Error { message, code },
        }
    }
}

pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn default_history_limit() -> usize {
    50
}
