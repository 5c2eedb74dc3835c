use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::now_epoch_ms;

/// Opaque routing bag carried by chat traffic and echoed on every reply.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key naming the surface a message came from.
pub const META_ORIGIN: &str = "origin";
/// Metadata key naming the external conversation.
pub const META_CHAT_ID: &str = "chat_id";
/// Metadata key naming the environment a chat message is addressed to.
pub const META_ENVIRONMENT: &str = "environment";

/// Sender or recipient of a message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    User {
        id: String,
        display_name: String,
        /// Surface the user reached us through, e.g. `chat` or `control`.
        surface: String,
    },
    Agent {
        environment: String,
    },
    System,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Agent,
    System,
}

impl Entity {
    pub fn user(surface: impl Into<String>, id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Entity::User {
            id: id.into(),
            display_name: display_name.into(),
            surface: surface.into(),
        }
    }

    pub fn agent(environment: impl Into<String>) -> Self {
        Entity::Agent {
            environment: environment.into(),
        }
    }

    /// Stable directory key for this entity.
    pub fn id(&self) -> String {
        match self {
            Entity::User { id, surface, .. } => format!("{surface}:{id}"),
            Entity::Agent { environment } => format!("agent:{environment}"),
            Entity::System => "system".to_string(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Entity::User { display_name, .. } => display_name.clone(),
            Entity::Agent { environment } => format!("agent@{environment}"),
            Entity::System => "Thalassa".to_string(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::User { .. } => EntityKind::User,
            Entity::Agent { .. } => EntityKind::Agent,
            Entity::System => EntityKind::System,
        }
    }
}

/// A single message in a conversation, from any kind of entity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub sender: Entity,
    pub content: String,
    pub timestamp_epoch_ms: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ChatMessage {
    pub fn new(sender: Entity, content: impl Into<String>, metadata: Metadata) -> Self {
        let chat_id = metadata.get(META_CHAT_ID).cloned();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id,
            sender,
            content: content.into(),
            timestamp_epoch_ms: now_epoch_ms(),
            metadata,
        }
    }

    /// Environment this message is addressed to, if the sender named one.
    pub fn target_environment(&self) -> Option<&str> {
        self.metadata.get(META_ENVIRONMENT).map(String::as_str)
    }
}

/// Lifecycle state of a managed environment.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Down,
    Building,
    Up,
    Stopping,
    Error,
}

impl EnvironmentState {
    /// Building and Stopping are in-flight transitions.
    pub fn is_transitional(self) -> bool {
        matches!(self, EnvironmentState::Building | EnvironmentState::Stopping)
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::Down => "down",
            EnvironmentState::Building => "building",
            EnvironmentState::Up => "up",
            EnvironmentState::Stopping => "stopping",
            EnvironmentState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Belief record for one project container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,
    pub state: EnvironmentState,
    #[serde(default)]
    pub last_observed_at_epoch_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_at_epoch_ms: u64,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ship: None,
            git_url: None,
            state: EnvironmentState::Down,
            last_observed_at_epoch_ms: None,
            error_detail: None,
            created_at_epoch_ms: now_epoch_ms(),
        }
    }

    /// Sets the state, keeping `error_detail` present only in `Error`.
    pub fn set_state(&mut self, state: EnvironmentState, detail: Option<String>) {
        self.state = state;
        self.error_detail = if state == EnvironmentState::Error {
            Some(detail.unwrap_or_else(|| "unknown error".to_string()))
        } else {
            None
        };
    }
}

/// A container template projects are created from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShipInfo {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

/// Summary of one agent bridge session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionInfo {
    pub environment: String,
    #[serde(default)]
    pub agent_session_id: Option<String>,
    pub status: SessionStatus,
    pub pending_requests: usize,
    pub reconnects: u32,
    pub created_at_epoch_ms: u64,
}

/// Captured result of running a command inside a container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}
