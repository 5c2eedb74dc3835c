use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thalassa_protocol::{
    ChatMessage, Entity, EnvironmentState, Event, EventKind, Metadata, NoticeLevel, SessionInfo,
    SessionStatus,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::RetryPolicy;
use super::acp;
use super::session::{Connection, PendingReply, SOURCE, Session, SessionHandle};
use super::transcript::Transcript;
use crate::bus::{BusError, EventBus};
use crate::engine::AgentConnector;
use crate::environment::EnvironmentManager;
use crate::error::{OrchestratorError, Result};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BridgeConfig {
    pub handshake_timeout_ms: u64,
    /// Default deadline for a prompt turn.
    pub request_timeout_secs: u64,
    pub outbound_queue: usize,
    /// Where session transcripts go. Unset disables transcripts.
    pub transcript_dir: Option<PathBuf>,
    pub reconnect: ReconnectConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 30_000,
            request_timeout_secs: 300,
            outbound_queue: 256,
            transcript_dir: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Owns every agent session, at most one per environment.
#[derive(Clone)]
pub struct AgentBridge {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: DashMap<String, Arc<Session>>,
    environments: Arc<EnvironmentManager>,
    connector: Arc<dyn AgentConnector>,
    bus: EventBus,
    config: BridgeConfig,
}

impl AgentBridge {
    pub fn new(
        environments: Arc<EnvironmentManager>,
        connector: Arc<dyn AgentConnector>,
        bus: EventBus,
        config: BridgeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                environments,
                connector,
                bus,
                config,
            }),
        }
    }

    /// Open and handshake a session for an `Up` environment.
    ///
    /// `metadata` is attached to every unsolicited message the agent sends,
    /// and to the reply to `initial_prompt`.
    pub async fn spawn(
        &self,
        name: &str,
        initial_prompt: Option<String>,
        metadata: Metadata,
    ) -> Result<SessionHandle> {
        match self.spawn_inner(name, metadata.clone()).await {
            Ok(handle) => {
                if let Some(text) = initial_prompt {
                    let bridge = self.clone();
                    let name = name.to_string();
                    tokio::spawn(async move {
                        let _ = bridge.prompt(&name, &text, metadata, None).await;
                    });
                }
                Ok(handle)
            }
            Err(err) => {
                self.notice(name, &err, format!("spawning agent in {name}: {err}"), metadata);
                Err(err)
            }
        }
    }

    async fn spawn_inner(&self, name: &str, metadata: Metadata) -> Result<SessionHandle> {
        // Held through the handshake so no transition can interleave.
        let lease = self.inner.environments.lock_up(name).await?;

        let key = uuid::Uuid::new_v4().to_string();
        let session = Session::new(name, key, metadata, self.inner.bus.clone());
        match self.inner.sessions.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().status() != SessionStatus::Closed {
                    return Err(OrchestratorError::SessionAlreadyActive(name.to_string()));
                }
                occupied.insert(Arc::clone(&session));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&session));
            }
        }
        if let Some(transcript) = self.open_transcript(name, &session.key).await {
            session.attach_transcript(transcript);
        }

        let connection = match self.connect(&session).await {
            Ok(connection) => connection,
            Err(err) => {
                session.finish();
                self.remove_if_current(&session);
                return Err(err);
            }
        };
        if session.close_requested() {
            connection.shutdown().await;
            session.finish();
            return Err(OrchestratorError::SessionLost(name.to_string()));
        }
        session.set_status(SessionStatus::Ready);
        drop(lease);

        info!(
            environment = %name,
            session_key = %session.key,
            agent_session = ?session.agent_session_id(),
            "agent session ready"
        );
        tokio::spawn(self.clone().supervise(Arc::clone(&session), connection));
        Ok(session.handle())
    }

    /// Send a raw request on a `Ready` session.
    pub async fn send(&self, name: &str, method: &str, params: Value) -> Result<PendingReply> {
        self.session(name)?.send_ready(method, params).await
    }

    /// One prompt turn. The reply is published as an `AgentMessage` carrying `metadata`.
    pub async fn prompt(
        &self,
        name: &str,
        text: &str,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let result = self.prompt_inner(name, text, metadata.clone(), timeout).await;
        if let Err(err) = &result {
            self.notice(name, err, format!("prompting agent in {name}: {err}"), metadata);
        }
        result
    }

    async fn prompt_inner(
        &self,
        name: &str,
        text: &str,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let session = self.session(name)?;
        let deadline = Instant::now() + timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        let turn = session.begin_turn(deadline).await?;
        let agent_session_id = session
            .agent_session_id()
            .ok_or_else(|| OrchestratorError::SessionNotReady(name.to_string()))?;

        let pending = session
            .send_ready(
                acp::METHOD_SESSION_PROMPT,
                acp::session_prompt_params(&agent_session_id, text),
            )
            .await?;
        let correlation_id = pending.correlation_id();
        let result = pending.wait_until(deadline).await?;

        let streamed = turn.take_streamed();
        drop(turn);
        let reply = if streamed.trim().is_empty() {
            acp::extract_reply_text(&result).into_text()
        } else {
            streamed
        };
        debug!(environment = %name, correlation_id, len = reply.len(), "agent turn complete");

        let message = ChatMessage::new(Entity::agent(name), reply.clone(), metadata);
        self.inner.bus.publish(
            SOURCE,
            EventKind::AgentMessage {
                environment: name.to_string(),
                correlation_id: Some(correlation_id),
                unsolicited: false,
                message,
            },
        );
        Ok(reply)
    }

    /// Tear down the session for `name`. Outstanding requests fail with `SessionLost`.
    pub fn close(&self, name: &str) -> Result<()> {
        let (_, session) = self
            .inner
            .sessions
            .remove(name)
            .ok_or_else(|| OrchestratorError::SessionNotFound(name.to_string()))?;
        session.request_close();
        session.finish();
        info!(environment = %name, "agent session closed");
        Ok(())
    }

    pub fn close_all(&self) {
        let names: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            let _ = self.close(&name);
        }
    }

    pub fn session_info(&self, name: &str) -> Option<SessionInfo> {
        self.inner.sessions.get(name).map(|session| session.info())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut all: Vec<SessionInfo> = self
            .inner
            .sessions
            .iter()
            .map(|session| session.info())
            .collect();
        all.sort_by(|a, b| a.environment.cmp(&b.environment));
        all
    }

    /// Follow the bus: close sessions of stopping environments, answer chat.
    pub fn spawn_listener(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut events = self.inner.bus.subscribe();
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Ok(event) => bridge.on_event(&event),
                        Err(BusError::Disconnected { missed }) => {
                            warn!(missed, "agent bridge fell behind the bus, resubscribing");
                            events = bridge.inner.bus.subscribe();
                        }
                        Err(BusError::Closed) => break,
                    },
                }
            }
            debug!("agent bridge listener stopped");
        })
    }

    fn on_event(&self, event: &Event) {
        match &event.kind {
            EventKind::EnvironmentStateChanged {
                name, new_state, ..
            } if matches!(
                new_state,
                EnvironmentState::Stopping | EnvironmentState::Down | EnvironmentState::Error
            ) =>
            {
                if self.inner.sessions.contains_key(name) {
                    info!(environment = %name, state = %new_state, "closing agent session");
                    let _ = self.close(name);
                }
            }
            EventKind::ChatMessage { message } if matches!(message.sender, Entity::User { .. }) => {
                let Some(environment) = message.target_environment().map(str::to_string) else {
                    return;
                };
                let bridge = self.clone();
                let text = message.content.clone();
                let metadata = message.metadata.clone();
                tokio::spawn(async move {
                    let _ = bridge.prompt(&environment, &text, metadata, None).await;
                });
            }
            _ => {}
        }
    }

    async fn supervise(self, session: Arc<Session>, mut connection: Connection) {
        let mut close = session.close_signal();
        loop {
            let close_requested = tokio::select! {
                _ = connection.closed() => false,
                _ = closed_signal(&mut close) => true,
            };
            connection.shutdown().await;
            if close_requested {
                session.finish();
                return;
            }

            warn!(environment = %session.environment, "agent transport disconnected");
            session.disconnected();
            self.notice_level(
                &session.environment,
                NoticeLevel::Warning,
                Some(&OrchestratorError::SessionLost(session.environment.clone())),
                format!("agent session for {} disconnected, reconnecting", session.environment),
                session.spawn_metadata.clone(),
            );

            match self.reconnect(&session, &mut close).await {
                Some(next) => {
                    connection = next;
                    session.record_reconnect();
                    session.set_status(SessionStatus::Ready);
                    info!(environment = %session.environment, "agent session reconnected");
                }
                None => {
                    let requested = session.close_requested();
                    session.finish();
                    self.remove_if_current(&session);
                    if !requested {
                        let err = OrchestratorError::SessionLost(session.environment.clone());
                        self.notice_level(
                            &session.environment,
                            NoticeLevel::Error,
                            Some(&err),
                            format!(
                                "agent session for {} closed after failed reconnects",
                                session.environment
                            ),
                            session.spawn_metadata.clone(),
                        );
                    }
                    return;
                }
            }
        }
    }

    async fn reconnect(
        &self,
        session: &Arc<Session>,
        close: &mut watch::Receiver<bool>,
    ) -> Option<Connection> {
        let policy = self.inner.config.reconnect.policy();
        let name = session.environment.as_str();
        for attempt in 1..=policy.max_attempts {
            let delay = policy.backoff_delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed_signal(close) => return None,
            }
            let lease = match self.inner.environments.lock_up(name).await {
                Ok(lease) => lease,
                Err(
                    err @ (OrchestratorError::EnvironmentNotReady { .. }
                    | OrchestratorError::EnvironmentNotFound(_)),
                ) => {
                    info!(environment = %name, error = %err, "environment gone, not reconnecting");
                    return None;
                }
                Err(err) => {
                    warn!(environment = %name, attempt, error = %err, "reconnect deferred");
                    continue;
                }
            };
            match self.connect(session).await {
                Ok(connection) => return Some(connection),
                Err(err) => {
                    warn!(environment = %name, attempt, error = %err, "reconnect attempt failed")
                }
            }
            drop(lease);
        }
        None
    }

    async fn connect(&self, session: &Arc<Session>) -> Result<Connection> {
        let name = session.environment.as_str();
        let timeout = self.inner.config.handshake_timeout();
        let transport = tokio::time::timeout(timeout, self.inner.connector.connect(name))
            .await
            .map_err(|_| {
                OrchestratorError::timed_out(format!("connecting to agent in {name}"), timeout)
            })??;
        let connection = Connection::attach(session, transport, self.inner.config.outbound_queue);
        let cwd = self.inner.connector.workdir(name);
        match session
            .handshake(env!("CARGO_PKG_VERSION"), &cwd, timeout)
            .await
        {
            Ok(agent_session_id) => {
                debug!(environment = %name, %agent_session_id, "agent handshake complete");
                Ok(connection)
            }
            Err(err) => {
                connection.shutdown().await;
                Err(err)
            }
        }
    }

    fn session(&self, name: &str) -> Result<Arc<Session>> {
        self.inner
            .sessions
            .get(name)
            .map(|session| Arc::clone(session.value()))
            .ok_or_else(|| OrchestratorError::SessionNotFound(name.to_string()))
    }

    fn remove_if_current(&self, session: &Arc<Session>) {
        self.inner
            .sessions
            .remove_if(&session.environment, |_, current| Arc::ptr_eq(current, session));
    }

    async fn open_transcript(&self, name: &str, key: &str) -> Option<Transcript> {
        let dir = self.inner.config.transcript_dir.as_ref()?;
        match Transcript::open(dir, name, key).await {
            Ok(transcript) => Some(transcript),
            Err(err) => {
                warn!(environment = %name, error = %err, "transcript disabled for session");
                None
            }
        }
    }

    fn notice(&self, name: &str, err: &OrchestratorError, message: String, metadata: Metadata) {
        let level = if err.is_transient() {
            NoticeLevel::Warning
        } else {
            NoticeLevel::Error
        };
        warn!(environment = %name, error = %err, "agent bridge operation failed");
        self.notice_level(name, level, Some(err), message, metadata);
    }

    fn notice_level(
        &self,
        name: &str,
        level: NoticeLevel,
        err: Option<&OrchestratorError>,
        message: String,
        metadata: Metadata,
    ) {
        self.inner.bus.publish(
            SOURCE,
            EventKind::SystemNotice {
                level,
                code: err.map(OrchestratorError::code),
                environment: Some(name.to_string()),
                message,
                metadata,
            },
        );
    }
}

async fn closed_signal(close: &mut watch::Receiver<bool>) {
    let _ = close.wait_for(|closed| *closed).await;
}
