//! Bus-side helpers for the machine-control and chat surfaces.

use std::time::Duration;

use thalassa_protocol::{
    ChatMessage, Command, CommandOutcome, Entity, Event, EventKind, META_CHAT_ID,
    META_ENVIRONMENT, META_ORIGIN, Metadata,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::{BusError, EventBus, Subscription};
use crate::error::{OrchestratorError, Result};

/// Origin tag for messages entering through the chat surface.
pub const CHAT_ORIGIN: &str = "chat";

/// Issues commands over the bus and waits for their results.
#[derive(Clone)]
pub struct CommandClient {
    bus: EventBus,
    source: String,
    timeout: Duration,
}

impl CommandClient {
    pub fn new(bus: EventBus, source: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bus,
            source: source.into(),
            timeout,
        }
    }

    /// Publish `command` and wait for the matching `CommandResult`.
    pub async fn call(&self, command: Command, metadata: Metadata) -> Result<CommandOutcome> {
        let request_id = uuid::Uuid::new_v4().to_string();
        // Subscribe first so the result cannot slip past.
        let mut sub = self.bus.subscribe();
        self.bus.publish(
            &self.source,
            EventKind::CommandRequested {
                request_id: request_id.clone(),
                command,
                metadata,
            },
        );

        let deadline = Instant::now() + self.timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, sub.recv()).await {
                Err(_) => break,
                Ok(Ok(event)) => event,
                Ok(Err(BusError::Disconnected { missed })) => {
                    warn!(missed, %request_id, "command client fell behind");
                    sub = self.bus.subscribe();
                    continue;
                }
                Ok(Err(BusError::Closed)) => break,
            };
            if let EventKind::CommandResult {
                request_id: id,
                outcome,
                ..
            } = &event.kind
                && *id == request_id
            {
                debug!(%request_id, "command result received");
                return Ok(outcome.clone());
            }
        }
        Err(OrchestratorError::timed_out(
            format!("command {request_id}"),
            self.timeout,
        ))
    }
}

/// Publishes human chat messages and recognizes the replies meant for them.
#[derive(Clone)]
pub struct ChatRelay {
    bus: EventBus,
    origin: String,
}

impl ChatRelay {
    pub fn new(bus: EventBus) -> Self {
        Self::with_origin(bus, CHAT_ORIGIN)
    }

    pub fn with_origin(bus: EventBus, origin: impl Into<String>) -> Self {
        Self {
            bus,
            origin: origin.into(),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn metadata(&self, chat_id: &str, environment: &str) -> Metadata {
        Metadata::from([
            (META_ORIGIN.to_string(), self.origin.clone()),
            (META_CHAT_ID.to_string(), chat_id.to_string()),
            (META_ENVIRONMENT.to_string(), environment.to_string()),
        ])
    }

    /// Publish `text` from `user` into the chat addressed to `environment`.
    pub fn send(&self, chat_id: &str, environment: &str, user: &str, text: &str) -> ChatMessage {
        let sender = Entity::user(self.origin.clone(), user, user);
        let message = ChatMessage::new(sender, text, self.metadata(chat_id, environment));
        self.bus.publish(
            &self.origin,
            EventKind::ChatMessage {
                message: message.clone(),
            },
        );
        message
    }

    /// Whether `event` is an agent reply or notice routed back to `chat_id`.
    pub fn is_reply_for(&self, event: &Event, chat_id: &str) -> bool {
        if !matches!(
            event.kind,
            EventKind::AgentMessage { .. } | EventKind::SystemNotice { .. }
        ) {
            return false;
        }
        event.kind.metadata().is_some_and(|metadata| {
            metadata.get(META_ORIGIN) == Some(&self.origin)
                && metadata.get(META_CHAT_ID).map(String::as_str) == Some(chat_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::drain;
    use thalassa_protocol::{ErrorCode, NoticeLevel};

    #[tokio::test]
    async fn call_matches_its_own_result() {
        let bus = EventBus::default();
        let client = CommandClient::new(bus.clone(), "test", Duration::from_secs(5));
        let mut sub = bus.subscribe();

        let responder = tokio::spawn({
            let bus = bus.clone();
            async move {
                let request = loop {
                    let event = sub.recv().await.expect("request");
                    if let EventKind::CommandRequested { request_id, .. } = &event.kind {
                        break request_id.clone();
                    }
                };
                bus.publish(
                    "test",
                    EventKind::CommandResult {
                        request_id: "someone-else".to_string(),
                        outcome: CommandOutcome::Ok { data: None },
                        metadata: Metadata::new(),
                    },
                );
                bus.publish(
                    "test",
                    EventKind::CommandResult {
                        request_id: request,
                        outcome: CommandOutcome::Error {
                            code: ErrorCode::EnvironmentBusy,
                            message: "busy".to_string(),
                        },
                        metadata: Metadata::new(),
                    },
                );
            }
        });

        let outcome = client
            .call(Command::ListProjects, Metadata::new())
            .await
            .expect("call");
        assert!(matches!(
            outcome,
            CommandOutcome::Error {
                code: ErrorCode::EnvironmentBusy,
                ..
            }
        ));
        responder.await.expect("responder");
    }

    #[tokio::test]
    async fn call_times_out_without_dispatcher() {
        tokio::time::pause();
        let client = CommandClient::new(EventBus::default(), "test", Duration::from_secs(3));
        let err = client
            .call(Command::ListShips, Metadata::new())
            .await
            .expect_err("no dispatcher");
        assert!(matches!(err, OrchestratorError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn chat_messages_carry_routing_metadata() {
        let bus = EventBus::default();
        let relay = ChatRelay::new(bus.clone());
        let mut sub = relay.subscribe();

        let sent = relay.send("c1", "alpha", "ana", "hello");
        assert_eq!(sent.chat_id.as_deref(), Some("c1"));
        assert_eq!(sent.target_environment(), Some("alpha"));

        let events = drain(&mut sub);
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::ChatMessage { message } => {
                assert_eq!(message.sender, Entity::user("chat", "ana", "ana"));
                assert_eq!(message.metadata.get(META_ORIGIN).map(String::as_str), Some("chat"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn replies_are_filtered_by_origin_and_chat() {
        let relay = ChatRelay::new(EventBus::default());
        let reply = |metadata: Metadata| {
            Event::new(
                "agent_bridge",
                EventKind::AgentMessage {
                    environment: "alpha".to_string(),
                    correlation_id: Some(1),
                    unsolicited: false,
                    message: ChatMessage::new(Entity::agent("alpha"), "hi", metadata),
                },
            )
        };

        assert!(relay.is_reply_for(&reply(relay.metadata("c1", "alpha")), "c1"));
        assert!(!relay.is_reply_for(&reply(relay.metadata("c2", "alpha")), "c1"));
        let other_surface = ChatRelay::with_origin(EventBus::default(), "control");
        assert!(!relay.is_reply_for(&reply(other_surface.metadata("c1", "alpha")), "c1"));

        let notice = Event::new(
            "agent_bridge",
            EventKind::SystemNotice {
                level: NoticeLevel::Error,
                code: Some(ErrorCode::EnvironmentNotReady),
                environment: Some("alpha".to_string()),
                message: "not up".to_string(),
                metadata: relay.metadata("c1", "alpha"),
            },
        );
        assert!(relay.is_reply_for(&notice, "c1"));

        // The user's own message is not a reply.
        let own = Event::new(
            "chat",
            EventKind::ChatMessage {
                message: ChatMessage::new(
                    Entity::user("chat", "ana", "ana"),
                    "hello",
                    relay.metadata("c1", "alpha"),
                ),
            },
        );
        assert!(!relay.is_reply_for(&own, "c1"));
    }
}
