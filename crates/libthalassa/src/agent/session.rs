use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thalassa_protocol::{
    ChatMessage, Entity, EventKind, MAX_JSON_LINE_BYTES, Metadata, SessionInfo, SessionStatus,
    now_epoch_ms,
};
use tokio::sync::{Mutex, MutexGuard, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::acp::{self, Inbound};
use super::transcript::{Direction, Transcript};
use crate::bus::EventBus;
use crate::engine::AgentTransport;
use crate::error::{OrchestratorError, Result};

pub(crate) const SOURCE: &str = "agent_bridge";

type Waiter = oneshot::Sender<Result<Value>>;

/// One agent connection's worth of state, surviving reconnects.
pub(crate) struct Session {
    pub(crate) environment: String,
    pub(crate) spawn_metadata: Metadata,
    pub(crate) key: String,
    created_at_epoch_ms: u64,
    status: watch::Sender<SessionStatus>,
    close: watch::Sender<bool>,
    pending: StdMutex<HashMap<u64, Waiter>>,
    outbound: StdMutex<Option<mpsc::Sender<String>>>,
    next_id: AtomicU64,
    agent_session_id: StdMutex<Option<String>>,
    turn_lock: Mutex<()>,
    turn_buffer: StdMutex<Option<String>>,
    reconnects: AtomicU32,
    transcript: OnceLock<Transcript>,
    bus: EventBus,
}

impl Session {
    pub(crate) fn new(
        environment: &str,
        key: String,
        spawn_metadata: Metadata,
        bus: EventBus,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(SessionStatus::Connecting);
        let (close, _) = watch::channel(false);
        Arc::new(Self {
            environment: environment.to_string(),
            spawn_metadata,
            key,
            created_at_epoch_ms: now_epoch_ms(),
            status,
            close,
            pending: StdMutex::new(HashMap::new()),
            outbound: StdMutex::new(None),
            next_id: AtomicU64::new(1),
            agent_session_id: StdMutex::new(None),
            turn_lock: Mutex::new(()),
            turn_buffer: StdMutex::new(None),
            reconnects: AtomicU32::new(0),
            transcript: OnceLock::new(),
            bus,
        })
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Closed is terminal; later updates are ignored.
    pub(crate) fn set_status(&self, next: SessionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == SessionStatus::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(environment = %self.environment, status = ?next, "agent session status");
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            environment: self.environment.clone(),
            agent_session_id: self.agent_session_id(),
            status: self.status(),
            pending_requests: lock(&self.pending).len(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            created_at_epoch_ms: self.created_at_epoch_ms,
        }
    }

    pub(crate) fn handle(&self) -> SessionHandle {
        SessionHandle {
            environment: self.environment.clone(),
            agent_session_id: self.agent_session_id(),
            status: self.status.subscribe(),
        }
    }

    pub(crate) fn agent_session_id(&self) -> Option<String> {
        lock(&self.agent_session_id).clone()
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record every line from now on. Only the first call takes effect.
    pub(crate) fn attach_transcript(&self, transcript: Transcript) {
        let _ = self.transcript.set(transcript);
    }

    pub(crate) fn close_signal(&self) -> watch::Receiver<bool> {
        self.close.subscribe()
    }

    pub(crate) fn close_requested(&self) -> bool {
        *self.close.borrow()
    }

    pub(crate) fn request_close(&self) {
        self.close.send_replace(true);
    }

    /// Transport gone: fail everything outstanding and wait for a new connection.
    pub(crate) fn disconnected(&self) {
        self.set_status(SessionStatus::Degraded);
        lock(&self.outbound).take();
        self.fail_pending();
    }

    /// Terminal teardown. Idempotent.
    pub(crate) fn finish(&self) {
        self.set_status(SessionStatus::Closed);
        lock(&self.outbound).take();
        self.fail_pending();
    }

    fn fail_pending(&self) {
        let waiters: Vec<(u64, Waiter)> = lock(&self.pending).drain().collect();
        if !waiters.is_empty() {
            warn!(
                environment = %self.environment,
                count = waiters.len(),
                "failing pending agent requests"
            );
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(OrchestratorError::SessionLost(self.environment.clone())));
        }
    }

    /// Send a request once the session is `Ready`.
    pub(crate) async fn send_ready(self: &Arc<Self>, method: &str, params: Value) -> Result<PendingReply> {
        if self.status() != SessionStatus::Ready {
            return Err(OrchestratorError::SessionNotReady(self.environment.clone()));
        }
        self.request(method, params).await
    }

    /// Send a request regardless of status. Used by the handshake.
    pub(crate) async fn request(self: &Arc<Self>, method: &str, params: Value) -> Result<PendingReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = acp::RpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)
            .map_err(|err| OrchestratorError::AgentProtocol(err.to_string()))?;

        // Registered before the sender is taken, so a disconnect either
        // fails this waiter or leaves no sender to use.
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let Some(sender) = lock(&self.outbound).clone() else {
            lock(&self.pending).remove(&id);
            return Err(OrchestratorError::SessionLost(self.environment.clone()));
        };
        if let Some(transcript) = self.transcript.get() {
            transcript.record(Direction::Outbound, &line);
        }
        if sender.send(line).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(OrchestratorError::SessionLost(self.environment.clone()));
        }
        debug!(environment = %self.environment, id, %method, "agent request sent");
        Ok(PendingReply {
            correlation_id: id,
            rx,
            session: Arc::clone(self),
        })
    }

    /// ACP handshake over the freshly attached connection.
    pub(crate) async fn handshake(
        self: &Arc<Self>,
        client_version: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<String> {
        self.request(acp::METHOD_INITIALIZE, acp::initialize_params(client_version))
            .await?
            .wait(timeout)
            .await?;
        let created = self
            .request(acp::METHOD_SESSION_NEW, acp::session_new_params(cwd))
            .await?
            .wait(timeout)
            .await?;
        let session_id = acp::parse_session_id(&created).ok_or_else(|| {
            OrchestratorError::AgentProtocol(format!("session/new returned no session id: {created}"))
        })?;
        *lock(&self.agent_session_id) = Some(session_id.clone());
        Ok(session_id)
    }

    /// Serializes prompt turns; chunks streamed meanwhile are collected for the holder.
    pub(crate) async fn begin_turn(&self, deadline: Instant) -> Result<Turn<'_>> {
        let started = Instant::now();
        let guard = tokio::time::timeout_at(deadline, self.turn_lock.lock())
            .await
            .map_err(|_| {
                OrchestratorError::timed_out(
                    format!("waiting for the agent in {} to finish its turn", self.environment),
                    started.elapsed(),
                )
            })?;
        *lock(&self.turn_buffer) = Some(String::new());
        Ok(Turn {
            session: self,
            _guard: guard,
        })
    }

    fn detach(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }

    fn handle_inbound(&self, line: &str) {
        if let Some(transcript) = self.transcript.get() {
            transcript.record(Direction::Inbound, line);
        }
        match acp::decode_line(line) {
            Ok(Inbound::Response { id, result }) => {
                let waiter = lock(&self.pending).remove(&id);
                let result = result.map_err(|err| OrchestratorError::AgentError {
                    code: err.code,
                    message: err.message,
                });
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => {
                        debug!(environment = %self.environment, id, "response with no pending request");
                        let text = match result {
                            Ok(value) => acp::extract_reply_text(&value).into_text(),
                            Err(err) => err.to_string(),
                        };
                        self.publish_unsolicited(text);
                    }
                }
            }
            Ok(Inbound::Notification { method, params }) => {
                if method == acp::METHOD_SESSION_UPDATE && self.in_turn() {
                    if let Some(chunk) = acp::message_chunk(&params) {
                        self.append_to_turn(chunk);
                    } else {
                        debug!(environment = %self.environment, "session update during turn");
                    }
                    return;
                }
                let text = match acp::message_chunk(&params) {
                    Some(chunk) => chunk.to_string(),
                    None => acp::extract_reply_text(params.get("update").unwrap_or(&params))
                        .into_text(),
                };
                self.publish_unsolicited(text);
            }
            Ok(Inbound::Request { id, method, .. }) => {
                debug!(environment = %self.environment, %method, "declining agent request");
                let reply = acp::method_not_found(id, &method).to_string();
                if let Some(sender) = lock(&self.outbound).as_ref()
                    && sender.try_send(reply).is_err()
                {
                    warn!(environment = %self.environment, "outbound queue full, dropped reply");
                }
                self.publish_unsolicited(format!("{} {line}", acp::UNRECOGNIZED_MARKER));
            }
            Ok(Inbound::Unrecognized(value)) => {
                self.publish_unsolicited(acp::extract_reply_text(&value).into_text());
            }
            Err(err) => {
                warn!(environment = %self.environment, error = %err, "undecodable agent line");
                self.publish_unsolicited(format!("{} {line}", acp::UNRECOGNIZED_MARKER));
            }
        }
    }

    fn in_turn(&self) -> bool {
        lock(&self.turn_buffer).is_some()
    }

    fn append_to_turn(&self, chunk: &str) {
        if let Some(buffer) = lock(&self.turn_buffer).as_mut() {
            buffer.push_str(chunk);
        }
    }

    fn publish_unsolicited(&self, text: String) {
        if text.is_empty() {
            return;
        }
        let message = ChatMessage::new(
            Entity::agent(&self.environment),
            text,
            self.spawn_metadata.clone(),
        );
        self.bus.publish(
            SOURCE,
            EventKind::AgentMessage {
                environment: self.environment.clone(),
                correlation_id: None,
                unsolicited: true,
                message,
            },
        );
    }
}

/// Exclusive prompt turn. Dropping it stops chunk collection.
pub(crate) struct Turn<'a> {
    session: &'a Session,
    _guard: MutexGuard<'a, ()>,
}

impl Turn<'_> {
    /// Text streamed so far in this turn.
    pub(crate) fn take_streamed(&self) -> String {
        lock(&self.session.turn_buffer)
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        lock(&self.session.turn_buffer).take();
    }
}

/// Reply to an outstanding request.
pub struct PendingReply {
    correlation_id: u64,
    rx: oneshot::Receiver<Result<Value>>,
    session: Arc<Session>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub async fn wait(self, timeout: Duration) -> Result<Value> {
        self.wait_until(Instant::now() + timeout).await
    }

    /// On expiry the waiter is detached; a late reply is published as unsolicited.
    pub async fn wait_until(self, deadline: Instant) -> Result<Value> {
        let started = Instant::now();
        match tokio::time::timeout_at(deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OrchestratorError::SessionLost(
                self.session.environment.clone(),
            )),
            Err(_) => {
                self.session.detach(self.correlation_id);
                Err(OrchestratorError::timed_out(
                    format!(
                        "waiting for reply {} from agent in {}",
                        self.correlation_id, self.session.environment
                    ),
                    started.elapsed(),
                ))
            }
        }
    }
}

/// Caller-side view of a spawned session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub environment: String,
    pub agent_session_id: Option<String>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Wait until the session reports `wanted`. False on timeout or teardown.
    pub async fn wait_for_status(&mut self, wanted: SessionStatus, timeout: Duration) -> bool {
        let reached = async {
            let _ = self.status.wait_for(|s| *s == wanted).await;
        };
        tokio::time::timeout(timeout, reached).await.is_ok() && self.status() == wanted
    }
}

/// Reader and writer tasks pumping one transport.
pub(crate) struct Connection {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    child: Option<tokio::process::Child>,
}

impl Connection {
    pub(crate) fn attach(session: &Arc<Session>, transport: AgentTransport, queue: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(queue.max(1));
        *lock(&session.outbound) = Some(tx);

        let mut sink = FramedWrite::new(transport.writer, LinesCodec::new());
        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(err) = sink.send(line).await {
                    warn!(error = %err, "agent write failed");
                    break;
                }
            }
        });

        let mut lines = FramedRead::new(
            transport.reader,
            LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
        );
        let reader_session = Arc::clone(session);
        let reader = tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) if line.trim().is_empty() => {}
                    Ok(line) => reader_session.handle_inbound(&line),
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        warn!(
                            environment = %reader_session.environment,
                            "agent line exceeded max length, skipped"
                        );
                    }
                    Err(LinesCodecError::Io(err)) => {
                        warn!(environment = %reader_session.environment, error = %err, "agent read failed");
                        break;
                    }
                }
            }
            debug!(environment = %reader_session.environment, "agent stream ended");
        });

        Self {
            reader,
            writer,
            child: transport.child,
        }
    }

    /// Resolves once either direction of the transport is gone.
    pub(crate) async fn closed(&mut self) {
        tokio::select! {
            _ = &mut self.reader => {}
            _ = &mut self.writer => {}
        }
    }

    pub(crate) async fn shutdown(mut self) {
        self.reader.abort();
        self.writer.abort();
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill().await;
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
