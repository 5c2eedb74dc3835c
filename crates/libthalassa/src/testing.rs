//! In-memory collaborators for exercising the runtime without docker.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, stream};
use serde_json::{Value, json};
use thalassa_protocol::{Event, ExecOutput};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::bus::Subscription;
use crate::config::{OrchestratorConfig, ShipConfig};
use crate::engine::{
    AgentConnector, AgentTransport, ContainerEngine, ContainerSpec, ContainerStatus, LogStream,
};
use crate::error::EngineError;
use crate::orchestrator::Orchestrator;
use crate::store::SqliteHistory;

/// Method the fake agent accepts but never answers.
pub const HANG_METHOD: &str = "test/hang";

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Config with one `base` ship and reconnect delays short enough for tests.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.ships.insert(
        "base".to_string(),
        ShipConfig {
            image: "thalassa/base:latest".to_string(),
            dockerfile: None,
            description: None,
        },
    );
    config.agent.handshake_timeout_ms = 2_000;
    config.agent.request_timeout_secs = 5;
    config.agent.reconnect.max_attempts = 3;
    config.agent.reconnect.base_delay_ms = 10;
    config.agent.reconnect.max_delay_ms = 50;
    config
}

/// An orchestrator over the fakes, with in-memory history.
pub struct TestRig {
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<FakeEngine>,
    pub agent: Arc<FakeAgent>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let engine = Arc::new(FakeEngine::default());
        let agent = Arc::new(FakeAgent::default());
        let history = SqliteHistory::open_in_memory().expect("in-memory history");
        let orchestrator = Orchestrator::new(
            &config,
            engine.clone(),
            agent.clone(),
            Arc::new(history),
        );
        Self {
            orchestrator: Arc::new(orchestrator),
            engine,
            agent,
        }
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything currently queued on a subscription.
pub fn drain(sub: &mut Subscription) -> Vec<Arc<Event>> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = sub.try_recv() {
        events.push(event);
    }
    events
}

/// First event matching `pred` within `timeout`.
pub async fn next_matching(
    sub: &mut Subscription,
    timeout: Duration,
    mut pred: impl FnMut(&Event) -> bool,
) -> Option<Arc<Event>> {
    tokio::time::timeout(timeout, async {
        loop {
            match sub.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[derive(Default)]
struct EngineState {
    calls: HashMap<&'static str, usize>,
    statuses: HashMap<String, ContainerStatus>,
    fail_next: HashSet<&'static str>,
    delay: Duration,
    exec_output: ExecOutput,
    last_spec: Option<ContainerSpec>,
}

/// Container engine that tracks container state in memory.
#[derive(Default)]
pub struct FakeEngine {
    state: StdMutex<EngineState>,
}

impl FakeEngine {
    pub fn calls(&self, op: &str) -> usize {
        lock(&self.state).calls.get(op).copied().unwrap_or(0)
    }

    /// Every engine call sleeps this long first.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    pub fn fail_next(&self, op: &'static str) {
        lock(&self.state).fail_next.insert(op);
    }

    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        lock(&self.state).statuses.insert(name.to_string(), status);
    }

    pub fn set_exec_output(&self, output: ExecOutput) {
        lock(&self.state).exec_output = output;
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        lock(&self.state).last_spec.clone()
    }

    async fn enter(&self, op: &'static str) -> Result<(), EngineError> {
        let (delay, fail) = {
            let mut state = lock(&self.state);
            *state.calls.entry(op).or_insert(0) += 1;
            (state.delay, state.fail_next.remove(op))
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(EngineError::CommandFailed {
                command: format!("fake {op}"),
                status: Some(1),
                stderr: format!("{op} failed"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        lock(&self.state).last_spec = Some(spec.clone());
        self.enter("build").await
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        lock(&self.state).last_spec = Some(spec.clone());
        self.enter("start").await?;
        self.set_status(&spec.name, ContainerStatus::Running);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), EngineError> {
        self.enter("stop").await?;
        self.set_status(name, ContainerStatus::Stopped);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        self.enter("remove").await?;
        lock(&self.state).statuses.remove(name);
        Ok(())
    }

    async fn exec(&self, _name: &str, _command: &str) -> Result<ExecOutput, EngineError> {
        self.enter("exec").await?;
        Ok(lock(&self.state).exec_output.clone())
    }

    async fn status(&self, name: &str) -> Result<ContainerStatus, EngineError> {
        self.enter("status").await?;
        Ok(lock(&self.state)
            .statuses
            .get(name)
            .copied()
            .unwrap_or(ContainerStatus::Missing))
    }

    async fn logs(&self, name: &str, _follow: bool) -> Result<LogStream, EngineError> {
        self.enter("logs").await?;
        let lines = vec![Ok(format!("{name}: started"))];
        Ok(stream::iter(lines).boxed())
    }
}

enum AgentControl {
    Disconnect,
    Push(String),
}

struct AgentState {
    connects: usize,
    refuse_connects: usize,
    stream_chunks: bool,
    prompt_delay: Duration,
    current: Option<mpsc::UnboundedSender<AgentControl>>,
}

/// Scripted ACP agent reached over an in-memory pipe.
///
/// `initialize` and `session/new` succeed, `session/prompt` echoes the prompt
/// back (streamed as two chunks by default), [`HANG_METHOD`] is never
/// answered and any other method echoes its params.
pub struct FakeAgent {
    state: StdMutex<AgentState>,
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self {
            state: StdMutex::new(AgentState {
                connects: 0,
                refuse_connects: 0,
                stream_chunks: true,
                prompt_delay: Duration::ZERO,
                current: None,
            }),
        }
    }
}

impl FakeAgent {
    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn refuse_next_connects(&self, n: usize) {
        lock(&self.state).refuse_connects = n;
    }

    /// Answer prompts in the result body instead of streamed chunks.
    pub fn reply_in_result(&self) {
        lock(&self.state).stream_chunks = false;
    }

    /// Hold every `session/prompt` this long before answering. Applies to new connections.
    pub fn set_prompt_delay(&self, delay: Duration) {
        lock(&self.state).prompt_delay = delay;
    }

    /// Drop the current connection from the agent side.
    pub fn disconnect(&self) {
        if let Some(current) = lock(&self.state).current.take() {
            let _ = current.send(AgentControl::Disconnect);
        }
    }

    /// Write a raw line to the client on the current connection.
    pub fn push(&self, line: impl Into<String>) {
        if let Some(current) = lock(&self.state).current.as_ref() {
            let _ = current.send(AgentControl::Push(line.into()));
        }
    }
}

#[async_trait]
impl AgentConnector for FakeAgent {
    async fn connect(&self, _environment: &str) -> Result<AgentTransport, EngineError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let (connection, stream_chunks, prompt_delay) = {
            let mut state = lock(&self.state);
            state.connects += 1;
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(EngineError::Unavailable("agent refused connection".to_string()));
            }
            state.current = Some(tx);
            (state.connects, state.stream_chunks, state.prompt_delay)
        };
        tokio::spawn(run_fake_agent(
            server,
            rx,
            connection,
            stream_chunks,
            prompt_delay,
        ));
        let (reader, writer) = tokio::io::split(client);
        Ok(AgentTransport::new(reader, writer))
    }

    fn workdir(&self, environment: &str) -> String {
        format!("/work/{environment}")
    }
}

async fn run_fake_agent(
    stream: DuplexStream,
    mut control: mpsc::UnboundedReceiver<AgentControl>,
    connection: usize,
    stream_chunks: bool,
    prompt_delay: Duration,
) {
    let (reader, writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, LinesCodec::new());
    let mut out = FramedWrite::new(writer, LinesCodec::new());
    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(Ok(line)) = line else { break };
                if !prompt_delay.is_zero() && line.contains("\"session/prompt\"") {
                    tokio::time::sleep(prompt_delay).await;
                }
                for reply in respond(&line, connection, stream_chunks) {
                    if out.send(reply).await.is_err() {
                        return;
                    }
                }
            }
            ctl = control.recv() => match ctl {
                Some(AgentControl::Push(line)) => {
                    if out.send(line).await.is_err() {
                        return;
                    }
                }
                Some(AgentControl::Disconnect) | None => break,
            },
        }
    }
}

fn respond(line: &str, connection: usize, stream_chunks: bool) -> Vec<String> {
    let Ok(request) = serde_json::from_str::<Value>(line) else {
        return Vec::new();
    };
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return Vec::new();
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    let result = |result: Value| json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();

    match method {
        "initialize" => vec![result(json!({"protocolVersion": 1, "agentCapabilities": {}}))],
        "session/new" => vec![result(json!({"sessionId": format!("sess-{connection}")}))],
        "session/prompt" => {
            let text = params["prompt"][0]["text"].as_str().unwrap_or_default();
            let reply = format!("echo: {text}");
            if !stream_chunks {
                return vec![result(json!({"content": [{"type": "text", "text": reply}]}))];
            }
            let session_id = params["sessionId"].clone();
            let mid = reply.chars().count() / 2;
            let head: String = reply.chars().take(mid).collect();
            let tail: String = reply.chars().skip(mid).collect();
            let chunk = |text: String| {
                json!({
                    "jsonrpc": "2.0",
                    "method": "session/update",
                    "params": {
                        "sessionId": session_id,
                        "update": {
                            "sessionUpdate": "agent_message_chunk",
                            "content": {"type": "text", "text": text}
                        }
                    }
                })
                .to_string()
            };
            vec![chunk(head), chunk(tail), result(json!({"stopReason": "end_turn"}))]
        }
        HANG_METHOD => Vec::new(),
        _ => vec![result(json!({"echo": params}))],
    }
}
