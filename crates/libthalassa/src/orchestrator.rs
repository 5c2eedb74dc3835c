//! Wires the components together and maps commands onto them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use thalassa_protocol::{Command, CommandOutcome, Metadata};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::AgentBridge;
use crate::bus::EventBus;
use crate::config::OrchestratorConfig;
use crate::dispatcher::spawn_dispatcher;
use crate::engine::{AgentConnector, ContainerEngine};
use crate::environment::EnvironmentManager;
use crate::error::Result;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
use crate::store::{HistoryStore, spawn_history_recorder};

pub struct Orchestrator {
    bus: EventBus,
    environments: Arc<EnvironmentManager>,
    bridge: AgentBridge,
    history: Arc<dyn HistoryStore>,
    scheduler: SchedulerConfig,
    transcript_dir: Option<PathBuf>,
}

fn data(value: impl Serialize) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "command result could not be serialized");
            None
        }
    }
}

impl Orchestrator {
    pub fn new(
        config: &OrchestratorConfig,
        engine: Arc<dyn ContainerEngine>,
        connector: Arc<dyn AgentConnector>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let bus = EventBus::new(&config.bus);
        let environments = Arc::new(EnvironmentManager::new(
            engine,
            bus.clone(),
            config.ship_catalog(),
            &config.environments,
        ));
        let bridge = AgentBridge::new(
            Arc::clone(&environments),
            connector,
            bus.clone(),
            config.agent.clone(),
        );
        Self {
            bus,
            environments,
            bridge,
            history,
            scheduler: config.scheduler.clone(),
            transcript_dir: config.agent.transcript_dir.clone(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn environments(&self) -> &Arc<EnvironmentManager> {
        &self.environments
    }

    pub fn bridge(&self) -> &AgentBridge {
        &self.bridge
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    /// Run one command to completion. Errors come back as typed outcomes.
    pub async fn execute(&self, command: Command, metadata: Metadata) -> CommandOutcome {
        match self.run(command, metadata).await {
            Ok(data) => CommandOutcome::Ok { data },
            Err(err) => {
                let (code, message) = err.to_error_code();
                debug!(?code, %message, "command failed");
                CommandOutcome::Error { code, message }
            }
        }
    }

    async fn run(&self, command: Command, metadata: Metadata) -> Result<Option<Value>> {
        let envs = &self.environments;
        Ok(match command {
            Command::ListShips => data(envs.ships()),
            Command::ListProjects => data(envs.list()),
            Command::CreateProject {
                name,
                ship,
                git_url,
            } => data(envs.create(&name, &ship, git_url)?),
            Command::BuildProject { name } => data(envs.build(&name).await?),
            Command::LaunchProject { name } => data(envs.launch(&name).await?),
            Command::StopProject { name } => data(envs.stop(&name).await?),
            Command::DeleteProject { name } => {
                envs.delete(&name).await?;
                None
            }
            Command::ProjectStatus { name } => Some(json!({
                "environment": envs.status(&name)?,
                "session": self.bridge.session_info(&name),
            })),
            Command::ExecCommand { name, command } => data(envs.exec(&name, &command).await?),
            Command::SpawnAgent {
                name,
                initial_prompt,
            } => {
                self.bridge.spawn(&name, initial_prompt, metadata).await?;
                data(self.bridge.session_info(&name))
            }
            Command::SendPrompt {
                name,
                text,
                timeout_ms,
            } => {
                let timeout = timeout_ms.map(Duration::from_millis);
                let reply = self.bridge.prompt(&name, &text, metadata, timeout).await?;
                Some(json!({ "reply": reply }))
            }
            Command::CloseAgent { name } => {
                self.bridge.close(&name)?;
                None
            }
            Command::ListSessions => data(self.bridge.list_sessions()),
            Command::Reconcile => data(envs.reconcile().await),
            Command::ChatHistory { chat_id, limit } => {
                data(self.history.history(&chat_id, limit).await?)
            }
        })
    }

    /// Spawn the background tasks: bridge listener, dispatcher, history
    /// recorder and scheduler.
    pub fn start(self: &Arc<Self>) -> RuntimeHandle {
        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            self.bridge.spawn_listener(rx.clone()),
            spawn_dispatcher(Arc::clone(self), rx.clone()),
            spawn_history_recorder(&self.bus, Arc::clone(&self.history), rx),
        ];
        let scheduler = Scheduler::with_builtin_tasks(
            self.bus.clone(),
            Arc::clone(&self.environments),
            self.transcript_dir.clone(),
            &self.scheduler,
        )
        .start();
        info!("orchestrator started");
        RuntimeHandle {
            shutdown,
            tasks,
            scheduler,
            bridge: self.bridge.clone(),
        }
    }
}

/// Running background tasks of an [`Orchestrator`].
pub struct RuntimeHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    scheduler: SchedulerHandle,
    bridge: AgentBridge,
}

impl RuntimeHandle {
    /// Stop every task and close all agent sessions.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        self.scheduler.shutdown().await;
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        self.bridge.close_all();
        info!("orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ContainerStatus;
    use crate::testing::TestRig;
    use thalassa_protocol::{EnvironmentState, ErrorCode, ExecOutput};

    fn ok_data(outcome: CommandOutcome) -> Value {
        match outcome {
            CommandOutcome::Ok { data } => data.unwrap_or(Value::Null),
            CommandOutcome::Error { code, message } => panic!("{code:?}: {message}"),
        }
    }

    fn error_code(outcome: CommandOutcome) -> ErrorCode {
        match outcome {
            CommandOutcome::Error { code, .. } => code,
            CommandOutcome::Ok { data } => panic!("unexpected success: {data:?}"),
        }
    }

    #[tokio::test]
    async fn project_lifecycle_through_commands() {
        let rig = TestRig::new();
        let o = &rig.orchestrator;
        let meta = Metadata::new();

        let ships = ok_data(o.execute(Command::ListShips, meta.clone()).await);
        assert_eq!(ships[0]["name"], "base");

        let created = ok_data(
            o.execute(
                Command::CreateProject {
                    name: "alpha".to_string(),
                    ship: "base".to_string(),
                    git_url: None,
                },
                meta.clone(),
            )
            .await,
        );
        assert_eq!(created["state"], "down");
        assert_eq!(created["ship"], "base");

        let launched = ok_data(
            o.execute(Command::LaunchProject { name: "alpha".to_string() }, meta.clone())
                .await,
        );
        assert_eq!(launched["state"], "up");

        rig.engine.set_exec_output(ExecOutput {
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        });
        let output = ok_data(
            o.execute(
                Command::ExecCommand {
                    name: "alpha".to_string(),
                    command: "echo hi".to_string(),
                },
                meta.clone(),
            )
            .await,
        );
        assert_eq!(output["stdout"], "hi\n");

        let status = ok_data(
            o.execute(Command::ProjectStatus { name: "alpha".to_string() }, meta.clone())
                .await,
        );
        assert_eq!(status["environment"]["state"], "up");
        assert!(status["session"].is_null());

        ok_data(
            o.execute(Command::StopProject { name: "alpha".to_string() }, meta.clone())
                .await,
        );
        ok_data(
            o.execute(Command::DeleteProject { name: "alpha".to_string() }, meta.clone())
                .await,
        );
        let projects = ok_data(o.execute(Command::ListProjects, meta).await);
        assert_eq!(projects, json!([]));
    }

    #[tokio::test]
    async fn errors_map_to_codes() {
        let rig = TestRig::new();
        let o = &rig.orchestrator;
        let meta = Metadata::new();

        let code = error_code(
            o.execute(
                Command::CreateProject {
                    name: "alpha".to_string(),
                    ship: "nope".to_string(),
                    git_url: None,
                },
                meta.clone(),
            )
            .await,
        );
        assert_eq!(code, ErrorCode::UnknownShip);

        let code = error_code(
            o.execute(
                Command::SpawnAgent {
                    name: "alpha".to_string(),
                    initial_prompt: None,
                },
                meta.clone(),
            )
            .await,
        );
        assert_eq!(code, ErrorCode::EnvironmentNotReady);

        let code = error_code(
            o.execute(Command::CloseAgent { name: "alpha".to_string() }, meta.clone())
                .await,
        );
        assert_eq!(code, ErrorCode::SessionNotFound);

        let code = error_code(
            o.execute(Command::DeleteProject { name: "ghost".to_string() }, meta)
                .await,
        );
        assert_eq!(code, ErrorCode::EnvironmentNotFound);
    }

    #[tokio::test]
    async fn agent_commands_round_trip() {
        let rig = TestRig::new();
        let o = &rig.orchestrator;
        let meta = Metadata::new();
        o.environments().launch("alpha").await.expect("launch");

        let session = ok_data(
            o.execute(
                Command::SpawnAgent {
                    name: "alpha".to_string(),
                    initial_prompt: None,
                },
                meta.clone(),
            )
            .await,
        );
        assert_eq!(session["status"], "ready");
        assert_eq!(session["agent_session_id"], "sess-1");

        let reply = ok_data(
            o.execute(
                Command::SendPrompt {
                    name: "alpha".to_string(),
                    text: "ping".to_string(),
                    timeout_ms: Some(5_000),
                },
                meta.clone(),
            )
            .await,
        );
        assert_eq!(reply["reply"], "echo: ping");

        let sessions = ok_data(o.execute(Command::ListSessions, meta.clone()).await);
        assert_eq!(sessions.as_array().map(Vec::len), Some(1));

        ok_data(
            o.execute(Command::CloseAgent { name: "alpha".to_string() }, meta)
                .await,
        );
        assert!(o.bridge().list_sessions().is_empty());
    }

    #[tokio::test]
    async fn reconcile_command_reports_drift() {
        let rig = TestRig::new();
        let o = &rig.orchestrator;
        o.environments().launch("alpha").await.expect("launch");
        rig.engine.set_status("alpha", ContainerStatus::Stopped);

        let report = ok_data(o.execute(Command::Reconcile, Metadata::new()).await);
        assert_eq!(report["drifted"], 1);
        assert_eq!(
            o.environments().status("alpha").expect("status").state,
            EnvironmentState::Error
        );
    }

    #[tokio::test]
    async fn status_of_unknown_project_is_not_found() {
        let rig = TestRig::new();
        let o = &rig.orchestrator;

        let code = error_code(
            o.execute(Command::ProjectStatus { name: "ghost".to_string() }, Metadata::new())
                .await,
        );
        assert_eq!(code, ErrorCode::EnvironmentNotFound);
        let projects = ok_data(o.execute(Command::ListProjects, Metadata::new()).await);
        assert_eq!(projects, json!([]));
    }

    #[test]
    fn unserializable_result_becomes_empty_data() {
        use std::collections::HashMap;

        let keyed_by_tuple = HashMap::from([((1u8, 2u8), 3u8)]);
        assert!(data(keyed_by_tuple).is_none());
        assert_eq!(data(vec![1, 2]), Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn runtime_shuts_down_cleanly() {
        let rig = TestRig::new();
        let runtime = rig.orchestrator.start();
        runtime.shutdown().await;
    }
}
