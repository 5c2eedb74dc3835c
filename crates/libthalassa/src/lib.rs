pub mod agent;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod docker;
pub mod engine;
pub mod environment;
pub mod error;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod surface;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent::{AgentBridge, BridgeConfig, PendingReply, ReconnectConfig, SessionHandle};
pub use bus::{BusConfig, BusError, EventBus, OverflowPolicy, Subscription};
pub use config::{OrchestratorConfig, ShipConfig};
pub use docker::{DockerCli, DockerConfig};
pub use engine::{AgentConnector, AgentTransport, ContainerEngine, ContainerSpec, ContainerStatus};
pub use environment::{AdmissionPolicy, EnvironmentConfig, EnvironmentManager, ReconcileReport};
pub use error::{EngineError, OrchestratorError, Result};
pub use orchestrator::{Orchestrator, RuntimeHandle};
pub use scheduler::{PeriodicTask, Scheduler, SchedulerConfig, SchedulerHandle, TaskSchedule};
pub use store::{HistoryStore, SqliteHistory};
pub use surface::{ChatRelay, CommandClient};
