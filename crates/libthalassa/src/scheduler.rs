//! Independently timed maintenance tasks.
//!
//! Each cycle runs in its own tokio task bounded by the schedule's timeout.
//! Errors, panics and timeouts are logged, published as `SystemNotice`, and
//! the task is rescheduled as usual.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thalassa_protocol::{EnvironmentState, ErrorCode, EventKind, Metadata, NoticeLevel};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::prune_transcripts;
use crate::bus::EventBus;
use crate::environment::{EnvironmentManager, ProbeOutcome};
use crate::error::OrchestratorError;

const SOURCE: &str = "scheduler";

#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Random extra delay in `[0, jitter_ms]` added to every interval.
    pub jitter_ms: u64,
    pub timeout_secs: u64,
}

impl ScheduleConfig {
    fn every(interval_secs: u64, jitter_ms: u64, timeout_secs: u64) -> Self {
        Self {
            enabled: true,
            interval_secs,
            jitter_ms,
            timeout_secs,
        }
    }

    pub fn schedule(&self) -> TaskSchedule {
        TaskSchedule {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            jitter: Duration::from_millis(self.jitter_ms),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::every(60, 5_000, 30)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub health_probe: ScheduleConfig,
    pub reconcile: ScheduleConfig,
    pub log_prune: ScheduleConfig,
    pub transcript_max_age_hours: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            health_probe: ScheduleConfig::every(60, 5_000, 30),
            reconcile: ScheduleConfig::every(300, 10_000, 120),
            log_prune: ScheduleConfig::every(3_600, 60_000, 60),
            transcript_max_age_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSchedule {
    pub interval: Duration,
    pub jitter: Duration,
    pub timeout: Duration,
}

impl TaskSchedule {
    fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Succeeded,
    Failed(String),
    Panicked,
    TimedOut,
}

pub struct Scheduler {
    bus: EventBus,
    tasks: Vec<(Arc<dyn PeriodicTask>, TaskSchedule)>,
}

impl Scheduler {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            tasks: Vec::new(),
        }
    }

    pub fn add(&mut self, task: Arc<dyn PeriodicTask>, schedule: TaskSchedule) -> &mut Self {
        self.tasks.push((task, schedule));
        self
    }

    /// Register the built-in maintenance tasks that are enabled in `config`.
    pub fn with_builtin_tasks(
        bus: EventBus,
        environments: Arc<EnvironmentManager>,
        transcript_dir: Option<PathBuf>,
        config: &SchedulerConfig,
    ) -> Self {
        let mut scheduler = Self::new(bus);
        if config.health_probe.enabled {
            scheduler.add(
                Arc::new(HealthProbeTask::new(Arc::clone(&environments))),
                config.health_probe.schedule(),
            );
        }
        if config.reconcile.enabled {
            scheduler.add(
                Arc::new(ReconcileTask::new(Arc::clone(&environments))),
                config.reconcile.schedule(),
            );
        }
        if config.log_prune.enabled
            && let Some(dir) = transcript_dir
        {
            let max_age = Duration::from_secs(config.transcript_max_age_hours * 3_600);
            scheduler.add(
                Arc::new(LogPruneTask::new(dir, max_age)),
                config.log_prune.schedule(),
            );
        }
        scheduler
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(task, _)| task.name()).collect()
    }

    pub fn start(self) -> SchedulerHandle {
        let (shutdown, _) = watch::channel(false);
        let handles = self
            .tasks
            .into_iter()
            .map(|(task, schedule)| {
                info!(task = task.name(), ?schedule, "scheduling task");
                tokio::spawn(run_periodic(
                    task,
                    schedule,
                    self.bus.clone(),
                    shutdown.subscribe(),
                ))
            })
            .collect();
        SchedulerHandle { shutdown, handles }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_periodic(
    task: Arc<dyn PeriodicTask>,
    schedule: TaskSchedule,
    bus: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(schedule.next_delay()) => {}
            _ = shutdown.changed() => break,
        }
        run_cycle(&task, &schedule, &bus).await;
    }
    debug!(task = task.name(), "task stopped");
}

/// Run one attempt of `task` in isolation and report its outcome.
pub async fn run_cycle(
    task: &Arc<dyn PeriodicTask>,
    schedule: &TaskSchedule,
    bus: &EventBus,
) -> CycleOutcome {
    let name = task.name();
    let runner = Arc::clone(task);
    let mut handle = tokio::spawn(async move { runner.run().await });
    let outcome = match tokio::time::timeout(schedule.timeout, &mut handle).await {
        Ok(Ok(Ok(()))) => CycleOutcome::Succeeded,
        Ok(Ok(Err(err))) => CycleOutcome::Failed(format!("{err:#}")),
        Ok(Err(join_err)) if join_err.is_panic() => CycleOutcome::Panicked,
        Ok(Err(join_err)) => CycleOutcome::Failed(join_err.to_string()),
        Err(_) => {
            handle.abort();
            // The attempt is fully dropped before the outcome is reported.
            let _ = handle.await;
            CycleOutcome::TimedOut
        }
    };

    let (code, message) = match &outcome {
        CycleOutcome::Succeeded => {
            debug!(task = name, "task cycle succeeded");
            return outcome;
        }
        CycleOutcome::Failed(reason) => (None, format!("task {name} failed: {reason}")),
        CycleOutcome::Panicked => (None, format!("task {name} panicked")),
        CycleOutcome::TimedOut => (
            Some(ErrorCode::TimedOut),
            format!(
                "task {name} abandoned after {}s",
                schedule.timeout.as_secs_f64()
            ),
        ),
    };
    warn!(task = name, %message, "task cycle failed");
    bus.publish(
        SOURCE,
        EventKind::SystemNotice {
            level: NoticeLevel::Warning,
            code: code.or(Some(ErrorCode::ServerError)),
            environment: None,
            message,
            metadata: Metadata::new(),
        },
    );
    outcome
}

/// Probes every `Up` environment, serialized with its lock.
pub struct HealthProbeTask {
    environments: Arc<EnvironmentManager>,
}

impl HealthProbeTask {
    pub fn new(environments: Arc<EnvironmentManager>) -> Self {
        Self { environments }
    }
}

#[async_trait]
impl PeriodicTask for HealthProbeTask {
    fn name(&self) -> &'static str {
        "health_probe"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let mut failed = Vec::new();
        for env in self.environments.list() {
            if env.state != EnvironmentState::Up {
                continue;
            }
            match self.environments.probe(&env.name).await {
                Ok(ProbeOutcome::InSync) => {}
                Ok(ProbeOutcome::Drifted) => {
                    info!(environment = %env.name, "health probe found drift")
                }
                Err(OrchestratorError::EnvironmentBusy(_))
                | Err(OrchestratorError::EnvironmentNotFound(_)) => {
                    debug!(environment = %env.name, "skipping busy environment")
                }
                Err(err) => failed.push(format!("{}: {err}", env.name)),
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("health probe failed for {}", failed.join(", ")))
        }
    }
}

pub struct ReconcileTask {
    environments: Arc<EnvironmentManager>,
}

impl ReconcileTask {
    pub fn new(environments: Arc<EnvironmentManager>) -> Self {
        Self { environments }
    }
}

#[async_trait]
impl PeriodicTask for ReconcileTask {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let report = self.environments.reconcile().await;
        if report.failed > 0 {
            return Err(anyhow!(
                "{} of {} environments could not be observed",
                report.failed,
                report.checked + report.failed
            ));
        }
        Ok(())
    }
}

pub struct LogPruneTask {
    dir: PathBuf,
    max_age: Duration,
}

impl LogPruneTask {
    pub fn new(dir: PathBuf, max_age: Duration) -> Self {
        Self { dir, max_age }
    }
}

#[async_trait]
impl PeriodicTask for LogPruneTask {
    fn name(&self) -> &'static str {
        "log_prune"
    }

    async fn run(&self) -> anyhow::Result<()> {
        prune_transcripts(&self.dir, self.max_age)
            .await
            .with_context(|| format!("pruning transcripts in {}", self.dir.display()))?;
        Ok(())
    }
}
