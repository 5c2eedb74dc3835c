use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use thalassa_protocol::{
    Entity, Environment, EnvironmentState, EventKind, ExecOutput, Metadata, NoticeLevel, ShipInfo,
    now_epoch_ms,
};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::engine::{ContainerEngine, ContainerSpec, ContainerStatus, LogStream};
use crate::error::{EngineError, OrchestratorError, Result};

const SOURCE: &str = "environments";
const MAX_NAME_LEN: usize = 63;
const ABANDONED: &str = "transition abandoned";

/// How a second caller is treated while a transition holds an environment.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    #[default]
    FailFast,
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Reject with `EnvironmentBusy`.
    FailFast,
    /// Queue behind the lock for at most this long, then `TimedOut`.
    Wait(Duration),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub admission: AdmissionMode,
    pub admission_timeout_ms: u64,
    /// Deadline for a single engine call. Unset means no deadline.
    pub engine_timeout_secs: Option<u64>,
    /// Relaunch an environment that reconcile found stopped behind our back.
    pub restart_on_drift: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionMode::FailFast,
            admission_timeout_ms: 5_000,
            engine_timeout_secs: Some(600),
            restart_on_drift: false,
        }
    }
}

impl EnvironmentConfig {
    pub fn admission_policy(&self) -> AdmissionPolicy {
        match self.admission {
            AdmissionMode::FailFast => AdmissionPolicy::FailFast,
            AdmissionMode::Wait => {
                AdmissionPolicy::Wait(Duration::from_millis(self.admission_timeout_ms))
            }
        }
    }

    pub fn engine_timeout(&self) -> Option<Duration> {
        self.engine_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub drifted: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    InSync,
    Drifted,
}

/// One arena entry: the belief record plus the lock that grants mutation rights.
struct Slot {
    record: StdRwLock<Environment>,
    lock: Arc<RwLock<()>>,
    removed: AtomicBool,
}

impl Slot {
    fn new(env: Environment) -> Arc<Self> {
        Arc::new(Self {
            record: StdRwLock::new(env),
            lock: Arc::new(RwLock::new(())),
            removed: AtomicBool::new(false),
        })
    }

    fn snapshot(&self) -> Environment {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut Environment) -> R) -> R {
        let mut record = self.record.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut record)
    }
}

/// Shared hold on an environment that is `Up`. Transitions wait for it to drop.
pub struct EnvironmentLease {
    pub environment: Environment,
    _guard: OwnedRwLockReadGuard<()>,
}

pub struct EnvironmentManager {
    slots: DashMap<String, Arc<Slot>>,
    ships: BTreeMap<String, ShipInfo>,
    directory: DashMap<String, Entity>,
    engine: Arc<dyn ContainerEngine>,
    bus: EventBus,
    admission: AdmissionPolicy,
    engine_timeout: Option<Duration>,
    restart_on_drift: bool,
}

impl EnvironmentManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        bus: EventBus,
        ships: Vec<ShipInfo>,
        config: &EnvironmentConfig,
    ) -> Self {
        let directory = DashMap::new();
        directory.insert(Entity::System.id(), Entity::System);
        Self {
            slots: DashMap::new(),
            ships: ships.into_iter().map(|s| (s.name.clone(), s)).collect(),
            directory,
            engine,
            bus,
            admission: config.admission_policy(),
            engine_timeout: config.engine_timeout(),
            restart_on_drift: config.restart_on_drift,
        }
    }

    pub fn ships(&self) -> Vec<ShipInfo> {
        self.ships.values().cloned().collect()
    }

    /// Register a project from a ship template.
    pub fn create(&self, name: &str, ship: &str, git_url: Option<String>) -> Result<Environment> {
        validate_name(name)?;
        let ship_info = self
            .ships
            .get(ship)
            .ok_or_else(|| OrchestratorError::UnknownShip(ship.to_string()))?;
        match self.slots.entry(name.to_string()) {
            Entry::Occupied(_) => Err(OrchestratorError::EnvironmentExists(name.to_string())),
            Entry::Vacant(vacant) => {
                let mut env = Environment::new(name);
                env.ship = Some(ship_info.name.clone());
                env.git_url = git_url;
                vacant.insert(Slot::new(env.clone()));
                self.register_entity(Entity::agent(name));
                info!(environment = %name, %ship, "environment created");
                Ok(env)
            }
        }
    }

    pub async fn build(&self, name: &str) -> Result<Environment> {
        let engine = Arc::clone(&self.engine);
        let result = self
            .transition(
                name,
                &[EnvironmentState::Down, EnvironmentState::Error],
                "down or error",
                EnvironmentState::Building,
                EnvironmentState::Up,
                move |spec| async move {
                    engine.build(&spec).await?;
                    engine.start(&spec).await
                },
            )
            .await;
        self.report_failure(name, "build", &result);
        result
    }

    pub async fn launch(&self, name: &str) -> Result<Environment> {
        let engine = Arc::clone(&self.engine);
        let result = self
            .transition(
                name,
                &[EnvironmentState::Down, EnvironmentState::Error],
                "down or error",
                EnvironmentState::Building,
                EnvironmentState::Up,
                move |spec| async move { engine.start(&spec).await },
            )
            .await;
        self.report_failure(name, "launch", &result);
        result
    }

    pub async fn stop(&self, name: &str) -> Result<Environment> {
        let engine = Arc::clone(&self.engine);
        let result = self
            .transition(
                name,
                &[EnvironmentState::Up, EnvironmentState::Error],
                "up or error",
                EnvironmentState::Stopping,
                EnvironmentState::Down,
                move |spec| async move { engine.stop(&spec.name).await },
            )
            .await;
        self.report_failure(name, "stop", &result);
        result
    }

    /// Run a command in an `Up` environment. Never retried.
    pub async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput> {
        let result = self.exec_inner(name, command).await;
        self.report_failure(name, "exec", &result);
        result
    }

    async fn exec_inner(&self, name: &str, command: &str) -> Result<ExecOutput> {
        let lease = self.lock_up(name).await?;
        info!(environment = %name, %command, "exec");
        self.engine_call(
            &format!("exec in {name}"),
            self.engine.exec(&lease.environment.name, command),
        )
        .await
    }

    /// Container output for an existing environment. Not gated on state.
    pub async fn logs(&self, name: &str, follow: bool) -> Result<LogStream> {
        let env = self
            .get(name)
            .ok_or_else(|| OrchestratorError::EnvironmentNotFound(name.to_string()))?;
        Ok(self.engine.logs(&env.name, follow).await?)
    }

    /// Current belief for an existing environment.
    pub fn status(&self, name: &str) -> Result<Environment> {
        self.get(name)
            .ok_or_else(|| OrchestratorError::EnvironmentNotFound(name.to_string()))
    }

    /// Belief for an existing environment, without creating one.
    pub fn get(&self, name: &str) -> Option<Environment> {
        self.slots.get(name).map(|slot| slot.snapshot())
    }

    pub fn list(&self) -> Vec<Environment> {
        let mut all: Vec<Environment> = self.slots.iter().map(|slot| slot.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Remove a stopped environment and its container.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let result = self.delete_inner(name).await;
        self.report_failure(name, "delete", &result);
        result
    }

    async fn delete_inner(&self, name: &str) -> Result<()> {
        let slot = self
            .slots
            .get(name)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| OrchestratorError::EnvironmentNotFound(name.to_string()))?;
        let _guard = self.admit(name, &slot).await?;
        let current = slot.snapshot();
        if !matches!(current.state, EnvironmentState::Down | EnvironmentState::Error) {
            return Err(OrchestratorError::EnvironmentNotReady {
                name: name.to_string(),
                state: current.state,
                required: "down or error",
            });
        }
        self.engine_call(&format!("removing {name}"), self.engine.remove(name))
            .await?;
        slot.removed.store(true, Ordering::SeqCst);
        self.slots.remove(name);
        self.directory.remove(&Entity::agent(name).id());
        info!(environment = %name, "environment deleted");
        self.notice(
            NoticeLevel::Info,
            None,
            Some(name),
            format!("environment {name} deleted"),
        );
        Ok(())
    }

    /// Compare belief with the engine for every idle environment.
    pub async fn reconcile(&self) -> ReconcileReport {
        let names: Vec<String> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        let mut report = ReconcileReport::default();
        for name in names {
            match self.probe(&name).await {
                Ok(ProbeOutcome::InSync) => report.checked += 1,
                Ok(ProbeOutcome::Drifted) => {
                    report.checked += 1;
                    report.drifted += 1;
                }
                Err(OrchestratorError::EnvironmentBusy(_))
                | Err(OrchestratorError::EnvironmentNotFound(_)) => report.skipped += 1,
                Err(_) => report.failed += 1,
            }
        }
        info!(
            checked = report.checked,
            drifted = report.drifted,
            skipped = report.skipped,
            failed = report.failed,
            "reconcile finished"
        );
        report
    }

    /// Reconcile one existing environment. Busy environments are not waited for.
    pub async fn probe(&self, name: &str) -> Result<ProbeOutcome> {
        let slot = self
            .slots
            .get(name)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| OrchestratorError::EnvironmentNotFound(name.to_string()))?;
        let _guard = Arc::clone(&slot.lock)
            .try_write_owned()
            .map_err(|_| OrchestratorError::EnvironmentBusy(name.to_string()))?;
        if slot.removed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::EnvironmentNotFound(name.to_string()));
        }

        let observed = match self
            .engine_call(&format!("probing {name}"), self.engine.status(name))
            .await
        {
            Ok(observed) => observed,
            Err(err) => {
                self.report_failure::<()>(name, "probe", &Err(err.clone()));
                return Err(err);
            }
        };
        slot.update(|env| env.last_observed_at_epoch_ms = Some(now_epoch_ms()));

        let believed = slot.snapshot().state;
        match (believed, observed) {
            (EnvironmentState::Up, ContainerStatus::Stopped | ContainerStatus::Missing) => {
                let drift = OrchestratorError::ReconcileDrift {
                    name: name.to_string(),
                    believed,
                    observed: format!("{observed:?}").to_lowercase(),
                };
                warn!(environment = %name, ?observed, "environment drifted from up");
                self.set_state(&slot, EnvironmentState::Error, Some(drift.to_string()));
                self.notice(
                    NoticeLevel::Warning,
                    Some(&drift),
                    Some(name),
                    drift.to_string(),
                );
                if self.restart_on_drift {
                    info!(environment = %name, "restarting after drift");
                    let engine = Arc::clone(&self.engine);
                    let relaunch = self
                        .drive(
                            &slot,
                            EnvironmentState::Building,
                            EnvironmentState::Up,
                            move |spec| async move { engine.start(&spec).await },
                        )
                        .await;
                    self.report_failure(name, "restart", &relaunch);
                }
                Ok(ProbeOutcome::Drifted)
            }
            (EnvironmentState::Down | EnvironmentState::Error, ContainerStatus::Running) => {
                let drift = OrchestratorError::ReconcileDrift {
                    name: name.to_string(),
                    believed,
                    observed: "running".to_string(),
                };
                info!(environment = %name, "adopting running container");
                self.set_state(&slot, EnvironmentState::Up, None);
                self.notice(NoticeLevel::Info, Some(&drift), Some(name), drift.to_string());
                Ok(ProbeOutcome::Drifted)
            }
            _ => Ok(ProbeOutcome::InSync),
        }
    }

    /// Shared hold on an `Up` environment, admitted like any other caller.
    pub async fn lock_up(&self, name: &str) -> Result<EnvironmentLease> {
        let slot = self.slot(name)?;
        let guard = match self.admission {
            AdmissionPolicy::FailFast => Arc::clone(&slot.lock)
                .try_read_owned()
                .map_err(|_| OrchestratorError::EnvironmentBusy(name.to_string()))?,
            AdmissionPolicy::Wait(deadline) => {
                tokio::time::timeout(deadline, Arc::clone(&slot.lock).read_owned())
                    .await
                    .map_err(|_| {
                        OrchestratorError::timed_out(format!("waiting for {name}"), deadline)
                    })?
            }
        };
        let environment = slot.snapshot();
        if slot.removed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::EnvironmentNotFound(name.to_string()));
        }
        if environment.state != EnvironmentState::Up {
            return Err(OrchestratorError::EnvironmentNotReady {
                name: name.to_string(),
                state: environment.state,
                required: "up",
            });
        }
        Ok(EnvironmentLease {
            environment,
            _guard: guard,
        })
    }

    pub fn register_entity(&self, entity: Entity) {
        self.directory.insert(entity.id(), entity);
    }

    pub fn resolve_entity(&self, id: &str) -> Option<Entity> {
        self.directory.get(id).map(|entity| entity.value().clone())
    }

    async fn transition<F, Fut>(
        &self,
        name: &str,
        allowed: &[EnvironmentState],
        required: &'static str,
        through: EnvironmentState,
        to: EnvironmentState,
        op: F,
    ) -> Result<Environment>
    where
        F: FnOnce(ContainerSpec) -> Fut,
        Fut: Future<Output = std::result::Result<(), EngineError>>,
    {
        let slot = self.slot(name)?;
        let _guard = self.admit(name, &slot).await?;
        if slot.removed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::EnvironmentNotFound(name.to_string()));
        }
        let current = slot.snapshot();
        if !allowed.contains(&current.state) {
            return Err(OrchestratorError::EnvironmentNotReady {
                name: name.to_string(),
                state: current.state,
                required,
            });
        }
        self.drive(&slot, through, to, op).await
    }

    /// Move through `through` to `to`; the caller holds the write lock.
    async fn drive<F, Fut>(
        &self,
        slot: &Slot,
        through: EnvironmentState,
        to: EnvironmentState,
        op: F,
    ) -> Result<Environment>
    where
        F: FnOnce(ContainerSpec) -> Fut,
        Fut: Future<Output = std::result::Result<(), EngineError>>,
    {
        let current = slot.snapshot();
        let name = current.name.clone();
        self.set_state(slot, through, None);
        let in_flight = InFlight {
            manager: self,
            slot,
            through,
        };
        let spec = self.container_spec(&current);
        let result = self.engine_call(&format!("{through} {name}"), op(spec)).await;
        in_flight.settled();
        match result {
            Ok(()) => {
                slot.update(|env| env.last_observed_at_epoch_ms = Some(now_epoch_ms()));
                self.set_state(slot, to, None);
                info!(environment = %name, state = %to, "transition complete");
                Ok(slot.snapshot())
            }
            Err(err) => {
                warn!(environment = %name, error = %err, "transition failed");
                self.set_state(slot, EnvironmentState::Error, Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn admit(&self, name: &str, slot: &Slot) -> Result<OwnedRwLockWriteGuard<()>> {
        match self.admission {
            AdmissionPolicy::FailFast => Arc::clone(&slot.lock)
                .try_write_owned()
                .map_err(|_| OrchestratorError::EnvironmentBusy(name.to_string())),
            AdmissionPolicy::Wait(deadline) => {
                tokio::time::timeout(deadline, Arc::clone(&slot.lock).write_owned())
                    .await
                    .map_err(|_| {
                        OrchestratorError::timed_out(format!("waiting for {name}"), deadline)
                    })
            }
        }
    }

    async fn engine_call<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = std::result::Result<T, EngineError>>,
    ) -> Result<T> {
        match self.engine_timeout {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .map_err(|_| OrchestratorError::timed_out(operation, deadline))?
                .map_err(OrchestratorError::from),
            None => fut.await.map_err(OrchestratorError::from),
        }
    }

    fn slot(&self, name: &str) -> Result<Arc<Slot>> {
        if let Some(slot) = self.slots.get(name) {
            return Ok(Arc::clone(slot.value()));
        }
        validate_name(name)?;
        let slot = self
            .slots
            .entry(name.to_string())
            .or_insert_with(|| {
                self.register_entity(Entity::agent(name));
                Slot::new(Environment::new(name))
            })
            .value()
            .clone();
        Ok(slot)
    }

    fn container_spec(&self, env: &Environment) -> ContainerSpec {
        ContainerSpec {
            name: env.name.clone(),
            ship: env.ship.as_ref().and_then(|s| self.ships.get(s)).cloned(),
            git_url: env.git_url.clone(),
        }
    }

    fn set_state(&self, slot: &Slot, new_state: EnvironmentState, detail: Option<String>) {
        let (name, old_state) = slot.update(|env| {
            let old = env.state;
            env.set_state(new_state, detail.clone());
            (env.name.clone(), old)
        });
        if old_state == new_state {
            return;
        }
        self.bus.publish(
            SOURCE,
            EventKind::EnvironmentStateChanged {
                name,
                old_state,
                new_state,
                detail,
            },
        );
    }

    fn report_failure<T>(&self, name: &str, operation: &str, result: &Result<T>) {
        if let Err(err) = result {
            let level = match err {
                OrchestratorError::EngineFailure(_) | OrchestratorError::TimedOut { .. } => {
                    NoticeLevel::Error
                }
                _ => NoticeLevel::Warning,
            };
            warn!(environment = %name, %operation, error = %err, "environment operation failed");
            self.notice(level, Some(err), Some(name), format!("{operation} {name}: {err}"));
        }
    }

    fn notice(
        &self,
        level: NoticeLevel,
        err: Option<&OrchestratorError>,
        environment: Option<&str>,
        message: String,
    ) {
        self.bus.publish(
            SOURCE,
            EventKind::SystemNotice {
                level,
                code: err.map(OrchestratorError::code),
                environment: environment.map(str::to_string),
                message,
                metadata: Metadata::new(),
            },
        );
    }
}

/// Moves a transition dropped mid-flight to `Error` so it never stays transitional.
struct InFlight<'a> {
    manager: &'a EnvironmentManager,
    slot: &'a Slot,
    through: EnvironmentState,
}

impl InFlight<'_> {
    fn settled(self) {
        std::mem::forget(self);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let name = self.slot.snapshot().name;
        let err = OrchestratorError::EngineFailure(format!(
            "{} {name} abandoned before the engine finished",
            self.through
        ));
        warn!(environment = %name, state = %self.through, "transition abandoned");
        self.manager
            .set_state(self.slot, EnvironmentState::Error, Some(ABANDONED.to_string()));
        self.manager
            .notice(NoticeLevel::Error, Some(&err), Some(&name), err.to_string());
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && !name.starts_with('-');
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Subscription;
    use crate::testing::{FakeEngine, drain};
    use thalassa_protocol::{ErrorCode, Event};

    fn manager_with(engine: Arc<FakeEngine>, config: EnvironmentConfig) -> (EnvironmentManager, EventBus) {
        let bus = EventBus::default();
        let ships = vec![ShipInfo {
            name: "rusty".to_string(),
            image: "rust:1".to_string(),
            dockerfile: None,
            description: None,
        }];
        let manager = EnvironmentManager::new(engine, bus.clone(), ships, &config);
        (manager, bus)
    }

    fn manager(engine: Arc<FakeEngine>) -> (EnvironmentManager, EventBus) {
        manager_with(engine, EnvironmentConfig::default())
    }

    fn state_changes(events: &[Arc<Event>]) -> Vec<(EnvironmentState, EnvironmentState)> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::EnvironmentStateChanged {
                    old_state,
                    new_state,
                    ..
                } => Some((*old_state, *new_state)),
                _ => None,
            })
            .collect()
    }

    fn notice_codes(events: &[Arc<Event>]) -> Vec<Option<ErrorCode>> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::SystemNotice { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }

    async fn launched(engine: &Arc<FakeEngine>) -> (EnvironmentManager, EventBus, Subscription) {
        let (manager, bus) = manager(Arc::clone(engine));
        manager.launch("alpha").await.expect("launch");
        let sub = bus.subscribe();
        (manager, bus, sub)
    }

    #[tokio::test]
    async fn launch_emits_two_transitions_in_order() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, bus) = manager(Arc::clone(&engine));
        let mut sub = bus.subscribe();

        let env = manager.launch("alpha").await.expect("launch");
        assert_eq!(env.state, EnvironmentState::Up);
        assert!(env.last_observed_at_epoch_ms.is_some());

        let events = drain(&mut sub);
        assert_eq!(
            state_changes(&events),
            vec![
                (EnvironmentState::Down, EnvironmentState::Building),
                (EnvironmentState::Building, EnvironmentState::Up),
            ]
        );
        assert_eq!(engine.calls("start"), 1);
    }

    #[tokio::test]
    async fn concurrent_launch_one_wins_one_is_busy() {
        let engine = Arc::new(FakeEngine::default());
        engine.set_delay(Duration::from_millis(50));
        let (manager, _bus) = manager(Arc::clone(&engine));
        let manager = Arc::new(manager);

        let a = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.launch("alpha").await }
        });
        let b = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.launch("alpha").await }
        });
        let results = [a.await.expect("join a"), b.await.expect("join b")];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(OrchestratorError::EnvironmentBusy(_))))
            .count();
        assert_eq!((ok, busy), (1, 1));
        assert_eq!(manager.status("alpha").expect("status").state, EnvironmentState::Up);
        assert_eq!(engine.calls("start"), 1);
    }

    #[tokio::test]
    async fn stop_during_launch_is_busy() {
        let engine = Arc::new(FakeEngine::default());
        engine.set_delay(Duration::from_millis(30));
        let (manager, _bus) = manager(Arc::clone(&engine));
        let manager = Arc::new(manager);

        let launch = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.launch("alpha").await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(
            manager.stop("alpha").await,
            Err(OrchestratorError::EnvironmentBusy(_))
        ));

        assert!(launch.await.expect("join").is_ok());
        assert_eq!(engine.calls("stop"), 0);
        assert_eq!(manager.status("alpha").expect("status").state, EnvironmentState::Up);
    }

    #[tokio::test]
    async fn launch_and_stop_queue_behind_each_other() {
        let engine = Arc::new(FakeEngine::default());
        engine.set_delay(Duration::from_millis(30));
        let config = EnvironmentConfig {
            admission: AdmissionMode::Wait,
            admission_timeout_ms: 5_000,
            ..EnvironmentConfig::default()
        };
        let (manager, bus) = manager_with(Arc::clone(&engine), config);
        let manager = Arc::new(manager);
        let mut sub = bus.subscribe();

        let launch = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.launch("alpha").await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stopped = manager.stop("alpha").await.expect("stop after launch");
        assert_eq!(stopped.state, EnvironmentState::Down);
        assert!(launch.await.expect("join").is_ok());

        assert_eq!(
            state_changes(&drain(&mut sub)),
            vec![
                (EnvironmentState::Down, EnvironmentState::Building),
                (EnvironmentState::Building, EnvironmentState::Up),
                (EnvironmentState::Up, EnvironmentState::Stopping),
                (EnvironmentState::Stopping, EnvironmentState::Down),
            ]
        );
    }

    #[tokio::test]
    async fn abandoned_transition_settles_in_error() {
        let engine = Arc::new(FakeEngine::default());
        engine.set_delay(Duration::from_secs(5));
        let (manager, bus) = manager(Arc::clone(&engine));
        let mut sub = bus.subscribe();
        tokio::time::pause();

        let cut_short =
            tokio::time::timeout(Duration::from_millis(50), manager.launch("alpha")).await;
        assert!(cut_short.is_err());

        let env = manager.status("alpha").expect("status");
        assert_eq!(env.state, EnvironmentState::Error);
        assert_eq!(env.error_detail.as_deref(), Some("transition abandoned"));
        let events = drain(&mut sub);
        assert_eq!(
            state_changes(&events),
            vec![
                (EnvironmentState::Down, EnvironmentState::Building),
                (EnvironmentState::Building, EnvironmentState::Error),
            ]
        );
        assert_eq!(notice_codes(&events), vec![Some(ErrorCode::EngineFailure)]);

        engine.set_delay(Duration::ZERO);
        let env = manager.launch("alpha").await.expect("relaunch");
        assert_eq!(env.state, EnvironmentState::Up);
    }

    #[tokio::test]
    async fn wait_admission_queues_then_rejects_by_state() {
        let engine = Arc::new(FakeEngine::default());
        engine.set_delay(Duration::from_millis(30));
        let config = EnvironmentConfig {
            admission: AdmissionMode::Wait,
            admission_timeout_ms: 5_000,
            ..EnvironmentConfig::default()
        };
        let (manager, _bus) = manager_with(Arc::clone(&engine), config);
        let manager = Arc::new(manager);

        let first = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.launch("alpha").await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = manager.launch("alpha").await;

        assert!(first.await.expect("join").is_ok());
        assert!(matches!(
            second,
            Err(OrchestratorError::EnvironmentNotReady {
                state: EnvironmentState::Up,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn exec_while_down_never_reaches_engine() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, bus) = manager(Arc::clone(&engine));
        let mut sub = bus.subscribe();

        let err = manager.exec("alpha", "echo hi").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::EnvironmentNotReady {
                state: EnvironmentState::Down,
                ..
            }
        ));
        assert_eq!(engine.calls("exec"), 0);
        assert_eq!(
            notice_codes(&drain(&mut sub)),
            vec![Some(ErrorCode::EnvironmentNotReady)]
        );
    }

    #[tokio::test]
    async fn exec_returns_engine_output_verbatim() {
        let engine = Arc::new(FakeEngine::default());
        engine.set_exec_output(ExecOutput {
            stdout: "hi\n".to_string(),
            stderr: "warn\n".to_string(),
            exit_code: Some(3),
        });
        let (manager, _bus, _sub) = launched(&engine).await;

        let output = manager.exec("alpha", "echo hi").await.expect("exec");
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.stderr, "warn\n");
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(engine.calls("exec"), 1);
    }

    #[tokio::test]
    async fn exec_failure_is_reported_not_retried() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus, mut sub) = launched(&engine).await;
        engine.fail_next("exec");

        let err = manager.exec("alpha", "false").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EngineFailure);
        assert_eq!(engine.calls("exec"), 1);
        assert_eq!(
            notice_codes(&drain(&mut sub)),
            vec![Some(ErrorCode::EngineFailure)]
        );
    }

    #[tokio::test]
    async fn failed_launch_lands_in_error_and_can_retry() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, bus) = manager(Arc::clone(&engine));
        let mut sub = bus.subscribe();
        engine.fail_next("start");

        let err = manager.launch("alpha").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EngineFailure);
        let env = manager.status("alpha").expect("status");
        assert_eq!(env.state, EnvironmentState::Error);
        assert!(env.error_detail.is_some());

        let events = drain(&mut sub);
        assert_eq!(
            state_changes(&events),
            vec![
                (EnvironmentState::Down, EnvironmentState::Building),
                (EnvironmentState::Building, EnvironmentState::Error),
            ]
        );
        assert_eq!(notice_codes(&events), vec![Some(ErrorCode::EngineFailure)]);

        let env = manager.launch("alpha").await.expect("retry launch");
        assert_eq!(env.state, EnvironmentState::Up);
        assert!(env.error_detail.is_none());
    }

    #[tokio::test]
    async fn stop_walks_back_to_down() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus, mut sub) = launched(&engine).await;

        let env = manager.stop("alpha").await.expect("stop");
        assert_eq!(env.state, EnvironmentState::Down);
        assert_eq!(
            state_changes(&drain(&mut sub)),
            vec![
                (EnvironmentState::Up, EnvironmentState::Stopping),
                (EnvironmentState::Stopping, EnvironmentState::Down),
            ]
        );
        let err = manager.stop("alpha").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EnvironmentNotReady);
    }

    #[tokio::test]
    async fn build_runs_build_then_start() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus) = manager(Arc::clone(&engine));
        manager
            .create("alpha", "rusty", Some("https://example.com/a.git".to_string()))
            .expect("create");

        manager.build("alpha").await.expect("build");
        assert_eq!(engine.calls("build"), 1);
        assert_eq!(engine.calls("start"), 1);
        let spec = engine.last_spec().expect("spec recorded");
        assert_eq!(spec.ship.map(|s| s.image), Some("rust:1".to_string()));
        assert_eq!(spec.git_url.as_deref(), Some("https://example.com/a.git"));
    }

    #[tokio::test]
    async fn engine_deadline_reports_timed_out() {
        let engine = Arc::new(FakeEngine::default());
        engine.set_delay(Duration::from_secs(5));
        let config = EnvironmentConfig {
            engine_timeout_secs: Some(1),
            ..EnvironmentConfig::default()
        };
        let (manager, _bus) = manager_with(Arc::clone(&engine), config);

        tokio::time::pause();
        let err = manager.launch("alpha").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TimedOut);
        assert_eq!(
            manager.status("alpha").expect("status").state,
            EnvironmentState::Error
        );
    }

    #[tokio::test]
    async fn status_is_idempotent() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus, _sub) = launched(&engine).await;
        let first = manager.status("alpha").expect("status");
        let second = manager.status("alpha").expect("status");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn status_does_not_create_environments() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus) = manager(Arc::clone(&engine));

        assert!(matches!(
            manager.status("ghost"),
            Err(OrchestratorError::EnvironmentNotFound(_))
        ));
        assert!(manager.list().is_empty());
        assert_eq!(manager.reconcile().await, ReconcileReport::default());
        assert_eq!(engine.calls("status"), 0);
    }

    #[tokio::test]
    async fn create_validates_ship_and_name() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus) = manager(engine);

        assert!(matches!(
            manager.create("alpha", "missing", None),
            Err(OrchestratorError::UnknownShip(_))
        ));
        assert!(matches!(
            manager.create("Bad Name", "rusty", None),
            Err(OrchestratorError::InvalidName(_))
        ));
        manager.create("alpha", "rusty", None).expect("create");
        assert!(matches!(
            manager.create("alpha", "rusty", None),
            Err(OrchestratorError::EnvironmentExists(_))
        ));
        assert_eq!(
            manager.resolve_entity("agent:alpha"),
            Some(Entity::agent("alpha"))
        );
        assert_eq!(manager.resolve_entity("system"), Some(Entity::System));
    }

    #[tokio::test]
    async fn delete_requires_stopped_environment() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus, _sub) = launched(&engine).await;

        let err = manager.delete("alpha").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EnvironmentNotReady);

        manager.stop("alpha").await.expect("stop");
        manager.delete("alpha").await.expect("delete");
        assert!(manager.get("alpha").is_none());
        assert!(manager.resolve_entity("agent:alpha").is_none());
        assert_eq!(engine.calls("remove"), 1);
        assert!(matches!(
            manager.delete("alpha").await,
            Err(OrchestratorError::EnvironmentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reconcile_marks_drift_without_restarting() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus, mut sub) = launched(&engine).await;
        engine.set_status("alpha", ContainerStatus::Stopped);

        let report = manager.reconcile().await;
        assert_eq!(report.drifted, 1);

        let env = manager.status("alpha").expect("status");
        assert_eq!(env.state, EnvironmentState::Error);
        let events = drain(&mut sub);
        assert_eq!(
            state_changes(&events),
            vec![(EnvironmentState::Up, EnvironmentState::Error)]
        );
        assert_eq!(notice_codes(&events), vec![Some(ErrorCode::ReconcileDrift)]);
        assert_eq!(engine.calls("start"), 1);
    }

    #[tokio::test]
    async fn reconcile_restarts_when_configured() {
        let engine = Arc::new(FakeEngine::default());
        let config = EnvironmentConfig {
            restart_on_drift: true,
            ..EnvironmentConfig::default()
        };
        let (manager, _bus) = manager_with(Arc::clone(&engine), config);
        manager.launch("alpha").await.expect("launch");
        engine.set_status("alpha", ContainerStatus::Missing);

        manager.reconcile().await;
        assert_eq!(
            manager.status("alpha").expect("status").state,
            EnvironmentState::Up
        );
        assert_eq!(engine.calls("start"), 2);
    }

    #[tokio::test]
    async fn reconcile_adopts_running_container_and_skips_busy() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus) = manager(Arc::clone(&engine));
        manager.create("beta", "rusty", None).expect("create beta");
        engine.set_status("beta", ContainerStatus::Running);

        let report = manager.reconcile().await;
        assert_eq!(report.drifted, 1);
        assert_eq!(
            manager.status("beta").expect("status").state,
            EnvironmentState::Up
        );

        let lease = manager.lock_up("beta").await.expect("lease");
        let report = manager.reconcile().await;
        assert_eq!(report.skipped, 1);
        drop(lease);
        assert_eq!(manager.reconcile().await.checked, 1);
    }

    #[tokio::test]
    async fn transitions_wait_for_shared_holders() {
        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus, _sub) = launched(&engine).await;
        let lease = manager.lock_up("alpha").await.expect("lease");

        assert!(matches!(
            manager.stop("alpha").await,
            Err(OrchestratorError::EnvironmentBusy(_))
        ));
        drop(lease);
        manager.stop("alpha").await.expect("stop");
    }

    #[tokio::test]
    async fn logs_need_a_known_environment() {
        use futures_util::StreamExt;

        let engine = Arc::new(FakeEngine::default());
        let (manager, _bus) = manager(engine.clone());
        assert!(matches!(
            manager.logs("ghost", false).await,
            Err(OrchestratorError::EnvironmentNotFound(_))
        ));
        assert!(manager.get("ghost").is_none());

        manager.create("alpha", "rusty", None).expect("create");
        let lines: Vec<_> = manager.logs("alpha", false).await.expect("logs").collect().await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_deref().ok(), Some("alpha: started"));
        assert_eq!(engine.calls("logs"), 1);
    }
}
