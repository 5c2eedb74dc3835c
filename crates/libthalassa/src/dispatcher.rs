//! Turns `CommandRequested` events into `CommandResult` events.

use std::sync::Arc;

use thalassa_protocol::EventKind;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::BusError;
use crate::orchestrator::Orchestrator;

const SOURCE: &str = "dispatcher";

/// Subscribe now and serve commands until shutdown.
///
/// Every command runs in its own task so a slow launch never delays a
/// status query queued behind it.
pub fn spawn_dispatcher(
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let bus = orchestrator.bus().clone();
    let mut sub = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = sub.recv() => event,
                _ = shutdown.changed() => break,
            };
            let event = match event {
                Ok(event) => event,
                Err(BusError::Disconnected { missed }) => {
                    warn!(missed, "dispatcher fell behind, resubscribing");
                    sub = bus.subscribe();
                    continue;
                }
                Err(BusError::Closed) => break,
            };
            let EventKind::CommandRequested {
                request_id,
                command,
                metadata,
            } = &event.kind
            else {
                continue;
            };

            let orchestrator = Arc::clone(&orchestrator);
            let request_id = request_id.clone();
            let command = command.clone();
            let metadata = metadata.clone();
            tokio::spawn(async move {
                debug!(%request_id, ?command, "dispatching command");
                let outcome = orchestrator.execute(command, metadata.clone()).await;
                orchestrator.bus().publish(
                    SOURCE,
                    EventKind::CommandResult {
                        request_id,
                        outcome,
                        metadata,
                    },
                );
            });
        }
        debug!("dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestRig, next_matching};
    use std::time::Duration;
    use thalassa_protocol::{Command, CommandOutcome, ErrorCode, Metadata};

    #[tokio::test]
    async fn results_echo_request_id_and_metadata() {
        let rig = TestRig::new();
        let orchestrator = Arc::clone(&rig.orchestrator);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _dispatcher = spawn_dispatcher(Arc::clone(&orchestrator), shutdown_rx);
        let bus = orchestrator.bus().clone();
        let mut sub = bus.subscribe();

        let metadata = Metadata::from([("origin".to_string(), "control".to_string())]);
        bus.publish(
            "test",
            EventKind::CommandRequested {
                request_id: "r1".to_string(),
                command: Command::ExecCommand {
                    name: "alpha".to_string(),
                    command: "echo hi".to_string(),
                },
                metadata: metadata.clone(),
            },
        );

        let result = next_matching(&mut sub, Duration::from_secs(5), |e| {
            matches!(&e.kind, EventKind::CommandResult { request_id, .. } if request_id == "r1")
        })
        .await
        .expect("command result");
        match &result.kind {
            EventKind::CommandResult {
                outcome, metadata: echoed, ..
            } => {
                assert_eq!(echoed, &metadata);
                assert!(matches!(
                    outcome,
                    CommandOutcome::Error {
                        code: ErrorCode::EnvironmentNotReady,
                        ..
                    }
                ));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
