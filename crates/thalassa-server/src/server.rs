use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use libthalassa::{
    ChatRelay, CommandClient, DockerCli, HistoryStore, Orchestrator, SqliteHistory,
};
use thalassa_protocol::PROTOCOL_VERSION;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::connection::{ConnectionContext, handle_connection};

pub async fn run(cfg: RuntimeConfig) -> Result<()> {
    let history_path = cfg.orchestrator.history.path();
    let history: Arc<dyn HistoryStore> = Arc::new(
        SqliteHistory::open(&history_path)
            .with_context(|| format!("failed to open history {}", history_path.display()))?,
    );
    let docker = Arc::new(DockerCli::new(cfg.orchestrator.docker.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        &cfg.orchestrator,
        docker.clone(),
        docker,
        history,
    ));

    if let Some(parent) = cfg.socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_stale_socket(&cfg.socket_path)?;
    let listener = UnixListener::bind(&cfg.socket_path)
        .with_context(|| format!("failed to bind {}", cfg.socket_path.display()))?;
    fs::set_permissions(&cfg.socket_path, fs::Permissions::from_mode(0o600))?;
    if let Some(parent) = cfg.pid_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&cfg.pid_file, std::process::id().to_string())?;

    let runtime = orchestrator.start();
    info!(
        pid = std::process::id(),
        socket = %cfg.socket_path.display(),
        protocol_version = PROTOCOL_VERSION,
        ships = cfg.orchestrator.ships.len(),
        "thalassad started"
    );

    let ctx = Arc::new(ConnectionContext {
        bus: orchestrator.bus().clone(),
        commands: CommandClient::new(orchestrator.bus().clone(), "control", cfg.call_timeout),
        chat: ChatRelay::new(orchestrator.bus().clone()),
        outbound_queue: cfg.outbound_queue,
    });
    let active_connections: Arc<RwLock<Vec<JoinHandle<()>>>> = Arc::new(RwLock::new(Vec::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            signal_tx.send_replace(true);
        }
    });

    let accept_result = accept_loop(
        listener,
        ctx,
        shutdown_rx,
        shutdown_tx.clone(),
        Arc::clone(&active_connections),
    )
    .await;

    shutdown_tx.send_replace(true);
    for handle in active_connections.write().await.drain(..) {
        handle.abort();
    }
    runtime.shutdown().await;

    let _ = fs::remove_file(&cfg.socket_path);
    let _ = fs::remove_file(&cfg.pid_file);
    info!("thalassad stopped");

    accept_result
}

async fn accept_loop(
    listener: UnixListener,
    ctx: Arc<ConnectionContext>,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    active_connections: Arc<RwLock<Vec<JoinHandle<()>>>>,
) -> Result<()> {
    let uid = effective_uid();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };

                if let Err(err) = verify_peer_uid(&stream, uid) {
                    warn!("rejected peer: {err}");
                    continue;
                }

                let handle = tokio::spawn(handle_connection(
                    stream,
                    Arc::clone(&ctx),
                    shutdown_tx.clone(),
                ));
                let mut active = active_connections.write().await;
                active.retain(|h| !h.is_finished());
                active.push(handle);
            }
        }
    }
    Ok(())
}

fn effective_uid() -> u32 {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    Ok(())
}

fn verify_peer_uid(stream: &UnixStream, expected_uid: u32) -> Result<()> {
    let creds = stream
        .peer_cred()
        .context("failed to query peer credentials")?;
    let uid = creds.uid();
    if uid != expected_uid {
        return Err(anyhow!(
            "peer uid {uid} is not allowed (expected {expected_uid})"
        ));
    }
    Ok(())
}
