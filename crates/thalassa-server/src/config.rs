use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use libthalassa::OrchestratorConfig;
use serde::Deserialize;
use thalassa_protocol::paths;

#[derive(Parser, Debug)]
#[command(name = "thalassad", version, about = "Thalassa orchestration daemon")]
pub struct Args {
    /// Control socket path
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Config file (defaults to ~/.config/thalassa/config.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory for agent session transcripts
    #[arg(long)]
    pub transcript_dir: Option<PathBuf>,

    /// Disable agent session transcripts
    #[arg(long, conflicts_with = "transcript_dir")]
    pub no_transcripts: bool,

    /// Docker binary to invoke
    #[arg(long)]
    pub docker: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub outbound_queue: usize,
    pub call_timeout: Duration,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerSection {
    socket_path: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    outbound_queue: Option<usize>,
    call_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    server: ServerSection,
    #[serde(flatten)]
    orchestrator: OrchestratorConfig,
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

pub fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = match &args.config {
        Some(path) => read_file_config(path)?,
        None => {
            let default_path = paths::config_path();
            if default_path.exists() {
                read_file_config(&default_path)?
            } else {
                FileConfig::default()
            }
        }
    };
    Ok(merge(args, file_cfg))
}

fn merge(args: &Args, file_cfg: FileConfig) -> RuntimeConfig {
    let FileConfig {
        server,
        mut orchestrator,
    } = file_cfg;

    if args.no_transcripts {
        orchestrator.agent.transcript_dir = None;
    } else if let Some(dir) = &args.transcript_dir {
        orchestrator.agent.transcript_dir = Some(dir.clone());
    } else if orchestrator.agent.transcript_dir.is_none() {
        orchestrator.agent.transcript_dir = Some(paths::transcript_dir());
    }
    if let Some(docker) = &args.docker {
        orchestrator.docker.binary = docker.clone();
    }

    // Long enough to cover a full build plus the dispatcher hop.
    let default_call_timeout = orchestrator
        .environments
        .engine_timeout_secs
        .map(|secs| secs + 30)
        .unwrap_or(3_600);

    RuntimeConfig {
        socket_path: args
            .socket
            .clone()
            .or(server.socket_path)
            .unwrap_or_else(paths::default_socket_path),
        pid_file: server.pid_file.unwrap_or_else(paths::pid_file_path),
        outbound_queue: server.outbound_queue.unwrap_or(1024),
        call_timeout: Duration::from_secs(server.call_timeout_secs.unwrap_or(default_call_timeout)),
        orchestrator,
    }
}
