mod client;
mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thalassa_protocol::Command;

#[derive(Parser)]
#[command(name = "thalassa", about = "Manage project environments and coding agents")]
struct Cli {
    /// Daemon control socket
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the thalassa daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// List configured ship images
    Ships,

    /// List known projects
    Projects,

    /// Register a project
    Create {
        /// Project name
        name: String,

        /// Ship image to build from
        #[arg(long, default_value = "base")]
        ship: String,

        /// Repository cloned into the workspace on first launch
        #[arg(long)]
        git_url: Option<String>,
    },

    /// Build a project's image
    Build {
        name: String,
    },

    /// Start a project's container
    Launch {
        name: String,
    },

    /// Stop a project's container
    Stop {
        name: String,
    },

    /// Remove a project and its container
    Delete {
        name: String,
    },

    /// Show a project's state and agent session
    Status {
        name: String,
    },

    /// Run a shell command inside a project's container
    Exec {
        name: String,

        /// Command line passed to the container shell
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Manage agent sessions
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Send a prompt to a project's agent and print the reply
    Prompt {
        name: String,

        text: String,

        /// Reply timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Reconcile recorded state with the container engine
    Reconcile,

    /// Show recorded chat history
    History {
        chat_id: String,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Chat with a project's agent through the event bus
    Chat {
        /// Project the message is addressed to
        environment: String,

        text: String,

        /// Conversation id (random when omitted)
        #[arg(long)]
        chat_id: Option<String>,

        /// Display name of the sender
        #[arg(long)]
        user: Option<String>,

        /// Keep streaming replies instead of exiting after the first
        #[arg(long)]
        follow: bool,
    },

    /// Stream bus events as JSON lines
    Subscribe {
        /// Only events concerning this project
        #[arg(long)]
        environment: Option<String>,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon
    Start {
        /// Run in foreground
        #[arg(long)]
        foreground: bool,
    },
    /// Ask the daemon to shut down
    Stop,
    /// Check daemon status
    Status,
}

#[derive(Subcommand)]
enum AgentAction {
    /// Start an agent session in a running project
    Spawn {
        name: String,

        /// Prompt sent once the session is ready
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Close a project's agent session
    Close {
        name: String,
    },
    /// List agent sessions
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let socket = cli
        .socket
        .unwrap_or_else(thalassa_protocol::paths::default_socket_path);

    match cli.command {
        Commands::Daemon { action } => match action {
            DaemonAction::Start { foreground } => commands::daemon_start(&socket, foreground).await,
            DaemonAction::Stop => commands::daemon_stop(&socket).await,
            DaemonAction::Status => commands::daemon_status().await,
        },
        Commands::Ships => commands::call(&socket, Command::ListShips).await,
        Commands::Projects => commands::call(&socket, Command::ListProjects).await,
        Commands::Create {
            name,
            ship,
            git_url,
        } => {
            commands::call(
                &socket,
                Command::CreateProject {
                    name,
                    ship,
                    git_url,
                },
            )
            .await
        }
        Commands::Build { name } => commands::call(&socket, Command::BuildProject { name }).await,
        Commands::Launch { name } => commands::call(&socket, Command::LaunchProject { name }).await,
        Commands::Stop { name } => commands::call(&socket, Command::StopProject { name }).await,
        Commands::Delete { name } => commands::call(&socket, Command::DeleteProject { name }).await,
        Commands::Status { name } => commands::call(&socket, Command::ProjectStatus { name }).await,
        Commands::Exec { name, command } => {
            commands::exec(&socket, name, command.join(" ")).await
        }
        Commands::Agent { action } => match action {
            AgentAction::Spawn { name, prompt } => {
                commands::call(
                    &socket,
                    Command::SpawnAgent {
                        name,
                        initial_prompt: prompt,
                    },
                )
                .await
            }
            AgentAction::Close { name } => {
                commands::call(&socket, Command::CloseAgent { name }).await
            }
            AgentAction::List => commands::call(&socket, Command::ListSessions).await,
        },
        Commands::Prompt {
            name,
            text,
            timeout_ms,
        } => commands::prompt(&socket, name, text, timeout_ms).await,
        Commands::Reconcile => commands::call(&socket, Command::Reconcile).await,
        Commands::History { chat_id, limit } => {
            commands::call(&socket, Command::ChatHistory { chat_id, limit }).await
        }
        Commands::Chat {
            environment,
            text,
            chat_id,
            user,
            follow,
        } => commands::chat(&socket, environment, text, chat_id, user, follow).await,
        Commands::Subscribe { environment } => commands::subscribe(&socket, environment).await,
    }
}
