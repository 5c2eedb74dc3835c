use std::io::Write;
use std::path::Path;

use thalassa_protocol::{Command, EventKind, ExecOutput, Metadata, Request, Response};

use crate::client::ThalassaClient;

fn fail(message: &str) -> ! {
    eprintln!("error: {message}");
    std::process::exit(1);
}

async fn call_data(socket: &Path, command: Command) -> anyhow::Result<Option<serde_json::Value>> {
    let mut client = ThalassaClient::connect(socket).await?;
    let req = Request::Call {
        command,
        metadata: Metadata::new(),
    };
    match client.request(&req).await? {
        Response::Ok { data } => Ok(data),
        Response::Error { message, code } => fail(&format!("{message} ({code:?})")),
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

/// Run a command and print its result as JSON.
pub async fn call(socket: &Path, command: Command) -> anyhow::Result<()> {
    match call_data(socket, command).await? {
        Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
        None => println!("ok"),
    }
    Ok(())
}

/// Run a shell command in a container and mirror its output and exit code.
pub async fn exec(socket: &Path, name: String, command: String) -> anyhow::Result<()> {
    let data = call_data(socket, Command::ExecCommand { name, command })
        .await?
        .ok_or_else(|| anyhow::anyhow!("daemon returned no exec output"))?;
    let output: ExecOutput = serde_json::from_value(data)?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    std::io::stdout().flush()?;
    match output.exit_code {
        Some(0) => Ok(()),
        Some(code) => std::process::exit(code),
        None => std::process::exit(1),
    }
}

pub async fn prompt(
    socket: &Path,
    name: String,
    text: String,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let data = call_data(
        socket,
        Command::SendPrompt {
            name,
            text,
            timeout_ms,
        },
    )
    .await?;
    let reply = data
        .as_ref()
        .and_then(|d| d["reply"].as_str())
        .unwrap_or_default();
    println!("{reply}");
    Ok(())
}

/// Post a chat message and print replies routed back to the conversation.
pub async fn chat(
    socket: &Path,
    environment: String,
    text: String,
    chat_id: Option<String>,
    user: Option<String>,
    follow: bool,
) -> anyhow::Result<()> {
    let mut client = ThalassaClient::connect(socket).await?;
    let chat_id = chat_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let user = user
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "cli".to_string());

    let req = Request::Chat {
        chat_id,
        environment,
        user,
        text,
    };
    match client.request(&req).await? {
        Response::Ok { .. } => {}
        Response::Error { message, .. } => fail(&message),
        other => anyhow::bail!("unexpected response: {other:?}"),
    }

    while let Some(resp) = client.read_line().await? {
        match resp {
            Response::Event { event } => match event.kind {
                EventKind::AgentMessage { message, .. } => println!("{}", message.content),
                EventKind::SystemNotice { level, message, .. } => {
                    eprintln!("[{level:?}] {message}")
                }
                _ => continue,
            },
            Response::Error { message, .. } => fail(&message),
            _ => continue,
        }
        if !follow {
            break;
        }
    }
    Ok(())
}

/// Stream bus events as JSON lines.
pub async fn subscribe(socket: &Path, environment: Option<String>) -> anyhow::Result<()> {
    let mut client = ThalassaClient::connect(socket).await?;
    match client.request(&Request::Subscribe { environment }).await? {
        Response::Ok { .. } => {}
        Response::Error { message, .. } => fail(&message),
        other => anyhow::bail!("unexpected response: {other:?}"),
    }

    let mut stdout = std::io::stdout();
    while let Some(resp) = client.read_line().await? {
        match resp {
            Response::Event { event } => {
                writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
                stdout.flush()?;
            }
            Response::Error { message, .. } => fail(&message),
            _ => {}
        }
    }
    Ok(())
}

/// Start the daemon.
pub async fn daemon_start(socket: &Path, foreground: bool) -> anyhow::Result<()> {
    if foreground {
        let status = tokio::process::Command::new("thalassad")
            .arg("--socket")
            .arg(socket)
            .status()
            .await?;
        std::process::exit(status.code().unwrap_or(1));
    } else {
        let child = std::process::Command::new("thalassad")
            .arg("--socket")
            .arg(socket)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .stdin(std::process::Stdio::null())
            .spawn()?;

        println!("thalassa daemon started (pid: {})", child.id());
        Ok(())
    }
}

/// Ask the daemon to shut down over its control socket.
pub async fn daemon_stop(socket: &Path) -> anyhow::Result<()> {
    let mut client = match ThalassaClient::connect(socket).await {
        Ok(client) => client,
        Err(_) => {
            println!("thalassa daemon is not running");
            return Ok(());
        }
    };
    match client.request(&Request::Shutdown).await? {
        Response::Ok { .. } => println!("thalassa daemon stopping"),
        Response::Error { message, .. } => fail(&message),
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
    Ok(())
}

/// Check daemon status from its pid file.
pub async fn daemon_status() -> anyhow::Result<()> {
    let pid_path = thalassa_protocol::paths::pid_file_path();
    if pid_path.exists() {
        let pid_str = std::fs::read_to_string(&pid_path)?;
        let pid: i32 = pid_str.trim().parse()?;
        // SAFETY: signal 0 only checks that the process exists.
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        if alive {
            println!("thalassa daemon is running (pid: {pid})");
        } else {
            println!("thalassa daemon is not running (stale pid file)");
            let _ = std::fs::remove_file(&pid_path);
        }
    } else {
        println!("thalassa daemon is not running");
    }
    Ok(())
}
