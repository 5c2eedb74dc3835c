use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command as StdCommand, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin_cmd;
use thalassa_protocol::{Command, Metadata, PROTOCOL_VERSION, Request, Response};

fn wait_for_socket(path: &Path, child: &mut Child) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        if let Some(status) = child.try_wait().expect("poll daemon") {
            panic!("daemon exited early: {status}");
        }
        assert!(Instant::now() < deadline, "socket never appeared");
        thread::sleep(Duration::from_millis(20));
    }
}

fn wait_for_exit(child: &mut Child) -> std::process::ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = child.try_wait().expect("poll daemon") {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("daemon did not exit");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn send(stream: &mut UnixStream, req: &Request) {
    let line = serde_json::to_string(req).expect("encode request");
    writeln!(stream, "{line}").expect("write request");
}

fn recv(reader: &mut BufReader<UnixStream>) -> Response {
    let mut line = String::new();
    let n = reader.read_line(&mut line).expect("read response");
    assert!(n > 0, "daemon closed the connection");
    serde_json::from_str(line.trim_end()).expect("decode response")
}

#[test]
fn help_lists_flags() {
    let output = cargo_bin_cmd!("thalassad")
        .arg("--help")
        .output()
        .expect("run thalassad");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--socket"));
    assert!(stdout.contains("--no-transcripts"));
}

#[test]
fn missing_config_file_fails_startup() {
    let output = cargo_bin_cmd!("thalassad")
        .args(["--config", "/nonexistent/thalassa.toml"])
        .output()
        .expect("run thalassad");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to read config"));
}

#[test]
fn daemon_serves_calls_and_shuts_down_on_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("thalassa.sock");
    let pid_file = dir.path().join("thalassa.pid");
    let config = dir.path().join("config.toml");
    fs::write(
        &config,
        format!(
            r#"
[server]
socket_path = "{}"
pid_file = "{}"

[history]
path = "{}"

[ships.base]
image = "thalassa/base:latest"
"#,
            socket.display(),
            pid_file.display(),
            dir.path().join("history.db").display(),
        ),
    )
    .expect("write config");

    let mut child = StdCommand::new(env!("CARGO_BIN_EXE_thalassad"))
        .arg("--config")
        .arg(&config)
        .arg("--no-transcripts")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn thalassad");
    wait_for_socket(&socket, &mut child);

    let mut stream = UnixStream::connect(&socket).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

    match recv(&mut reader) {
        Response::Hello {
            protocol_version, ..
        } => assert_eq!(protocol_version, PROTOCOL_VERSION),
        other => panic!("expected hello, got {other:?}"),
    }
    assert!(pid_file.exists());

    send(
        &mut stream,
        &Request::Call {
            command: Command::ListShips,
            metadata: Metadata::new(),
        },
    );
    match recv(&mut reader) {
        Response::Ok { data: Some(data) } => {
            assert_eq!(data[0]["name"], "base");
            assert_eq!(data[0]["image"], "thalassa/base:latest");
        }
        other => panic!("expected ships, got {other:?}"),
    }

    send(&mut stream, &Request::Shutdown);
    assert!(matches!(recv(&mut reader), Response::Ok { .. }));

    let status = wait_for_exit(&mut child);
    assert!(status.success());
    assert!(!socket.exists());
    assert!(!pid_file.exists());
}
