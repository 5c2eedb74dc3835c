use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thalassa_protocol::now_epoch_ms;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const TRANSCRIPT_QUEUE: usize = 1024;
const TRANSCRIPT_EXTENSION: &str = "log";

#[derive(Debug, Clone, Copy)]
pub(crate) enum Direction {
    Outbound,
    Inbound,
}

/// Append-only record of every line exchanged with one agent session.
#[derive(Clone)]
pub(crate) struct Transcript {
    tx: mpsc::Sender<String>,
}

impl Transcript {
    pub(crate) async fn open(dir: &Path, environment: &str, session_key: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{environment}-{session_key}.{TRANSCRIPT_EXTENSION}"));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let (tx, mut rx) = mpsc::channel::<String>(TRANSCRIPT_QUEUE);
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(err) = file.write_all(entry.as_bytes()).await {
                    warn!(path = %path.display(), error = %err, "transcript write failed");
                    break;
                }
            }
            let _ = file.flush().await;
        });
        Ok(Self { tx })
    }

    pub(crate) fn record(&self, direction: Direction, line: &str) {
        let arrow = match direction {
            Direction::Outbound => "->",
            Direction::Inbound => "<-",
        };
        let entry = format!("{} {arrow} {line}\n", now_epoch_ms());
        if self.tx.try_send(entry).is_err() {
            debug!("transcript queue full, dropping line");
        }
    }
}

/// Delete transcripts in `dir` last written more than `max_age` ago.
pub async fn prune_transcripts(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path: PathBuf = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(TRANSCRIPT_EXTENSION) {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        if modified < cutoff {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, "pruned agent transcripts");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transcript_appends_both_directions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transcript = Transcript::open(dir.path(), "alpha", "s1")
            .await
            .expect("open");
        transcript.record(Direction::Outbound, r#"{"id":1}"#);
        transcript.record(Direction::Inbound, r#"{"id":1,"result":{}}"#);
        drop(transcript);

        let path = dir.path().join("alpha-s1.log");
        let mut contents = String::new();
        for _ in 0..50 {
            contents = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if contents.lines().count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#"-> {"id":1}"#));
        assert!(lines[1].contains("<- "));
    }

    #[tokio::test]
    async fn prune_removes_only_old_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("alpha-old.log"), "x").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "keep").expect("write");

        assert_eq!(
            prune_transcripts(dir.path(), Duration::from_secs(3600))
                .await
                .expect("prune"),
            0
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            prune_transcripts(dir.path(), Duration::ZERO)
                .await
                .expect("prune"),
            1
        );
        assert!(!dir.path().join("alpha-old.log").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn prune_missing_dir_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        assert_eq!(
            prune_transcripts(&missing, Duration::ZERO).await.expect("prune"),
            0
        );
    }
}
