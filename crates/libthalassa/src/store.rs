//! Chat history persistence.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use rusqlite::{Connection, params};
use thalassa_protocol::{ChatMessage, Entity, EventKind, Metadata};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{BusError, EventBus};
use crate::error::{OrchestratorError, Result};

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a message. Messages without a `chat_id` are ignored.
    async fn record(&self, message: ChatMessage) -> Result<()>;
    /// Up to `limit` most recent messages of a chat, oldest first.
    async fn history(&self, chat_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;
}

/// SQLite-backed history.
///
/// The connection sits behind a `std::sync::Mutex` and every query runs on a
/// blocking thread so the runtime never waits on disk I/O.
pub struct SqliteHistory {
    conn: Arc<StdMutex<Connection>>,
}

fn store_err(err: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Store(err.to_string())
}

impl SqliteHistory {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(store_err)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        // WAL keeps readers off the writer's back.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(store_err)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "opened chat history");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(store_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL,
                chat_id     TEXT NOT NULL,
                sender      TEXT NOT NULL,
                content     TEXT NOT NULL,
                timestamp   INTEGER NOT NULL,
                metadata    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, seq);",
        )
        .map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| store_err(format!("lock poisoned: {e}")))?;
            f(&conn).map_err(store_err)
        })
        .await
        .map_err(|e| store_err(format!("spawn_blocking failed: {e}")))?
    }
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn record(&self, message: ChatMessage) -> Result<()> {
        let Some(chat_id) = message.chat_id.clone() else {
            return Ok(());
        };
        let sender = serde_json::to_string(&message.sender).map_err(store_err)?;
        let metadata = serde_json::to_string(&message.metadata).map_err(store_err)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, chat_id, sender, content, timestamp, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    chat_id,
                    sender,
                    message.content,
                    message.timestamp_epoch_ms as i64,
                    metadata
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn history(&self, chat_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let chat_id = chat_id.to_string();
        let rows = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sender, content, timestamp, metadata FROM (
                         SELECT seq, id, sender, content, timestamp, metadata
                         FROM messages WHERE chat_id = ?1
                         ORDER BY seq DESC LIMIT ?2
                     ) ORDER BY seq ASC",
                )?;
                let rows = stmt.query_map(params![chat_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;
                rows.map(|row| row.map(|r| (chat_id.clone(), r)))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        rows.into_iter()
            .map(|(chat_id, (id, sender, content, timestamp, metadata))| {
                Ok(ChatMessage {
                    id,
                    chat_id: Some(chat_id),
                    sender: serde_json::from_str::<Entity>(&sender).map_err(store_err)?,
                    content,
                    timestamp_epoch_ms: timestamp.max(0) as u64,
                    metadata: serde_json::from_str::<Metadata>(&metadata).map_err(store_err)?,
                })
            })
            .collect()
    }
}

/// Background task persisting chat traffic that carries a `chat_id`.
pub fn spawn_history_recorder(
    bus: &EventBus,
    store: Arc<dyn HistoryStore>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut sub = bus.subscribe();
    let bus = bus.clone();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = sub.recv() => event,
                _ = shutdown.changed() => break,
            };
            let event = match event {
                Ok(event) => event,
                Err(BusError::Disconnected { missed }) => {
                    warn!(missed, "history recorder fell behind, resubscribing");
                    sub = bus.subscribe();
                    continue;
                }
                Err(BusError::Closed) => break,
            };
            let message = match &event.kind {
                EventKind::ChatMessage { message } | EventKind::AgentMessage { message, .. } => {
                    message
                }
                _ => continue,
            };
            if message.chat_id.is_none() {
                continue;
            }
            if let Err(err) = store.record(message.clone()).await {
                warn!(error = %err, message_id = %message.id, "failed to record chat message");
            }
        }
        debug!("history recorder stopped");
    })
}
