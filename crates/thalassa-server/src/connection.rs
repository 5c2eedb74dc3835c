use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use libthalassa::{BusError, ChatRelay, CommandClient, EventBus, Subscription};
use serde_json::json;
use thalassa_protocol::{
    ErrorCode, Event, MAX_JSON_LINE_BYTES, META_ORIGIN, PROTOCOL_VERSION, Request, Response,
};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, warn};

const CONTROL_ORIGIN: &str = "control";

pub struct ConnectionContext {
    pub bus: EventBus,
    pub commands: CommandClient,
    pub chat: ChatRelay,
    pub outbound_queue: usize,
}

/// Queue a response for the writer task. A full queue means the client is not
/// keeping up and gets disconnected.
fn enqueue_response(out_tx: &mpsc::Sender<Response>, response: Response) -> Result<()> {
    match out_tx.try_send(response) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(anyhow!("client outbound queue full")),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow!("connection closed")),
    }
}

/// Per-connection forwarding tasks plus the signal they use to drop the client.
struct Streams {
    subscription: Option<JoinHandle<()>>,
    chats: HashMap<String, JoinHandle<()>>,
    kick_tx: watch::Sender<bool>,
}

impl Streams {
    fn abort_all(&mut self) {
        if let Some(task) = self.subscription.take() {
            task.abort();
        }
        for (_, task) in self.chats.drain() {
            task.abort();
        }
    }
}

pub async fn handle_connection(
    stream: UnixStream,
    ctx: Arc<ConnectionContext>,
    shutdown_tx: watch::Sender<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<Response>(ctx.outbound_queue.max(1));
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let writer_task = tokio::spawn(async move {
        while let Some(resp) = out_rx.recv().await {
            let line = match serde_json::to_string(&resp) {
                Ok(line) => line,
                Err(err) => {
                    error!("failed to encode response: {err}");
                    continue;
                }
            };

            if let Err(err) = writer.send(line).await {
                warn!("socket write failed: {err}");
                break;
            }
        }
    });

    if enqueue_response(
        &out_tx,
        Response::Hello {
            protocol_version: PROTOCOL_VERSION,
            features: vec![
                "call".to_string(),
                "subscribe".to_string(),
                "chat".to_string(),
                "queue_drop_disconnect".to_string(),
            ],
        },
    )
    .is_err()
    {
        writer_task.abort();
        return;
    }

    let (kick_tx, mut kick_rx) = watch::channel(false);
    let mut streams = Streams {
        subscription: None,
        chats: HashMap::new(),
        kick_tx,
    };
    let mut shutdown_requested = false;

    loop {
        let next = tokio::select! {
            next = reader.next() => next,
            _ = kick_rx.changed() => {
                warn!("dropping slow client");
                break;
            }
        };
        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                warn!("socket read failed: {err}");
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(err) => {
                if enqueue_response(
                    &out_tx,
                    Response::Error {
                        message: format!("invalid request: {err}"),
                        code: ErrorCode::InvalidRequest,
                    },
                )
                .is_err()
                {
                    break;
                }
                continue;
            }
        };

        match handle_request(req, &ctx, &out_tx, &mut streams).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Shutdown) => {
                shutdown_requested = true;
                break;
            }
            Err(err) => {
                debug!("closing connection: {err}");
                break;
            }
        }
    }

    streams.abort_all();
    drop(out_tx);
    let _ = writer_task.await;
    // Signal only after the acknowledgement has been written.
    if shutdown_requested {
        shutdown_tx.send_replace(true);
    }
}

enum Flow {
    Continue,
    Shutdown,
}

async fn handle_request(
    req: Request,
    ctx: &ConnectionContext,
    out_tx: &mpsc::Sender<Response>,
    streams: &mut Streams,
) -> Result<Flow> {
    match req {
        Request::Call {
            command,
            mut metadata,
        } => {
            metadata
                .entry(META_ORIGIN.to_string())
                .or_insert_with(|| CONTROL_ORIGIN.to_string());
            let response = match ctx.commands.call(command, metadata).await {
                Ok(outcome) => Response::from(outcome),
                Err(err) => {
                    let (code, message) = err.to_error_code();
                    Response::Error { message, code }
                }
            };
            enqueue_response(out_tx, response)?;
        }
        Request::Subscribe { environment } => {
            let sub = ctx.bus.subscribe();
            let task = tokio::spawn(forward_events(
                sub,
                out_tx.clone(),
                streams.kick_tx.clone(),
                move |event: &Event| match &environment {
                    Some(name) => event.kind.environment() == Some(name.as_str()),
                    None => true,
                },
            ));
            if let Some(old) = streams.subscription.replace(task) {
                old.abort();
            }
            enqueue_response(out_tx, Response::Ok {
                data: Some(json!({"subscribed": true})),
            })?;
        }
        Request::Unsubscribe => {
            if let Some(task) = streams.subscription.take() {
                task.abort();
            }
            enqueue_response(out_tx, Response::Ok {
                data: Some(json!({"subscribed": false})),
            })?;
        }
        Request::Chat {
            chat_id,
            environment,
            user,
            text,
        } => {
            // Subscribe before publishing so a fast reply is not missed.
            let relay = ctx.chat.clone();
            let sub = relay.subscribe();
            let filter_chat = chat_id.clone();
            let task = tokio::spawn(forward_events(
                sub,
                out_tx.clone(),
                streams.kick_tx.clone(),
                move |event: &Event| relay.is_reply_for(event, &filter_chat),
            ));
            if let Some(old) = streams.chats.insert(chat_id.clone(), task) {
                old.abort();
            }
            let message = ctx.chat.send(&chat_id, &environment, &user, &text);
            enqueue_response(out_tx, Response::Ok {
                data: Some(json!({"chat_id": chat_id, "message_id": message.id})),
            })?;
        }
        Request::Shutdown => {
            enqueue_response(out_tx, Response::Ok {
                data: Some(json!({"shutting_down": true})),
            })?;
            return Ok(Flow::Shutdown);
        }
    }

    Ok(Flow::Continue)
}

async fn forward_events<F>(
    mut sub: Subscription,
    out: mpsc::Sender<Response>,
    kick_tx: watch::Sender<bool>,
    filter: F,
) where
    F: Fn(&Event) -> bool + Send + 'static,
{
    loop {
        match sub.recv().await {
            Ok(event) => {
                if !filter(&event) {
                    continue;
                }
                let response = Response::Event {
                    event: Box::new(event.as_ref().clone()),
                };
                if let Err(err) = enqueue_response(&out, response) {
                    warn!("event forwarding stopped: {err}");
                    kick_tx.send_replace(true);
                    break;
                }
            }
            Err(BusError::Disconnected { missed }) => {
                let _ = enqueue_response(
                    &out,
                    Response::Error {
                        message: format!("subscription dropped after missing {missed} events"),
                        code: ErrorCode::ServerError,
                    },
                );
                break;
            }
            Err(BusError::Closed) => break,
        }
    }
}
