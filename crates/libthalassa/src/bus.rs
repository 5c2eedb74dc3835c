//! Process-wide publish/subscribe channel.
//!
//! Every subscriber reads from a bounded window of `capacity` events. A
//! subscriber that falls further behind is handled according to the
//! configured [`OverflowPolicy`]; publishers are never slowed down.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thalassa_protocol::{Event, EventKind};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// What happens to a subscriber that falls more than `capacity` events behind.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Skip the oldest unread events and keep going. The loss is logged and
    /// counted in [`Subscription::dropped`].
    #[default]
    DropOldest,
    /// Report [`BusError::Disconnected`] once, then refuse further reads.
    Disconnect,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BusConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUS_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("subscriber fell {missed} events behind and was disconnected")]
    Disconnected { missed: u64 },
    #[error("event bus closed")]
    Closed,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<Event>>,
    overflow: OverflowPolicy,
}

impl EventBus {
    pub fn new(config: &BusConfig) -> Self {
        let (tx, _rx) = broadcast::channel(config.capacity.max(1));
        Self {
            tx,
            overflow: config.overflow,
        }
    }

    /// Stamp and publish an event. Never blocks.
    pub fn publish(&self, source: &str, kind: EventKind) -> Arc<Event> {
        self.publish_event(Event::new(source, kind))
    }

    pub fn publish_event(&self, event: Event) -> Arc<Event> {
        let event = Arc::new(event);
        // No receivers is not an error: late subscribers miss prior events.
        let receivers = self.tx.send(Arc::clone(&event)).unwrap_or(0);
        debug!(
            event = event.kind.name(),
            source = %event.source,
            receivers,
            "published"
        );
        event
    }

    /// New subscription starting at the next published event.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            overflow: self.overflow,
            dropped: 0,
            disconnected: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Arc<Event>>,
    overflow: OverflowPolicy,
    dropped: u64,
    disconnected: bool,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<Arc<Event>, BusError> {
        if self.disconnected {
            return Err(BusError::Closed);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    if let Some(err) = self.on_lag(missed) {
                        return Err(err);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// Non-blocking receive; `Ok(None)` when nothing is queued.
    pub fn try_recv(&mut self) -> Result<Option<Arc<Event>>, BusError> {
        if self.disconnected {
            return Err(BusError::Closed);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    if let Some(err) = self.on_lag(missed) {
                        return Err(err);
                    }
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// Total events skipped under [`OverflowPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn on_lag(&mut self, missed: u64) -> Option<BusError> {
        match self.overflow {
            OverflowPolicy::DropOldest => {
                self.dropped += missed;
                warn!(missed, total = self.dropped, "bus subscriber lagged, dropped oldest events");
                None
            }
            OverflowPolicy::Disconnect => {
                self.disconnected = true;
                warn!(missed, "bus subscriber lagged, disconnecting");
                Some(BusError::Disconnected { missed })
            }
        }
    }
}
