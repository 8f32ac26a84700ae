//! Subscriber hub
//!
//! Owns the set of live subscriber connections and fans queued broadcasts
//! out to the ones whose interest list matches. All mutation of the
//! subscriber set happens inside a single event loop multiplexing three
//! channels (add, remove, dispatch), so the set needs no lock and
//! operations are strictly serialized.
//!
//! Delivery policy: a full mailbox is waited on, never dropped. One stalled
//! subscriber therefore throttles dispatch for everyone behind it; that is
//! the documented trade, slow consumers degrade latency rather than lose
//! messages. A closed mailbox means the connection died and triggers
//! deregistration instead.

mod subscriber;

pub use subscriber::Subscriber;

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use beacon_common::db::setting_i64;
use beacon_common::{Error, Result};

use crate::broadcast::QueuedMessage;

/// Depth of the hub's own control/dispatch channels (not the per-subscriber
/// mailboxes)
const HUB_CHANNEL_DEPTH: usize = 64;

/// Hub tunables, settings-table backed
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-subscriber mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 8192,
        }
    }
}

impl HubConfig {
    /// Load hub configuration from the settings table, falling back to
    /// defaults
    pub async fn from_database(pool: &SqlitePool) -> Self {
        let defaults = Self::default();
        Self {
            mailbox_capacity: setting_i64(pool, "mailbox_capacity", defaults.mailbox_capacity as i64)
                .await
                .max(1) as usize,
        }
    }
}

/// Cloneable handle for talking to the hub event loop
#[derive(Debug, Clone)]
pub struct HubHandle {
    add_tx: mpsc::Sender<Arc<Subscriber>>,
    remove_tx: mpsc::Sender<Uuid>,
    dispatch_tx: mpsc::Sender<QueuedMessage>,
}

impl HubHandle {
    /// Register a subscriber with the hub
    pub async fn add(&self, subscriber: Arc<Subscriber>) -> Result<()> {
        self.add_tx
            .send(subscriber)
            .await
            .map_err(|_| Error::Internal("hub event loop has stopped".to_string()))
    }

    /// Deregister a subscriber; signals its writer task to terminate
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        self.remove_tx
            .send(id)
            .await
            .map_err(|_| Error::Internal("hub event loop has stopped".to_string()))
    }

    /// Hand a queued broadcast to the event loop for fan-out
    pub async fn dispatch(&self, message: QueuedMessage) -> Result<()> {
        self.dispatch_tx
            .send(message)
            .await
            .map_err(|_| Error::Internal("hub event loop has stopped".to_string()))
    }
}

/// The hub event loop state; run with [`Hub::run`]
pub struct Hub {
    subscribers: HashMap<Uuid, Arc<Subscriber>>,
    add_rx: mpsc::Receiver<Arc<Subscriber>>,
    remove_rx: mpsc::Receiver<Uuid>,
    dispatch_rx: mpsc::Receiver<QueuedMessage>,
}

/// Create a hub and its handle
pub fn channel() -> (HubHandle, Hub) {
    let (add_tx, add_rx) = mpsc::channel(HUB_CHANNEL_DEPTH);
    let (remove_tx, remove_rx) = mpsc::channel(HUB_CHANNEL_DEPTH);
    let (dispatch_tx, dispatch_rx) = mpsc::channel(HUB_CHANNEL_DEPTH);
    (
        HubHandle {
            add_tx,
            remove_tx,
            dispatch_tx,
        },
        Hub {
            subscribers: HashMap::new(),
            add_rx,
            remove_rx,
            dispatch_rx,
        },
    )
}

impl Hub {
    /// Run the event loop until cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Hub event loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(subscriber) = self.add_rx.recv() => {
                    debug!("Subscriber {} registered ({} total)", subscriber.id(), self.subscribers.len() + 1);
                    self.subscribers.insert(subscriber.id(), subscriber);
                }
                Some(id) = self.remove_rx.recv() => {
                    self.remove(id);
                }
                Some(message) = self.dispatch_rx.recv() => {
                    self.dispatch(message).await;
                }
                else => break,
            }
        }
        // Release every writer task on the way out
        for (_, subscriber) in self.subscribers.drain() {
            subscriber.close();
        }
        info!("Hub event loop stopped");
    }

    fn remove(&mut self, id: Uuid) {
        if let Some(subscriber) = self.subscribers.remove(&id) {
            subscriber.close();
            debug!("Subscriber {} removed ({} remaining)", id, self.subscribers.len());
        }
    }

    /// Fan one message out to every interested subscriber
    async fn dispatch(&mut self, message: QueuedMessage) {
        let mut dead = Vec::new();

        for (id, subscriber) in &self.subscribers {
            if subscriber.is_closed() || !subscriber.wants(&message.bucket) {
                continue;
            }

            // Fast path first; on a full mailbox fall back to an awaited
            // send so the message is never dropped
            match subscriber.mailbox().try_send(message.payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(payload)) => {
                    trace!("Subscriber {} mailbox full, waiting", id);
                    if subscriber.mailbox().send(payload).await.is_err() {
                        dead.push(*id);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }

        for id in dead {
            self.remove(id);
        }
    }
}
