//! Pending-broadcast queue
//!
//! Holds change notifications between the component that detects a mutation
//! (the record store and the scheduler sweeps) and the hub that fans them
//! out. The queue only stores messages; it does not care how they reach
//! subscribers.
//!
//! `put` never blocks and the queue is bounded only by memory, so the
//! notification source is never backpressured. Global FIFO order is the one
//! ordering guarantee. A drain task polls the queue dry and then idles,
//! which keeps broadcast latency in the sub-second range the hub targets.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::hub::HubHandle;

/// How long the drain task sleeps once the queue runs empty
pub const DEFAULT_DRAIN_IDLE: Duration = Duration::from_millis(250);

/// One queued outbound message: a bucket name and the serialized payload
///
/// The bucket routes the message inside the hub and is stripped before
/// delivery; subscribers receive exactly `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub bucket: String,
    pub payload: Vec<u8>,
}

/// Thread-safe FIFO of messages awaiting fan-out
#[derive(Debug, Clone, Default)]
pub struct BroadcastQueue {
    inner: Arc<Mutex<VecDeque<QueuedMessage>>>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the tail; never blocks
    pub fn put(&self, bucket: impl Into<String>, payload: impl Into<Vec<u8>>) {
        let msg = QueuedMessage {
            bucket: bucket.into(),
            payload: payload.into(),
        };
        self.lock().push_back(msg);
    }

    /// Pop the head, or `None` when the queue is empty; never blocks
    pub fn get(&self) -> Option<QueuedMessage> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedMessage>> {
        // A poisoned lock only means a panic mid-push/pop; the queue
        // itself is still structurally sound
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Spawn the drain task: forward queued messages to the hub until cancelled
///
/// Polls the queue dry, then idles for `idle` before polling again.
pub fn spawn_drain(
    queue: BroadcastQueue,
    hub: HubHandle,
    idle: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Broadcast drain task started");
        loop {
            // Send until the queue is empty
            while let Some(msg) = queue.get() {
                trace!("Draining broadcast for bucket {}", msg.bucket);
                if hub.dispatch(msg).await.is_err() {
                    // Hub loop is gone; nothing left to drain into
                    debug!("Broadcast drain task stopping: hub closed");
                    return;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Broadcast drain task stopping: shutdown");
                    return;
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = BroadcastQueue::new();
        q.put("a", b"first".to_vec());
        q.put("b", b"second".to_vec());

        let m = q.get().unwrap();
        assert_eq!(m.bucket, "a");
        assert_eq!(m.payload, b"first");
        let m = q.get().unwrap();
        assert_eq!(m.bucket, "b");
        assert_eq!(m.payload, b"second");
        assert!(q.get().is_none());
    }

    #[test]
    fn test_get_on_empty_returns_none() {
        let q = BroadcastQueue::new();
        assert!(q.get().is_none());
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_concurrent_producers_preserve_per_producer_order() {
        let q = BroadcastQueue::new();
        let producers = 4;
        let per_producer = 200;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..per_producer {
                        q.put(format!("p{}", p), format!("{}", i).into_bytes());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(q.len(), producers * per_producer);

        // Within each producer's bucket, sequence numbers must be ascending
        let mut last = vec![-1i64; producers];
        while let Some(msg) = q.get() {
            let p: usize = msg.bucket[1..].parse().unwrap();
            let seq: i64 = String::from_utf8(msg.payload).unwrap().parse().unwrap();
            assert!(seq > last[p], "reordered within producer {}", p);
            last[p] = seq;
        }
    }
}
