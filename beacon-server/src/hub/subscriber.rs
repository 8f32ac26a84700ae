//! Subscriber connection state
//!
//! One `Subscriber` per live websocket connection: a bounded outbound
//! mailbox, the set of buckets the connection asked to hear about, and the
//! session identity established by login. The hub owns registration; the
//! connection's reader mutates interests and session directly.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// State for one connected client
#[derive(Debug)]
pub struct Subscriber {
    id: Uuid,
    mailbox: mpsc::Sender<Vec<u8>>,
    interests: Mutex<Vec<String>>,
    session: Mutex<Option<String>>,
    closed: CancellationToken,
}

impl Subscriber {
    /// Create a subscriber and the receiving end of its mailbox
    ///
    /// The receiver goes to the connection's writer task; everything else
    /// holds the `Arc`.
    pub fn new(mailbox_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
        let subscriber = Arc::new(Self {
            id: Uuid::new_v4(),
            mailbox: tx,
            interests: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            closed: CancellationToken::new(),
        });
        (subscriber, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether this subscriber should receive messages for `bucket`
    ///
    /// An empty interest list means "all buckets".
    pub fn wants(&self, bucket: &str) -> bool {
        let interests = self.lock_interests();
        interests.is_empty() || interests.iter().any(|b| b == bucket)
    }

    /// Start receiving events for `bucket`; duplicates are permitted and
    /// harmless
    pub fn subscribe(&self, bucket: &str) {
        self.lock_interests().push(bucket.to_string());
    }

    /// Stop receiving events for `bucket`; removes the first matching entry
    pub fn unsubscribe(&self, bucket: &str) {
        let mut interests = self.lock_interests();
        if let Some(pos) = interests.iter().position(|b| b == bucket) {
            interests.remove(pos);
        }
    }

    pub fn username(&self) -> Option<String> {
        self.lock_session().clone()
    }

    /// Bind the session identity for the rest of the connection (or until
    /// logout)
    pub fn login(&self, username: &str) {
        *self.lock_session() = Some(username.to_string());
    }

    pub fn logout(&self) {
        *self.lock_session() = None;
    }

    /// Queue a direct reply to this subscriber only
    ///
    /// Returns false when the subscriber is already closed.
    pub async fn send(&self, payload: Vec<u8>) -> bool {
        self.mailbox.send(payload).await.is_ok()
    }

    /// Outbound mailbox sender, used by the hub's dispatch loop
    pub(crate) fn mailbox(&self) -> &mpsc::Sender<Vec<u8>> {
        &self.mailbox
    }

    /// Signal the writer task to terminate; called on deregistration
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the hub has deregistered this subscriber
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn lock_interests(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.interests.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}
