//! Fan-out of canvas events to connected viewers.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a subscriber
//! whose queue is full or whose receiving side has gone away is dropped on
//! the spot, so one stalled viewer cannot hold up the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use drawbridge_core::protocol::CanvasEvent;

pub type SubscriberId = u64;

/// A serialized event frame, shared by every subscriber it is delivered to.
pub type Frame = Arc<str>;

/// Receiving side handed to a new subscriber.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<Frame>,
}

pub struct Hub {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Frame>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<Frame>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber whose queue starts with `bootstrap`.
    ///
    /// The caller must hold the store lock while calling this so that no
    /// mutation can slip in between the snapshot and the registration.
    pub fn subscribe(&self, bootstrap: &[CanvasEvent]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer.max(bootstrap.len()));

        for event in bootstrap {
            if let Some(frame) = encode(event) {
                // Capacity covers the bootstrap frames.
                let _ = tx.try_send(frame);
            }
        }

        let mut subscribers = self.subscribers();
        subscribers.insert(id, tx);
        debug!(subscriber = id, total = subscribers.len(), "Subscriber registered");
        Subscription { id, rx }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers();
        let removed = subscribers.remove(&id).is_some();
        if removed {
            debug!(subscriber = id, total = subscribers.len(), "Subscriber removed");
        }
        removed
    }

    /// Deliver `event` to every live subscriber. Returns how many accepted it.
    pub fn publish(&self, event: &CanvasEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let mut subscribers = self.subscribers();
        subscribers.retain(|id, tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = id, event = event.name(), "Subscriber queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = id, "Subscriber gone, dropping");
                false
            }
        });

        debug!(event = event.name(), delivered = subscribers.len(), "Event published");
        subscribers.len()
    }

    /// Deliver `event` to a single subscriber, through its ordinary queue.
    pub fn send_to(&self, id: SubscriberId, event: &CanvasEvent) -> bool {
        let Some(frame) = encode(event) else {
            return false;
        };
        let mut subscribers = self.subscribers();
        let Some(tx) = subscribers.get(&id) else {
            return false;
        };
        if tx.try_send(frame).is_ok() {
            return true;
        }
        subscribers.remove(&id);
        false
    }

    pub fn len(&self) -> usize {
        self.subscribers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers().is_empty()
    }
}

fn encode(event: &CanvasEvent) -> Option<Frame> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to serialize event");
            None
        }
    }
}
