//! In-process event fan-out
//!
//! Every subscriber owns a bounded FIFO. Publishing never blocks: a full
//! subscriber queue drops the event for that subscriber only.

use std::sync::Arc;

use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of each subscriber queue
const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Known peers were added, removed or modified
    KnownPeerChanged,
    /// A friend request arrived that was not auto-accepted
    ReceivedAuthRequest { peer_id: PeerId, name: String },
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber queue
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(ev)) = tx.try_send(event.clone()) {
                warn!("event subscriber queue is full, dropping {:?}", ev);
            }
        }
    }

    /// Run `callback` for every event on its own task until `cancel` fires
    pub fn subscribe_with_callback<F>(&self, cancel: CancellationToken, callback: F) -> JoinHandle<()>
    where
        F: Fn(Event) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = rx.recv() => match ev {
                        Some(ev) => callback(ev),
                        None => break,
                    },
                }
            }
            debug!("event subscription closed");
        })
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}
