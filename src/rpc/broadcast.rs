//! Fan-out of state machine notifications to RPC subscribers
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: a subscriber
//! whose queue is full is evicted, which closes its receiver and makes the
//! connection task drop the client.

use crate::tunnel::{EventListener, Notification};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type SubscriberId = u64;

pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<Notification>,
}

pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Notification>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriberRegistry {
    /// `capacity` is the per-subscriber queue length and must be non-zero
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<Notification>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().insert(id, tx);
        debug!("Subscriber {} registered", id);
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.lock().remove(&id).is_some() {
            debug!("Subscriber {} removed", id);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to every subscriber; returns how many were evicted
    pub fn publish(&self, notification: &Notification) -> usize {
        let mut subscribers = self.lock();
        let mut evicted = Vec::new();

        for (id, tx) in subscribers.iter() {
            match tx.try_send(notification.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Evicting subscriber {}: queue full", id);
                    evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber {} went away", id);
                    evicted.push(*id);
                }
            }
        }

        for id in &evicted {
            subscribers.remove(id);
        }
        evicted.len()
    }
}

impl EventListener for SubscriberRegistry {
    fn notify(&self, notification: &Notification) {
        self.publish(notification);
    }
}
