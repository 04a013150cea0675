//! Process-local job update bus for single-node runs and tests.

use std::collections::HashMap;
use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, Keyed, Subscription};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

#[derive(Debug)]
struct Subscribers<M> {
    /// Receive every message.
    all: Vec<mpsc::Sender<M>>,
    /// Receive only messages whose [`Keyed::key`] matches.
    by_key: HashMap<String, Vec<mpsc::Sender<M>>>,
}

/// In-memory pub/sub bus keyed by message routing key.
///
/// A message goes to every catch-all subscriber and to the subscribers of
/// its own key; one image's SSE client never sees another image's updates.
/// Dead subscribers are pruned on the next publish that would reach them.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Subscribers<M>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscription that only receives messages published under `key`.
    pub fn subscribe_key(&self, key: &str) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.by_key.entry(key.to_string()).or_default().push(tx);
        }
        Subscription::new(rx)
    }

    /// Live subscribers, keyed and catch-all, as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|s| s.all.len() + s.by_key.values().map(Vec::len).sum::<usize>())
            .unwrap_or(0)
    }

    /// Keys with at least one subscriber as of the last publish.
    pub fn key_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.by_key.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Subscribers {
                all: Vec::new(),
                by_key: HashMap::new(),
            }),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Keyed + Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        subs.all.retain(|tx| tx.send(message.clone()).is_ok());

        let key = message.key();
        if let Some(keyed) = subs.by_key.get_mut(key) {
            keyed.retain(|tx| tx.send(message.clone()).is_ok());
            if keyed.is_empty() {
                subs.by_key.remove(key);
            }
        }

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.all.push(tx);
        }
        Subscription::new(rx)
    }
}
