//! Per-session publish/subscribe for output items.

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::OutputItem;

/// Capacity of the broadcast channel behind [`OutputBus::stream`].
const STREAM_CAPACITY: usize = 1024;

type Callback = Arc<dyn Fn(&OutputItem) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(u64, Callback)>,
    closed: bool,
}

/// Fan-out of output items to callbacks and streams, in publish order.
///
/// Delivery iterates over a snapshot of the subscriber list, so a callback
/// may unsubscribe itself (or anyone else) while an item is being delivered.
pub struct OutputBus {
    registry: Arc<RwLock<Registry>>,
    sender: Mutex<Option<broadcast::Sender<OutputItem>>>,
}

impl Default for OutputBus {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Register a callback. Once the bus is closed, the returned
    /// subscription is inert and the callback is never invoked.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OutputItem) + Send + Sync + 'static,
    {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if registry.closed {
            return Subscription::inert();
        }

        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.push((id, Arc::new(callback)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `item` to every current subscriber, synchronously.
    pub fn publish(&self, item: &OutputItem) {
        let snapshot: Vec<Callback> = {
            let registry = self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if registry.closed {
                return;
            }
            registry
                .subscribers
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };

        for callback in snapshot {
            callback(item);
        }

        if let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = sender.send(item.clone()); // no live streams is fine
        }
    }

    /// Stream of items published after this call. Ends when the bus closes;
    /// a receiver that falls too far behind skips the items it missed.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, OutputItem> {
        let receiver = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe);

        match receiver {
            Some(rx) => BroadcastStream::new(rx)
                .filter_map(|res| async move { res.ok() })
                .boxed(),
            None => futures::stream::empty().boxed(),
        }
    }

    /// Drop every subscriber and refuse new ones.
    pub fn close(&self) {
        {
            let mut registry = self
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            registry.closed = true;
            registry.subscribers.clear();
        }
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

/// Registration handle returned by [`OutputBus::subscribe`].
///
/// Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    id: u64,
    registry: Weak<RwLock<Registry>>,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            id: 0,
            registry: Weak::new(),
        }
    }

    /// Stop receiving items. Safe to call more than once, and from inside
    /// a callback.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
