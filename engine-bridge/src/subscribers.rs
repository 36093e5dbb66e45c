//! Per-type subscriber lists for unsolicited engine events.
//!
//! Fan-out follows registration order. Dispatch works on a snapshot taken
//! under the lock and checks each subscription's liveness flag right before
//! calling it, so callbacks may subscribe or unsubscribe (themselves or
//! others) mid-dispatch without deadlocking.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::bridge::protocol::{Message, MessageType};

pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

struct Entry {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_type: HashMap<MessageType, Vec<Entry>>,
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Subscriber registry mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

#[derive(Clone, Default)]
pub struct Subscribers {
    registry: Arc<Mutex<Registry>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: MessageType, callback: Callback) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        let mut registry = lock_registry(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.by_type.entry(kind.clone()).or_default().push(Entry {
            id,
            active: Arc::clone(&active),
            callback,
        });
        tracing::debug!(%kind, subscription = id, "Subscriber registered");

        Subscription {
            kind,
            id,
            active,
            registry: Some(Arc::downgrade(&self.registry)),
        }
    }

    pub fn count(&self, kind: &MessageType) -> usize {
        lock_registry(&self.registry)
            .by_type
            .get(kind)
            .map_or(0, Vec::len)
    }

    /// Deliver `message` to the subscribers of its type. Returns how many ran.
    pub fn dispatch(&self, message: &Message) -> usize {
        let snapshot: Vec<(Arc<AtomicBool>, Callback)> = {
            let registry = lock_registry(&self.registry);
            match registry.by_type.get(&message.kind) {
                Some(entries) => entries
                    .iter()
                    .map(|e| (Arc::clone(&e.active), Arc::clone(&e.callback)))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for (active, callback) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                tracing::error!(kind = %message.kind, "Subscriber callback panicked");
            }
            delivered += 1;
        }

        if delivered == 0 {
            tracing::trace!(kind = %message.kind, "No subscribers for event");
        }
        delivered
    }
}

fn remove_entry(registry: &Mutex<Registry>, kind: &MessageType, id: u64) {
    let mut registry = lock_registry(registry);
    if let Some(entries) = registry.by_type.get_mut(kind) {
        entries.retain(|e| e.id != id);
        if entries.is_empty() {
            registry.by_type.remove(kind);
        }
    }
}

/// Live registration. Unsubscribes on drop unless [`detach`](Self::detach)ed.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    kind: MessageType,
    id: u64,
    active: Arc<AtomicBool>,
    registry: Option<Weak<Mutex<Registry>>>,
}

impl Subscription {
    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the callback registered for the lifetime of the bridge.
    pub fn detach(mut self) {
        self.registry = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.take() else {
            return;
        };
        self.active.store(false, Ordering::Release);
        if let Some(registry) = registry.upgrade() {
            remove_entry(&registry, &self.kind, self.id);
            tracing::debug!(kind = %self.kind, subscription = self.id, "Subscriber removed");
        }
    }
}
