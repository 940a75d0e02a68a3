//! Broadcast bus for agent events.
//!
//! Subscribers are invoked sequentially on the emitter's task; each
//! subscriber sees events from a single emit call in emit order. Panicking
//! subscribers are recovered and do not affect other subscribers or the
//! emitter. A bounded ring buffer retains the most recent events for
//! diagnostics.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use super::AgentEvent;

/// Identifier returned by subscribe, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Subscriber = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// Process-wide typed event bus.
///
/// One process-wide instance is available through [`EventBus::global`];
/// tests construct their own bus and pass it through configuration.
pub struct EventBus {
    subscribers: RwLock<Vec<(SubscriberId, Subscriber)>>,
    buffer: Mutex<VecDeque<AgentEvent>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus with the default replay-buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a bus with an explicit replay-buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// The shared process-wide bus.
    pub fn global() -> &'static Arc<EventBus> {
        static GLOBAL: OnceLock<Arc<EventBus>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(EventBus::new()))
    }

    /// Register a subscriber. The callback must return promptly; it runs on
    /// the emitter's task.
    pub fn subscribe(&self, callback: impl Fn(&AgentEvent) + Send + Sync + 'static) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|(sid, _)| *sid != id);
    }

    /// Broadcast an event to all subscribers and record it in the ring.
    ///
    /// The subscriber list snapshot is taken under the read lock and then
    /// invoked without holding it, so subscribers may themselves subscribe
    /// or emit.
    pub fn emit(&self, event: AgentEvent) {
        {
            let mut buffer = self
                .buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        let snapshot: Vec<Subscriber> = {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for subscriber in snapshot {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                tracing::warn!(
                    event_type = %event.event_type,
                    session_id = %event.session_id,
                    "event subscriber panicked; continuing"
                );
            }
        }
    }

    /// The most recent events, oldest first, up to `n`.
    pub fn recent(&self, n: usize) -> Vec<AgentEvent> {
        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = buffer.len().saturating_sub(n);
        buffer.iter().skip(skip).cloned().collect()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
