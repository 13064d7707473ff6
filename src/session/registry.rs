//! Listener registry shared by every scope opened on a session.
//! Each subscription is keyed by a handle so removal is idempotent, and every
//! subscribe/remove is logged.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use super::events::{EventKind, SessionEvent};

pub type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    label: String,
    listener: Listener,
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<EventKind, Vec<Entry>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, label: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("Trader->{} registered for .on('{}')", label, kind);

        self.lock().entry(kind).or_default().push(Entry {
            id,
            label: label.to_string(),
            listener,
        });
        id
    }

    /// Remove a listener. Returns false when it was already gone.
    pub fn remove(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };
        let Some(index) = entries.iter().position(|e| e.id == id) else {
            return false;
        };

        let entry = entries.remove(index);
        debug!("Trader->{} removed for {}", entry.label, kind);
        true
    }

    pub fn is_registered(&self, kind: EventKind, id: ListenerId) -> bool {
        self.lock()
            .get(&kind)
            .map(|entries| entries.iter().any(|e| e.id == id))
            .unwrap_or(false)
    }

    /// Deliver an event to every listener of its kind, returning how many ran.
    ///
    /// Listeners are snapshotted first; one removed by an earlier listener in
    /// the same dispatch is skipped.
    pub fn dispatch(&self, event: &SessionEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(ListenerId, Listener)> = self
            .lock()
            .get(&kind)
            .map(|entries| entries.iter().map(|e| (e.id, e.listener.clone())).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            if self.is_registered(kind, id) {
                listener(event);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<EventKind, Vec<Entry>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    use crate::api::Side;

    fn executed(order_id: &str) -> SessionEvent {
        SessionEvent::TradeExecuted {
            order_id: order_id.to_string(),
            side: Side::Buy,
            price: dec!(100),
            trade_size: dec!(1),
            remaining_size: dec!(0),
            time: Utc::now(),
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ListenerRegistry::new();
        let id = registry.subscribe(EventKind::TradeExecuted, "noop", Arc::new(|_| {}));
        assert_eq!(registry.count(EventKind::TradeExecuted), 1);

        assert!(registry.remove(EventKind::TradeExecuted, id));
        assert!(!registry.remove(EventKind::TradeExecuted, id));
        assert_eq!(registry.count(EventKind::TradeExecuted), 0);
    }

    #[test]
    fn test_dispatch_only_matching_kind() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        registry.subscribe(
            EventKind::TradeFinalized,
            "finalized",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(registry.dispatch(&executed("a")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_removed_mid_dispatch_is_skipped() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let second: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let reg = Arc::downgrade(&registry);
        let victim = second.clone();
        registry.subscribe(
            EventKind::TradeExecuted,
            "remover",
            Arc::new(move |_| {
                if let (Some(reg), Some(id)) = (reg.upgrade(), *victim.lock().unwrap()) {
                    reg.remove(EventKind::TradeExecuted, id);
                }
            }),
        );

        let counter = hits.clone();
        let id = registry.subscribe(
            EventKind::TradeExecuted,
            "counter",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        *second.lock().unwrap() = Some(id);

        assert_eq!(registry.dispatch(&executed("a")), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(registry.total(), 1);
    }
}
