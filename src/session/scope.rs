//! Per-order subscription scope.
//!
//! A scope is opened before an order is submitted and bound to the exchange
//! order id once the order is acknowledged. Events seen before the bind are
//! held back and replayed in arrival order, so a fill racing the
//! acknowledgment still reaches the handlers. Closing the scope removes every
//! listener it still owns, exactly once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::events::{EventKind, SessionEvent};
use super::registry::{Listener, ListenerId, ListenerRegistry};

/// Handler invoked with the owning scope and the matching event
pub type ScopedHandler = Arc<dyn Fn(&OrderScope, &SessionEvent) + Send + Sync>;

#[derive(Default)]
struct ScopeState {
    order_id: Option<String>,
    closed: bool,
    replaying: bool,
    handles: BTreeMap<EventKind, ListenerId>,
    handlers: BTreeMap<EventKind, ScopedHandler>,
    buffered: Vec<SessionEvent>,
}

struct ScopeInner {
    label: String,
    registry: Arc<ListenerRegistry>,
    state: Mutex<ScopeState>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (kind, id) in std::mem::take(&mut state.handles) {
            self.registry.remove(kind, id);
        }
    }
}

#[derive(Clone)]
pub struct OrderScope {
    inner: Arc<ScopeInner>,
}

impl OrderScope {
    pub(crate) fn new(label: &str, registry: Arc<ListenerRegistry>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                label: label.to_string(),
                registry,
                state: Mutex::new(ScopeState::default()),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Install the handler for one event kind. A second call for the same
    /// kind replaces the handler. Ignored once the scope is closed.
    pub fn listen(&self, kind: EventKind, handler: ScopedHandler) {
        {
            let mut state = self.lock();
            if state.closed {
                debug!("OrderScope->{} closed, not listening for {}", self.inner.label, kind);
                return;
            }
            state.handlers.insert(kind, handler);
            if state.handles.contains_key(&kind) {
                return;
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let listener: Listener = Arc::new(move |event: &SessionEvent| {
            if let Some(inner) = weak.upgrade() {
                OrderScope { inner }.deliver(event);
            }
        });
        let id = self.inner.registry.subscribe(kind, &self.inner.label, listener);

        let mut state = self.lock();
        if state.closed {
            drop(state);
            self.inner.registry.remove(kind, id);
        } else {
            state.handles.insert(kind, id);
        }
    }

    /// Bind the scope to an acknowledged order and replay anything that
    /// arrived for it in the meantime. Only the first bind takes effect.
    pub fn bind(&self, order_id: &str) {
        {
            let mut state = self.lock();
            if state.closed || state.order_id.is_some() {
                return;
            }
            state.order_id = Some(order_id.to_string());
            state.replaying = true;
        }
        debug!("OrderScope->{} bound to order {}", self.inner.label, order_id);

        loop {
            let pending = {
                let mut state = self.lock();
                if state.closed || state.buffered.is_empty() {
                    state.replaying = false;
                    state.buffered.clear();
                    break;
                }
                std::mem::take(&mut state.buffered)
            };
            for event in &pending {
                self.deliver_bound(event);
            }
        }
    }

    /// Drop the listener for one event kind
    pub fn release(&self, kind: EventKind) -> bool {
        let handle = {
            let mut state = self.lock();
            state.handlers.remove(&kind);
            state.handles.remove(&kind)
        };
        match handle {
            Some(id) => self.inner.registry.remove(kind, id),
            None => false,
        }
    }

    /// Remove every listener this scope still owns.
    /// Returns true for the call that actually closed it.
    pub fn close(&self) -> bool {
        let handles = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.handlers.clear();
            state.buffered.clear();
            std::mem::take(&mut state.handles)
        };
        for (kind, id) in handles {
            self.inner.registry.remove(kind, id);
        }
        debug!("OrderScope->{} closed", self.inner.label);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn order_id(&self) -> Option<String> {
        self.lock().order_id.clone()
    }

    /// Listeners this scope still holds on the session
    pub fn listener_count(&self) -> usize {
        self.lock().handles.len()
    }

    fn deliver(&self, event: &SessionEvent) {
        let handler = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let bound = state.order_id.clone();
            match bound {
                Some(_) if state.replaying => {
                    state.buffered.push(event.clone());
                    return;
                }
                None => {
                    state.buffered.push(event.clone());
                    return;
                }
                Some(id) if id != event.order_id() => return,
                Some(_) => state.handlers.get(&event.kind()).cloned(),
            }
        };
        if let Some(handler) = handler {
            handler(self, event);
        }
    }

    fn deliver_bound(&self, event: &SessionEvent) {
        let handler = {
            let state = self.lock();
            if state.closed || state.order_id.as_deref() != Some(event.order_id()) {
                return;
            }
            state.handlers.get(&event.kind()).cloned()
        };
        if let Some(handler) = handler {
            handler(self, event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for OrderScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OrderScope")
            .field("label", &self.inner.label)
            .field("order_id", &state.order_id)
            .field("closed", &state.closed)
            .field("listeners", &state.handles.len())
            .finish()
    }
}
