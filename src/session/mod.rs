//! Trading session
//! Shared order submission plus the confirmation event source that positions
//! subscribe to through per-order scopes.

pub mod events;
pub mod registry;
pub mod scope;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, LiveOrder, OrderGateway, OrderRequest};

pub use events::{EventKind, FinalizeReason, SessionEvent};
pub use registry::{Listener, ListenerId, ListenerRegistry};
pub use scope::{OrderScope, ScopedHandler};

/// Session for one product: submits orders through the gateway and fans
/// exchange events out to the registered listeners
#[derive(Clone)]
pub struct TradingSession {
    product_id: String,
    gateway: Arc<dyn OrderGateway>,
    listeners: Arc<ListenerRegistry>,
}

impl TradingSession {
    pub fn new(product_id: &str, gateway: Arc<dyn OrderGateway>) -> Self {
        Self {
            product_id: product_id.to_string(),
            gateway,
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub async fn place_order(&self, order: &OrderRequest) -> Result<Option<LiveOrder>, ApiError> {
        debug!(
            "Trader->placing {} {:?} order for {}",
            order.side.as_str(),
            order.order_type,
            order.product_id
        );
        let ack = self.gateway.place_order(order).await?;
        match &ack {
            Some(live) => info!("Trader->order {} acknowledged ({:?})", live.id, live.status),
            None => warn!("Trader->order request for {} was not acknowledged", order.product_id),
        }
        Ok(ack)
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<String, ApiError> {
        debug!("Trader->canceling order {}", order_id);
        let id = self.gateway.cancel_order(order_id).await?;
        info!("Trader->order {} canceled", id);
        Ok(id)
    }

    /// Deliver one exchange event to the listeners of its kind
    pub fn dispatch(&self, event: &SessionEvent) -> usize {
        debug!("Trader->{} for order {}", event.kind(), event.order_id());
        self.listeners.dispatch(event)
    }

    /// Dispatch events from an exchange stream in arrival order until the
    /// stream closes
    pub fn pump(&self, mut events: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                session.dispatch(&event);
            }
            debug!("Trader->event stream for {} closed", session.product_id);
        })
    }

    pub fn open_scope(&self, label: &str) -> OrderScope {
        OrderScope::new(label, self.listeners.clone())
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.count(kind)
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }
}

impl std::fmt::Debug for TradingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingSession")
            .field("product_id", &self.product_id)
            .field("listeners", &self.listeners.total())
            .finish()
    }
}
