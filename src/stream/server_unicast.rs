//! Server-side unicast stream handler: follows the active screen, targeting
//! exactly one connected client at a time (spec §4.5.1).
//!
//! Grounded on `examples/original_source/network/stream/handler/server.py`'s
//! `UnidirectionalStreamHandler`/`BidirectionalStreamHandler`: both track
//! `_active_client` off `ACTIVE_SCREEN_CHANGED`/`CLIENT_DISCONNECTED`/
//! `CLIENT_STREAM_RECONNECTED` and reconfigure one `MessageExchange`
//! transport accordingly. The two Python classes differ only in whether the
//! handler also receives, so here that's a single `bidirectional` flag
//! instead of a second struct.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connection::types::ClientsManager;
use crate::constants::HEARTBEAT_INTERVAL;
use crate::event_bus::{EventBus, EventSubscriber, LifecycleEvent};
use crate::protocol::{MessageExchange, MessageExchangeConfig, MessageHandler, ProtocolMessage, ScreenPosition, StreamKind};
use crate::stream::handler::SendQueue;

use super::exchange_default_transport;

/// Idle/Bound(screen) state machine described in §4.5.1.
pub struct ServerUnicastHandler {
    stream_type: StreamKind,
    bidirectional: bool,
    clients: Arc<Mutex<ClientsManager>>,
    exchange: Arc<MessageExchange>,
    queue: Arc<SendQueue>,
    active_screen: Mutex<Option<ScreenPosition>>,
    active: AtomicBool,
    sender_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerUnicastHandler {
    pub async fn new(
        stream_type: StreamKind,
        clients: Arc<Mutex<ClientsManager>>,
        event_bus: Arc<EventBus>,
        bidirectional: bool,
        buffer_size: usize,
    ) -> Arc<Self> {
        let exchange = Arc::new(MessageExchange::new(
            MessageExchangeConfig {
                auto_dispatch: true,
                ..MessageExchangeConfig::default()
            },
            "server",
            HEARTBEAT_INTERVAL,
        ));

        let this = Arc::new(Self {
            stream_type,
            bidirectional,
            clients,
            exchange,
            queue: Arc::new(SendQueue::new(buffer_size)),
            active_screen: Mutex::new(None),
            active: AtomicBool::new(true),
            sender_task: Mutex::new(None),
        });

        event_bus.subscribe("active_screen_changed", Arc::clone(&this) as Arc<dyn EventSubscriber>).await;
        event_bus.subscribe("client_disconnected", Arc::clone(&this) as Arc<dyn EventSubscriber>).await;
        event_bus
            .subscribe("client_stream_reconnected", Arc::clone(&this) as Arc<dyn EventSubscriber>)
            .await;

        let sender = Arc::clone(&this);
        *this.sender_task.lock().await = Some(tokio::spawn(async move { sender.core_sender().await }));
        this
    }

    pub async fn send(&self, message: ProtocolMessage) -> anyhow::Result<()> {
        self.queue.push(message).await
    }

    /// Routes inbound messages of a given type to `handler` (bidirectional
    /// handlers only — receive is meaningless on a send-only stream).
    pub async fn register_receive_handler(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.exchange.register_handler(message_type, handler).await;
    }

    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.sender_task.lock().await.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), task).await;
        }
        self.exchange.stop().await;
    }

    async fn core_sender(self: Arc<Self>) {
        while self.active.load(Ordering::SeqCst) {
            if self.active_screen.lock().await.is_none() {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                continue;
            }
            let Some(message) = self.queue.pop().await else { return };
            if let Err(e) = self.exchange.send(message).await {
                log::debug!("unicast {:?} send skipped: {e}", self.stream_type);
            }
        }
    }

    async fn reconfigure(&self, screen: Option<ScreenPosition>) {
        *self.active_screen.lock().await = screen;
        self.queue.drain().await;

        let pair = match screen {
            Some(position) => {
                let mut clients = self.clients.lock().await;
                clients
                    .client_at_mut(position)
                    .and_then(|c| c.connection.as_mut())
                    .and_then(|conn| conn.take_stream(self.stream_type))
            }
            None => None,
        };

        match pair {
            Some(pair) => {
                exchange_default_transport(&self.exchange, pair).await;
                if self.bidirectional {
                    self.exchange.start().await;
                }
            }
            None => self.exchange.remove_transport(crate::protocol::exchange::DEFAULT_TRANSPORT_ID).await,
        }
    }
}

#[async_trait]
impl EventSubscriber for ServerUnicastHandler {
    async fn on_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::ActiveScreenChanged { screen_position } => self.reconfigure(Some(screen_position)).await,
            LifecycleEvent::ClientDisconnected { screen_position, .. } => {
                if *self.active_screen.lock().await == Some(screen_position) {
                    self.reconfigure(None).await;
                }
            }
            LifecycleEvent::ClientStreamReconnected { screen_position, streams, .. } => {
                if streams.contains(&self.stream_type) && *self.active_screen.lock().await == Some(screen_position) {
                    self.reconfigure(Some(screen_position)).await;
                }
            }
            _ => {}
        }
    }
}
