//! Client-side stream handler: Inactive/Active state machine gated on
//! whether this host currently holds the input focus (spec §4.5.3).
//!
//! Grounded on
//! `examples/original_source/network/stream/handler/client.py`'s
//! `UnidirectionalStreamHandler`/`BidirectionalStreamHandler`: both
//! configure their `MessageExchange` transport from the single client-side
//! `ClientConnection` on `CLIENT_ACTIVE`, and tear it down on
//! `CLIENT_INACTIVE` (only if `active_only`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connection::ClientConnectionHandler;
use crate::constants::HEARTBEAT_INTERVAL;
use crate::event_bus::{EventBus, EventSubscriber, LifecycleEvent};
use crate::protocol::{MessageExchange, MessageExchangeConfig, MessageHandler, ProtocolMessage, StreamKind};
use crate::stream::handler::SendQueue;

use super::exchange_default_transport;

pub struct ClientStreamHandler {
    stream_type: StreamKind,
    /// Only send while this host is the active (focused) screen; the
    /// Command stream itself is never gated this way.
    active_only: bool,
    connection: Arc<ClientConnectionHandler>,
    exchange: Arc<MessageExchange>,
    queue: Arc<SendQueue>,
    is_active: AtomicBool,
    running: AtomicBool,
    sender_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientStreamHandler {
    pub async fn new(
        stream_type: StreamKind,
        connection: Arc<ClientConnectionHandler>,
        event_bus: Arc<EventBus>,
        active_only: bool,
        buffer_size: usize,
    ) -> Arc<Self> {
        let exchange = Arc::new(MessageExchange::new(
            MessageExchangeConfig {
                auto_dispatch: true,
                ..MessageExchangeConfig::default()
            },
            "client",
            HEARTBEAT_INTERVAL,
        ));

        let this = Arc::new(Self {
            stream_type,
            active_only,
            connection,
            exchange,
            queue: Arc::new(SendQueue::new(buffer_size)),
            is_active: AtomicBool::new(false),
            running: AtomicBool::new(true),
            sender_task: Mutex::new(None),
        });

        event_bus.subscribe("client_active", Arc::clone(&this) as Arc<dyn EventSubscriber>).await;
        event_bus.subscribe("client_inactive", Arc::clone(&this) as Arc<dyn EventSubscriber>).await;
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

    pub async fn register_receive_handler(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.exchange.register_handler(message_type, handler).await;
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.sender_task.lock().await.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), task).await;
        }
        self.exchange.stop().await;
    }

    fn send_clause(&self) -> bool {
        !self.active_only || self.is_active.load(Ordering::SeqCst)
    }

    async fn core_sender(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if !self.send_clause() {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                continue;
            }
            let Some(message) = self.queue.pop().await else { return };
            if let Err(e) = self.exchange.send(message).await {
                log::debug!("client {:?} send skipped: {e}", self.stream_type);
                if is_disconnect_error(&e) {
                    self.recover_from_disconnect().await;
                }
            }
        }
    }

    /// §4.5.3 disconnection recovery: stop the exchange's receive task, drop
    /// whatever was queued, and (for a gated stream) force-close the local
    /// half so the next `ClientActive`/reconnect starts from a clean slate.
    async fn recover_from_disconnect(&self) {
        self.exchange.stop().await;
        self.queue.drain().await;
        if self.active_only {
            self.exchange
                .remove_transport(crate::protocol::exchange::DEFAULT_TRANSPORT_ID)
                .await;
            self.is_active.store(false, Ordering::SeqCst);
        }
    }

    async fn activate(&self) {
        if self.is_active.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.drain().await;
        if let Some(pair) = self.connection.take_stream(self.stream_type).await {
            exchange_default_transport(&self.exchange, pair).await;
            self.exchange.start().await;
        } else {
            self.is_active.store(false, Ordering::SeqCst);
        }
    }

    async fn deactivate(&self) {
        if !self.active_only {
            return;
        }
        self.is_active.store(false, Ordering::SeqCst);
        self.exchange.stop().await;
        self.queue.drain().await;
    }

    async fn reconfigure_after_reconnect(&self) {
        if let Some(pair) = self.connection.take_stream(self.stream_type).await {
            exchange_default_transport(&self.exchange, pair).await;
            self.exchange.start().await;
        } else {
            self.is_active.store(false, Ordering::SeqCst);
        }
    }
}

/// Whether `err` (bubbled up from a `MessageExchange::send` write) indicates
/// the peer closed its end, as opposed to a transient send-buffer hiccup.
fn is_disconnect_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|io_err| matches!(io_err.kind(), std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset))
}

#[async_trait]
impl EventSubscriber for ClientStreamHandler {
    async fn on_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::ClientActive { .. } => self.activate().await,
            LifecycleEvent::ClientInactive => self.deactivate().await,
            LifecycleEvent::ClientStreamReconnected { streams, .. } => {
                if streams.contains(&self.stream_type) {
                    self.reconfigure_after_reconnect().await;
                }
            }
            _ => {}
        }
    }
}
