//! Server-side multicast stream handler: broadcasts to every connected
//! client and accepts messages from any of them (spec §4.5.2), used for the
//! clipboard stream.
//!
//! Grounded on `examples/original_source/network/stream/handler/server.py`'s
//! `MulticastStreamHandler`: one transport per connected client, keyed by
//! screen position, inside a single `multicast=True` `MessageExchange`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connection::types::ClientsManager;
use crate::constants::HEARTBEAT_INTERVAL;
use crate::event_bus::{EventBus, EventSubscriber, LifecycleEvent};
use crate::protocol::{MessageExchange, MessageExchangeConfig, MessageHandler, ProtocolMessage, ScreenPosition, StreamKind};
use crate::stream::handler::SendQueue;

use super::screen_transport_id;

pub struct ServerMulticastHandler {
    stream_type: StreamKind,
    clients: Arc<Mutex<ClientsManager>>,
    exchange: Arc<MessageExchange>,
    queue: Arc<SendQueue>,
    clients_connected: AtomicI64,
    running: std::sync::atomic::AtomicBool,
    sender_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerMulticastHandler {
    pub async fn new(
        stream_type: StreamKind,
        clients: Arc<Mutex<ClientsManager>>,
        event_bus: Arc<EventBus>,
        buffer_size: usize,
    ) -> Arc<Self> {
        let exchange = Arc::new(MessageExchange::new(
            MessageExchangeConfig {
                auto_dispatch: true,
                multicast: true,
                ..MessageExchangeConfig::default()
            },
            "server",
            HEARTBEAT_INTERVAL,
        ));

        let this = Arc::new(Self {
            stream_type,
            clients,
            exchange,
            queue: Arc::new(SendQueue::new(buffer_size)),
            clients_connected: AtomicI64::new(0),
            running: std::sync::atomic::AtomicBool::new(true),
            sender_task: Mutex::new(None),
        });

        event_bus.subscribe("client_connected", Arc::clone(&this) as Arc<dyn EventSubscriber>).await;
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

    async fn core_sender(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if self.clients_connected.load(Ordering::SeqCst) <= 0 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                continue;
            }
            let Some(message) = self.queue.pop().await else { return };
            if let Err(e) = self.exchange.send(message).await {
                log::debug!("multicast {:?} send skipped: {e}", self.stream_type);
            }
        }
    }

    async fn attach_client(&self, screen: ScreenPosition) {
        let pair = {
            let mut clients = self.clients.lock().await;
            clients
                .client_at_mut(screen)
                .and_then(|c| c.connection.as_mut())
                .and_then(|conn| conn.take_stream(self.stream_type))
        };
        if let Some(pair) = pair {
            self.exchange
                .set_transport(screen_transport_id(screen), pair.reader, pair.writer)
                .await;
        }
    }

    async fn detach_client(&self, screen: ScreenPosition) {
        self.exchange.remove_transport(&screen_transport_id(screen)).await;
    }
}

#[async_trait]
impl EventSubscriber for ServerMulticastHandler {
    async fn on_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::ClientConnected { screen_position, .. } => {
                let count = self.clients_connected.fetch_add(1, Ordering::SeqCst) + 1;
                self.attach_client(screen_position).await;
                if count == 1 {
                    self.exchange.start().await;
                }
            }
            LifecycleEvent::ClientDisconnected { screen_position, .. } => {
                self.detach_client(screen_position).await;
                let count = self.clients_connected.fetch_sub(1, Ordering::SeqCst) - 1;
                if count <= 0 {
                    self.exchange.stop().await;
                    self.queue.drain().await;
                }
            }
            LifecycleEvent::ClientStreamReconnected { screen_position, streams, .. } => {
                if streams.contains(&self.stream_type) {
                    self.attach_client(screen_position).await;
                }
            }
            _ => {}
        }
    }
}
