//! Message-Exchange layer (spec §4.2).
//!
//! Owns the send/receive sides of one or more transports, applies chunking
//! on send, reassembles chunks on receive, and either auto-dispatches
//! decoded messages to a type-tagged handler or queues them for polling.
//! Ported behaviorally from
//! `examples/original_source/src/network/data/exchange.py`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::framing::{encode_frame, FrameDecoder};
use super::message::{ProtocolMessage, SequenceCounter};
use crate::constants::{
    max_frame_size, DEFAULT_MAX_CHUNK, DEFAULT_RECEIVE_BUFFER, REASSEMBLY_DEADLINE_MULTIPLIER,
};
use crate::error::FabricError;
use crate::metrics::ConnectionMetrics;

/// Reserved transport id used in unicast mode.
pub const DEFAULT_TRANSPORT_ID: &str = "default";

/// `{max_chunk, auto_chunk, auto_dispatch, receive_buffer, multicast}` (§4.2).
#[derive(Debug, Clone)]
pub struct MessageExchangeConfig {
    pub max_chunk: usize,
    pub auto_chunk: bool,
    pub auto_dispatch: bool,
    pub receive_buffer: usize,
    pub multicast: bool,
}

impl Default for MessageExchangeConfig {
    fn default() -> Self {
        Self {
            max_chunk: DEFAULT_MAX_CHUNK,
            auto_chunk: true,
            auto_dispatch: true,
            receive_buffer: DEFAULT_RECEIVE_BUFFER,
            multicast: false,
        }
    }
}

/// A registered handler invoked for decoded messages whose `message_type`
/// matches the key it was registered under, when `auto_dispatch` is set.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ProtocolMessage);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(ProtocolMessage) + Send + Sync,
{
    async fn handle(&self, message: ProtocolMessage) {
        (self)(message);
    }
}

/// One send/receive endpoint: a TCP (optionally TLS) stream half-pair plus
/// its own persistent framing buffer.
pub struct Transport {
    writer: Pin<Box<dyn AsyncWrite + Send>>,
    reader: Pin<Box<dyn AsyncRead + Send>>,
    decoder: FrameDecoder,
}

impl Transport {
    pub fn new(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
        max_frame: usize,
    ) -> Self {
        Self {
            writer: Box::pin(writer),
            reader: Box::pin(reader),
            decoder: FrameDecoder::new(max_frame),
        }
    }
}

/// In-progress reassembly of one chunked logical message.
struct ReassemblySlot {
    slots: Vec<Option<Vec<u8>>>,
    deadline: Instant,
}

impl ReassemblySlot {
    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn concat(&self) -> Vec<u8> {
        self.slots.iter().flatten().flat_map(|v| v.iter().copied()).collect()
    }
}

/// The codec+framing+dispatch object layered over one or more streams.
pub struct MessageExchange {
    config: MessageExchangeConfig,
    transports: Arc<Mutex<BTreeMap<String, Transport>>>,
    handlers: Arc<Mutex<HashMap<String, Arc<dyn MessageHandler>>>>,
    receive_queue: Arc<Mutex<VecDeque<ProtocolMessage>>>,
    receive_notify: Arc<Notify>,
    reassembly: Arc<Mutex<HashMap<String, ReassemblySlot>>>,
    sequence: Arc<SequenceCounter>,
    source_identity: String,
    running: Arc<AtomicBool>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Mutex<ConnectionMetrics>>,
    heartbeat_interval: Duration,
}

impl MessageExchange {
    pub fn new(config: MessageExchangeConfig, source_identity: impl Into<String>, heartbeat_interval: Duration) -> Self {
        let source_identity = source_identity.into();
        Self {
            config,
            transports: Arc::new(Mutex::new(BTreeMap::new())),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            receive_queue: Arc::new(Mutex::new(VecDeque::new())),
            receive_notify: Arc::new(Notify::new()),
            reassembly: Arc::new(Mutex::new(HashMap::new())),
            sequence: Arc::new(SequenceCounter::new()),
            metrics: Arc::new(Mutex::new(ConnectionMetrics::new(source_identity.clone()))),
            source_identity,
            running: Arc::new(AtomicBool::new(false)),
            receive_task: Mutex::new(None),
            heartbeat_interval,
        }
    }

    /// Register or replace the transport under `transport_id`. In unicast
    /// mode callers should pass `DEFAULT_TRANSPORT_ID`.
    pub async fn set_transport(&self, transport_id: impl Into<String>, reader: impl AsyncRead + Send + 'static, writer: impl AsyncWrite + Send + 'static) {
        let max_frame = max_frame_size(self.config.max_chunk);
        let mut transports = self.transports.lock().await;
        transports.insert(transport_id.into(), Transport::new(reader, writer, max_frame));
    }

    pub async fn remove_transport(&self, transport_id: &str) {
        self.transports.lock().await.remove(transport_id);
    }

    pub async fn transport_count(&self) -> usize {
        self.transports.lock().await.len()
    }

    /// Register a handler invoked for decoded messages of `message_type`
    /// when `auto_dispatch` is enabled.
    pub async fn register_handler(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.lock().await.insert(message_type.into(), handler);
    }

    /// Sequence id this exchange will assign to the next outgoing message.
    pub fn next_sequence_id(&self) -> u64 {
        self.sequence.next()
    }

    fn now_secs() -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// `send(message)` per §4.2: auto-chunk if oversize, then fan out to
    /// every registered transport in deterministic (BTreeMap) order.
    pub async fn send(&self, mut message: ProtocolMessage) -> Result<()> {
        message.source = self.source_identity.clone();

        let outgoing = if self.config.auto_chunk {
            let serialized = serde_json::to_vec(&message)?;
            if serialized.len() > self.config.max_chunk {
                chunk_message(&message, self.config.max_chunk, &self.sequence)
            } else {
                vec![message]
            }
        } else {
            vec![message]
        };

        let mut transports = self.transports.lock().await;
        if transports.is_empty() {
            return Err(FabricError::MissingTransport {
                transport_id: DEFAULT_TRANSPORT_ID.to_string(),
            }
            .into());
        }

        for mut msg in outgoing {
            for (transport_id, transport) in transports.iter_mut() {
                if msg.target.is_empty() {
                    msg.target = transport_id.clone();
                }
                let framed = encode_frame(&msg)?;
                transport.writer.write_all(&framed).await?;
                let mut metrics = self.metrics.lock().await;
                metrics.record_sent(framed.len());
            }
        }

        Ok(())
    }

    /// Start the single cooperative receive task (§4.2, §5: "Receive is a
    /// single cooperative task per MessageExchange instance").
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.receive_loop().await });
        *self.receive_task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receive_task.lock().await.take() {
            let _ = tokio::time::timeout(crate::constants::SENDER_STOP_GRACE, handle).await;
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; self.config.receive_buffer];
        while self.running.load(Ordering::SeqCst) {
            let ids: Vec<String> = {
                let transports = self.transports.lock().await;
                transports.keys().cloned().collect()
            };

            if ids.is_empty() {
                tokio::task::yield_now().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }

            for id in ids {
                let read_result = {
                    let mut transports = self.transports.lock().await;
                    let Some(transport) = transports.get_mut(&id) else {
                        continue;
                    };
                    tokio::time::timeout(Duration::from_millis(5), transport.reader.read(&mut buf)).await
                };

                let Ok(Ok(n)) = read_result else {
                    tokio::task::yield_now().await;
                    continue;
                };
                if n == 0 {
                    continue;
                }

                let decoded = {
                    let mut transports = self.transports.lock().await;
                    let Some(transport) = transports.get_mut(&id) else {
                        continue;
                    };
                    transport.decoder.feed(&buf[..n])
                };

                {
                    let mut metrics = self.metrics.lock().await;
                    metrics.record_received(n);
                }

                for msg in decoded {
                    self.handle_decoded(msg).await;
                }
            }

            tokio::task::yield_now().await;
        }
    }

    async fn handle_decoded(&self, msg: ProtocolMessage) {
        if msg.is_heartbeat() {
            return;
        }

        {
            let mut metrics = self.metrics.lock().await;
            metrics.record_latency(Self::now_secs() - msg.timestamp);
        }

        let msg = if msg.is_chunk {
            match self.reassemble(msg).await {
                Some(full) => full,
                None => return,
            }
        } else {
            msg
        };

        if self.config.auto_dispatch {
            let handler = self.handlers.lock().await.get(&msg.message_type).cloned();
            match handler {
                Some(handler) => handler.handle(msg).await,
                None => log::debug!("no handler registered for message_type {:?}", msg.message_type),
            }
        } else {
            let mut queue = self.receive_queue.lock().await;
            if queue.len() >= self.config.receive_buffer {
                queue.pop_front();
            }
            queue.push_back(msg);
            self.receive_notify.notify_one();
        }
    }

    async fn reassemble(&self, chunk: ProtocolMessage) -> Option<ProtocolMessage> {
        let message_id = chunk.message_id.clone()?;
        let chunk_data = chunk.payload.get("chunk_data")?.as_str()?;
        let bytes = BASE64.decode(chunk_data).ok()?;

        let mut reassembly = self.reassembly.lock().await;
        self.evict_expired(&mut reassembly);

        let slot = reassembly.entry(message_id.clone()).or_insert_with(|| ReassemblySlot {
            slots: vec![None; chunk.total_chunks.max(1) as usize],
            deadline: Instant::now() + self.heartbeat_interval * REASSEMBLY_DEADLINE_MULTIPLIER,
        });

        if let Some(entry) = slot.slots.get_mut(chunk.chunk_index as usize) {
            *entry = Some(bytes);
        }

        if !slot.is_complete() {
            return None;
        }

        let slot = reassembly.remove(&message_id)?;
        let full_bytes = slot.concat();
        match serde_json::from_slice::<ProtocolMessage>(&full_bytes) {
            Ok(msg) => Some(msg),
            Err(e) => {
                log::debug!("reassembled bytes for {message_id} failed to decode: {e}");
                None
            }
        }
    }

    fn evict_expired(&self, reassembly: &mut HashMap<String, ReassemblySlot>) {
        let now = Instant::now();
        reassembly.retain(|id, slot| {
            let keep = slot.deadline > now;
            if !keep {
                log::warn!("evicting expired chunk reassembly for message_id {id}");
            }
            keep
        });
    }

    /// Pop one message from the manual receive queue (used when
    /// `auto_dispatch` is disabled), waiting up to `timeout` for one to
    /// arrive.
    pub async fn recv(&self, timeout: Duration) -> Option<ProtocolMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut queue = self.receive_queue.lock().await;
                if let Some(msg) = queue.pop_front() {
                    return Some(msg);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining, self.receive_notify.notified()).await;
        }
    }

    pub async fn metrics_snapshot(&self) -> ConnectionMetrics {
        self.metrics.lock().await.clone()
    }
}

/// Split `message`'s serialized bytes into `⌈S/max_chunk⌉` chunk carriers
/// sharing a fresh `message_id`, per §4.1 and the pinned chunk payload
/// shape from SPEC_FULL.md §12.3.
fn chunk_message(message: &ProtocolMessage, max_chunk: usize, sequence: &SequenceCounter) -> Vec<ProtocolMessage> {
    let serialized = serde_json::to_vec(message).expect("ProtocolMessage always serializes");
    let message_id = Uuid::new_v4().to_string();
    let total_chunks = serialized.len().div_ceil(max_chunk) as u32;

    serialized
        .chunks(max_chunk)
        .enumerate()
        .map(|(index, slice)| {
            let mut payload = HashMap::new();
            payload.insert("chunk_data".to_string(), serde_json::json!(BASE64.encode(slice)));
            ProtocolMessage {
                message_type: message.message_type.clone(),
                timestamp: message.timestamp,
                sequence_id: sequence.next(),
                message_id: Some(message_id.clone()),
                is_chunk: true,
                chunk_index: index as u32,
                total_chunks,
                source: message.source.clone(),
                target: message.target.clone(),
                payload,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::duplex;

    fn big_message() -> ProtocolMessage {
        let mut payload = HashMap::new();
        payload.insert("content".to_string(), serde_json::json!("x".repeat(5000)));
        ProtocolMessage::new("clipboard", "server", 1, 1.0).with_payload(payload)
    }

    #[test]
    fn chunk_and_reassemble_roundtrip() {
        let original = big_message();
        let sequence = SequenceCounter::new();
        let chunks = chunk_message(&original, 1024, &sequence);
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.total_chunks == 5));
        assert!(chunks.iter().all(|c| c.message_id == chunks[0].message_id));

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; 5];
        for c in &chunks {
            let data = c.payload.get("chunk_data").unwrap().as_str().unwrap();
            slots[c.chunk_index as usize] = Some(BASE64.decode(data).unwrap());
        }
        let full: Vec<u8> = slots.into_iter().flatten().flatten().collect();
        let reassembled: ProtocolMessage = serde_json::from_slice(&full).unwrap();
        assert_eq!(reassembled.payload, original.payload);
    }

    #[tokio::test]
    async fn send_without_transport_errors() {
        let exchange = MessageExchange::new(MessageExchangeConfig::default(), "server", Duration::from_secs(1));
        let msg = ProtocolMessage::new("mouse", "server", 0, 1.0);
        let err = exchange.send(msg).await.unwrap_err();
        assert!(err.to_string().contains(DEFAULT_TRANSPORT_ID));
    }

    #[tokio::test]
    async fn send_and_receive_over_duplex_transport() {
        let exchange = Arc::new(MessageExchange::new(
            MessageExchangeConfig {
                auto_dispatch: false,
                ..MessageExchangeConfig::default()
            },
            "server",
            Duration::from_secs(1),
        ));

        let (client_half, server_half) = duplex(8192);
        let (client_reader, client_writer) = tokio::io::split(client_half);
        let (server_reader, server_writer) = tokio::io::split(server_half);

        exchange.set_transport(DEFAULT_TRANSPORT_ID, server_reader, server_writer).await;
        exchange.start().await;

        let msg = ProtocolMessage::new("mouse", "client", 0, 1.0).with_target(DEFAULT_TRANSPORT_ID);
        let framed = encode_frame(&msg).unwrap();

        let mut writer = client_writer;
        writer.write_all(&framed).await.unwrap();
        drop(client_reader);

        let received = exchange.recv(Duration::from_secs(2)).await;
        assert!(received.is_some());
        assert_eq!(received.unwrap().message_type, "mouse");

        exchange.stop().await;
    }

    #[tokio::test]
    async fn heartbeat_messages_are_discarded_not_queued() {
        let exchange = Arc::new(MessageExchange::new(
            MessageExchangeConfig {
                auto_dispatch: false,
                ..MessageExchangeConfig::default()
            },
            "server",
            Duration::from_secs(1),
        ));

        let (client_half, server_half) = duplex(8192);
        let (_client_reader, client_writer) = tokio::io::split(client_half);
        let (server_reader, server_writer) = tokio::io::split(server_half);
        exchange.set_transport(DEFAULT_TRANSPORT_ID, server_reader, server_writer).await;
        exchange.start().await;

        let heartbeat = ProtocolMessage::new("heartbeat", "client", 0, 1.0);
        let mut writer = client_writer;
        writer.write_all(&encode_frame(&heartbeat).unwrap()).await.unwrap();

        let received = exchange.recv(Duration::from_millis(200)).await;
        assert!(received.is_none());

        exchange.stop().await;
    }
}
