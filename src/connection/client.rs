//! Client connection handler (spec §4.3 client side).
//!
//! Dials the server, performs the client side of the handshake, opens the
//! negotiated additional streams, and runs a reconnecting core loop with
//! heartbeat monitoring. Grounded on
//! `examples/original_source/src/network/connection/client.py`; the
//! `Arc<Self>`-driven background-task shape follows the teacher's
//! `broker/connection.rs` and `auth.rs` device-flow polling loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::FabricConfig;
use crate::connection::types::{ClientConnection, StreamPair};
use crate::constants::{
    CONNECTION_ATTEMPT_TIMEOUT, HANDSHAKE_MSG_TIMEOUT, HEARTBEAT_INTERVAL, MAX_HEARTBEAT_MISSES, RECONNECTION_DELAY,
    STREAM_CONN_DELAY_GUARD,
};
use crate::error::FabricError;
use crate::event_bus::{EventBus, LifecycleEvent};
use crate::metrics::MetricsCollector;
use crate::protocol::{FrameDecoder, ProtocolMessage, ScreenPosition, SequenceCounter, StreamKind};

/// Dials a server, completes the handshake, and maintains the connection.
pub struct ClientConnectionHandler {
    config: FabricConfig,
    uid: String,
    open_streams: Vec<StreamKind>,
    event_bus: Arc<EventBus>,
    metrics: Arc<MetricsCollector>,
    running: AtomicBool,
    connected: AtomicBool,
    connection: Mutex<Option<ClientConnection>>,
    screen_position: Mutex<ScreenPosition>,
    core_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientConnectionHandler {
    pub fn new(
        config: FabricConfig,
        uid: impl Into<String>,
        open_streams: Vec<StreamKind>,
        event_bus: Arc<EventBus>,
        metrics: Arc<MetricsCollector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            uid: uid.into(),
            open_streams,
            event_bus,
            metrics,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connection: Mutex::new(None),
            screen_position: Mutex::new(ScreenPosition::Unknown),
            core_task: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Hand ownership of one negotiated stream to whichever `ClientStreamHandler`
    /// drives it (spec §4.5 common contract).
    pub async fn take_stream(&self, kind: StreamKind) -> Option<StreamPair> {
        self.connection.lock().await.as_mut().and_then(|conn| conn.take_stream(kind))
    }

    /// Spawn the reconnecting core loop. No-op if already running.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let mut guard = self.core_task.lock().await;
        *guard = Some(tokio::spawn(async move { this.core_loop().await }));
    }

    pub async fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.core_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            task.abort();
        }
        if let Some(mut conn) = self.connection.lock().await.take() {
            conn.close();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn core_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            match self.connect_and_handshake().await {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    log::info!("handshake completed, client connected to {}:{}", self.config.host, self.config.port);
                    self.metrics.register_connection(self.uid.clone()).await;
                    self.event_bus
                        .dispatch(LifecycleEvent::client_connected(
                            self.uid.clone(),
                            *self.screen_position.lock().await,
                            self.open_streams.clone(),
                        ))
                        .await;

                    let this = Arc::clone(&self);
                    *self.heartbeat_task.lock().await = Some(tokio::spawn(async move { this.run_heartbeat_loop().await }));

                    // Wait until the heartbeat loop detects and records a disconnect.
                    while self.running.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst) {
                        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                    }
                }
                Err(e) => {
                    log::warn!("connection attempt failed: {e}");
                    tokio::time::sleep(RECONNECTION_DELAY).await;
                }
            }
        }
    }

    async fn connect_and_handshake(self: &Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = tokio::time::timeout(CONNECTION_ATTEMPT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .context("connection attempt timed out")?
            .with_context(|| format!("failed to connect to {addr}"))?;

        self.handshake(stream).await
    }

    /// §4.3 "Handshake (client side)", framed manually for the same reason
    /// as the server: the Command stream reuses this exact socket.
    async fn handshake(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = FrameDecoder::new(crate::constants::max_frame_size(crate::constants::DEFAULT_MAX_CHUNK));
        let seq = SequenceCounter::new();

        let request = read_one_message(&mut reader, &mut decoder, HANDSHAKE_MSG_TIMEOUT)
            .await
            .ok_or(FabricError::HandshakeTimeout { phase: "server greeting" })?;

        if request.message_type != "exchange" || request.source != "server" {
            anyhow::bail!(FabricError::ProtocolViolation {
                detail: "expected an exchange greeting from server".into()
            });
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());

        let mut response = ProtocolMessage::new("exchange", hostname, seq.next(), 0.0);
        response.target = "server".to_string();
        response.payload.insert("ack".to_string(), serde_json::json!(true));
        response
            .payload
            .insert("streams".to_string(), serde_json::json!(self.open_streams.iter().copied().map(u8::from).collect::<Vec<_>>()));
        response.payload.insert("ssl".to_string(), serde_json::json!(self.config.ssl));

        writer
            .write_all(&crate::protocol::encode_frame(&response)?)
            .await
            .context("failed to send handshake response")?;

        let ack = read_one_message(&mut reader, &mut decoder, HANDSHAKE_MSG_TIMEOUT)
            .await
            .ok_or(FabricError::HandshakeTimeout { phase: "server ack" })?;

        let accepted = ack.message_type == "exchange" && ack.payload.get("ack") == Some(&serde_json::json!(true));
        if !accepted {
            anyhow::bail!(FabricError::Unauthorized { peer: self.config.host.clone() });
        }

        let screen_position: ScreenPosition = ack
            .payload
            .get("screen_position")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(ScreenPosition::Unknown);
        *self.screen_position.lock().await = screen_position;

        let mut connection = ClientConnection::new();
        connection.attach(StreamKind::Command, StreamPair::new(reader, writer));

        let opened = self.open_additional_streams(&self.open_streams, &mut connection).await;
        if !opened {
            anyhow::bail!(FabricError::ProtocolViolation {
                detail: "failed to open one or more additional streams".into()
            });
        }

        *self.connection.lock().await = Some(connection);
        Ok(())
    }

    /// §4.3: dial a fresh TCP connection per stream kind. `config.ssl` is
    /// plaintext-negotiated with the server during handshake (both sides
    /// just agree the link *should* be encrypted) but no TLS upgrade is
    /// actually performed here; see `DESIGN.md`'s TLS entry for why this is
    /// a real limitation rather than an open question.
    async fn open_additional_streams(&self, kinds: &[StreamKind], connection: &mut ClientConnection) -> bool {
        for kind in kinds {
            let addr = format!("{}:{}", self.config.host, self.config.port);
            let attempt = tokio::time::timeout(CONNECTION_ATTEMPT_TIMEOUT, TcpStream::connect(&addr)).await;
            let Ok(Ok(stream)) = attempt else {
                log::error!("timed out opening {kind:?} stream to {addr}");
                return false;
            };

            let (r, w) = tokio::io::split(stream);
            connection.attach(*kind, StreamPair::new(r, w));
        }
        true
    }

    /// §4.3 "Heartbeat loop (client)": probes the Command stream and
    /// reopens any additional stream it finds closed.
    async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut misses = 0u32;

        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            let command_ok = {
                let mut guard = self.connection.lock().await;
                let Some(conn) = guard.as_mut() else { return };
                let Some(command) = conn.stream_mut(StreamKind::Command) else { return };
                use tokio::io::AsyncWriteExt;
                let heartbeat = ProtocolMessage::new("heartbeat", self.uid.clone(), 0, 0.0);
                let framed = crate::protocol::encode_frame(&heartbeat).unwrap_or_default();
                command.writer.write_all(&framed).await.is_ok()
            };

            if !command_ok {
                misses += 1;
                log::warn!("heartbeat miss {misses}/{MAX_HEARTBEAT_MISSES}");
                self.metrics.record_error(&self.uid).await;
                if misses >= MAX_HEARTBEAT_MISSES {
                    self.handle_disconnection().await;
                    return;
                }
                continue;
            }
            misses = 0;

            // Only additional streams are probed here; Command already
            // passed the write check above. Presence in `conn.kinds()` says
            // nothing about liveness (a stream sits there, unclaimed, from
            // handshake until its handler's `ClientActive` fires) so each
            // kind gets its own write probe; a failed write is the only
            // signal that the peer actually closed it.
            let closed: Vec<StreamKind> = {
                let mut guard = self.connection.lock().await;
                let Some(conn) = guard.as_mut() else { return };
                let candidates: Vec<StreamKind> = conn.kinds().into_iter().filter(|k| *k != StreamKind::Command).collect();
                let mut dead = Vec::new();
                for kind in candidates {
                    let Some(pair) = conn.stream_mut(kind) else { continue };
                    use tokio::io::AsyncWriteExt;
                    let probe = ProtocolMessage::new("heartbeat", self.uid.clone(), 0, 0.0);
                    let framed = crate::protocol::encode_frame(&probe).unwrap_or_default();
                    if pair.writer.write_all(&framed).await.is_err() {
                        dead.push(kind);
                    }
                }
                for kind in &dead {
                    conn.take_stream(*kind);
                }
                dead
            };

            if !closed.is_empty() {
                tokio::time::sleep(STREAM_CONN_DELAY_GUARD).await;
                let reopened = {
                    let mut guard = self.connection.lock().await;
                    let Some(conn) = guard.as_mut() else { return };
                    self.open_additional_streams(&closed, conn).await
                };
                if reopened {
                    self.metrics.record_reconnection(&self.uid).await;
                    self.event_bus
                        .dispatch(LifecycleEvent::ClientStreamReconnected {
                            client_uid: self.uid.clone(),
                            screen_position: *self.screen_position.lock().await,
                            streams: closed,
                        })
                        .await;
                }
            }
        }
    }

    async fn handle_disconnection(self: &Arc<Self>) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut conn) = self.connection.lock().await.take() {
            conn.close();
        }
        self.metrics.remove_connection(&self.uid).await;
        let screen_position = *self.screen_position.lock().await;
        self.event_bus
            .dispatch(LifecycleEvent::ClientDisconnected {
                client_uid: self.uid.clone(),
                screen_position,
            })
            .await;
        log::warn!("disconnected from server, will retry");
    }
}

async fn read_one_message(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    decoder: &mut FrameDecoder,
    timeout: std::time::Duration,
) -> Option<ProtocolMessage> {
    use tokio::io::AsyncReadExt;
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 4096];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let n = tokio::time::timeout(remaining, reader.read(&mut buf)).await.ok()??;
        if n == 0 {
            return None;
        }
        let mut decoded = decoder.feed(&buf[..n]);
        if !decoded.is_empty() {
            return Some(decoded.remove(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::server::ServerConnectionHandler;

    fn client_config(port: u16) -> FabricConfig {
        FabricConfig {
            host: "127.0.0.1".into(),
            port,
            ssl: false,
            ..FabricConfig::default()
        }
    }

    #[tokio::test]
    async fn handshake_succeeds_against_real_server() {
        let hostname = hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap();
        let mut server_config = client_config(0);
        server_config.authorized_clients.push(crate::config::AuthorizedClient {
            hostname: Some(hostname),
            ip_address: None,
            uid: "uid-1".into(),
            screen_position: ScreenPosition::Top,
        });

        let server_bus = Arc::new(EventBus::new());
        let server_metrics = Arc::new(crate::metrics::MetricsCollector::new());
        let server = Arc::new(ServerConnectionHandler::bind(server_config, server_bus, server_metrics).await.unwrap());
        let addr = server.local_addr().unwrap();

        let server_for_loop = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = server_for_loop.run_accept_loop().await;
        });

        let client_bus = Arc::new(EventBus::new());
        let client_metrics = Arc::new(crate::metrics::MetricsCollector::new());
        let client = ClientConnectionHandler::new(client_config(addr.port()), "uid-1", vec![], client_bus, client_metrics);
        client.start().await;

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(client.is_connected());
        client.stop().await;
    }
}
