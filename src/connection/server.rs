//! Server connection handler (spec §4.3).
//!
//! Accepts inbound TCP connections, performs the server side of the
//! handshake, correlates secondary connections with pending stream
//! requests, and runs the heartbeat/reopen loop. Grounded on
//! `examples/original_source/src/network/connection/server.py`; the
//! typed-method-over-background-task shape follows the teacher's
//! `broker/connection.rs`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};

use crate::config::FabricConfig;
use crate::connection::types::{ClientConnection, ClientRecord, ClientsManager, StreamPair};
use crate::constants::{CONNECTION_ATTEMPT_TIMEOUT, HANDSHAKE_MSG_TIMEOUT, HEARTBEAT_INTERVAL, MAX_HEARTBEAT_MISSES};
use crate::error::FabricError;
use crate::event_bus::{EventBus, LifecycleEvent};
use crate::metrics::MetricsCollector;
use crate::protocol::{MessageExchange, MessageExchangeConfig, ProtocolMessage, ScreenPosition, StreamKind};

/// A server-side future awaiting the next inbound TCP connection from a
/// specific peer for a specific `StreamKind` (§4.3 "pending-streams registry").
/// Keyed by the client's IP rather than its exact `SocketAddr`: every
/// additional-stream dial is a fresh outbound `TcpStream::connect` from the
/// client, so its source port never matches the port the primary handshake
/// connection arrived on.
type PendingEntry = (StreamKind, oneshot::Sender<TcpStream>);

/// Accepts connections, runs handshakes, and owns the heartbeat loop.
pub struct ServerConnectionHandler {
    listener: TcpListener,
    clients: Arc<Mutex<ClientsManager>>,
    pending_streams: Arc<Mutex<HashMap<IpAddr, Vec<PendingEntry>>>>,
    event_bus: Arc<EventBus>,
    config: FabricConfig,
    heartbeat_misses: Arc<Mutex<HashMap<String, u32>>>,
    metrics: Arc<MetricsCollector>,
}

impl ServerConnectionHandler {
    pub async fn bind(config: FabricConfig, event_bus: Arc<EventBus>, metrics: Arc<MetricsCollector>) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind server listener on {addr}"))?;
        log::info!("server listening on {addr}");

        Ok(Self {
            listener,
            clients: Arc::new(Mutex::new(ClientsManager::new())),
            pending_streams: Arc::new(Mutex::new(HashMap::new())),
            event_bus,
            config,
            heartbeat_misses: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        })
    }

    pub fn clients(&self) -> Arc<Mutex<ClientsManager>> {
        Arc::clone(&self.clients)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop: never returns except on listener error.
    pub async fn run_accept_loop(self: &Arc<Self>) -> Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.dispatch(stream, addr).await {
                    log::warn!("connection from {addr} failed: {e}");
                }
            });
        }
    }

    /// §4.3 "Dispatch": correlate with a pending stream request, reject a
    /// concurrent reconnect, or begin the handshake.
    async fn dispatch(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let pending_kind = {
            let mut pending = self.pending_streams.lock().await;
            if let Some(entries) = pending.get_mut(&addr.ip()) {
                entries.pop().map(|(kind, tx)| (kind, tx))
            } else {
                None
            }
        };

        if let Some((kind, tx)) = pending_kind {
            log::debug!("resolving pending {kind:?} stream for {addr}");
            let _ = tx.send(stream);
            return Ok(());
        }

        {
            let clients = self.clients.lock().await;
            if let Some(existing) = clients.find_by_identity(None, Some(&addr.ip().to_string()), "") {
                if existing.is_connected {
                    log::warn!("rejecting concurrent reconnect from {addr}");
                    return Ok(());
                }
            }
        }

        self.handshake(stream, addr).await
    }

    /// §4.3 "Handshake (server side)".
    ///
    /// The handshake is framed manually (not through a `MessageExchange`)
    /// so the same TCP stream halves can be reattached afterward as the
    /// `Command` stream of the new `ClientConnection`, per §4.3 step 5
    /// ("Attach the current TCP connection as the Command stream").
    async fn handshake(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = crate::protocol::FrameDecoder::new(crate::constants::max_frame_size(crate::constants::DEFAULT_MAX_CHUNK));
        let seq = crate::protocol::SequenceCounter::new();

        writer
            .write_all(&crate::protocol::encode_frame(&ack_message(false, "server", seq.next()))?)
            .await
            .context("failed to send initial exchange ack=false")?;

        let reply = read_one_message(&mut reader, &mut decoder, HANDSHAKE_MSG_TIMEOUT)
            .await
            .ok_or(FabricError::HandshakeTimeout { phase: "client ack" })?;

        if reply.message_type != "exchange" || reply.payload.get("ack") != Some(&serde_json::json!(true)) {
            anyhow::bail!(FabricError::ProtocolViolation {
                detail: "expected exchange ack=true from client".into()
            });
        }

        let peer_hostname = reply.source.clone();
        let requested_streams = parse_requested_streams(&reply);
        let ssl = reply.payload.get("ssl").and_then(|v| v.as_bool()).unwrap_or(false);
        let screen_resolution = parse_resolution(&reply);

        let authorized_uid = {
            let clients = self.clients.lock().await;
            let found = self
                .config
                .find_authorized(Some(&peer_hostname), Some(&addr.ip().to_string()), "");
            found.map(|c| c.uid.clone()).or_else(|| {
                clients
                    .find_by_identity(Some(&peer_hostname), Some(&addr.ip().to_string()), "")
                    .map(|c| c.uid.clone())
            })
        };

        let Some(uid) = authorized_uid else {
            let _ = writer
                .write_all(&crate::protocol::encode_frame(&ack_message(false, "server", seq.next()))?)
                .await;
            anyhow::bail!(FabricError::Unauthorized { peer: peer_hostname });
        };

        let screen_position = {
            let clients = self.clients.lock().await;
            clients.get(&uid).map(|c| c.screen_position).unwrap_or(ScreenPosition::Unknown)
        };

        let mut ack = ack_message(true, "server", seq.next());
        ack.payload.insert("screen_position".to_string(), serde_json::json!(screen_position));
        writer
            .write_all(&crate::protocol::encode_frame(&ack)?)
            .await
            .context("failed to send exchange ack=true")?;

        let mut connection = ClientConnection::new();
        connection.attach(StreamKind::Command, StreamPair::new(reader, writer));

        for kind in &requested_streams {
            let (tx, rx) = oneshot::channel();
            {
                let mut pending = self.pending_streams.lock().await;
                pending.entry(addr.ip()).or_default().push((*kind, tx));
            }

            let fresh = tokio::time::timeout(CONNECTION_ATTEMPT_TIMEOUT, rx)
                .await
                .ok()
                .and_then(Result::ok);

            let Some(fresh_stream) = fresh else {
                log::warn!("timed out waiting for {kind:?} stream from {addr}");
                continue;
            };

            // `ssl` is negotiated here but not upgraded to; see `DESIGN.md`.
            let (r, w) = tokio::io::split(fresh_stream);
            connection.attach(*kind, StreamPair::new(r, w));
        }

        {
            let mut clients = self.clients.lock().await;
            let record = clients.get_mut(&uid).ok_or_else(|| anyhow::anyhow!("client record vanished for {uid}"))?;
            record.hostname = Some(peer_hostname.clone());
            record.ip_address = Some(addr.ip().to_string());
            record.ssl = ssl;
            record.screen_resolution = screen_resolution;
            record.mark_connected(connection);
            self.heartbeat_misses.lock().await.insert(uid.clone(), 0);
        }
        self.metrics.register_connection(uid.clone()).await;

        self.event_bus
            .dispatch(LifecycleEvent::client_connected(uid, screen_position, requested_streams))
            .await;

        Ok(())
    }

    /// §4.3 "Heartbeat loop (server)". Runs until the process stops.
    pub async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            let uids: Vec<String> = {
                let clients = self.clients.lock().await;
                clients.connected_clients().map(|c| c.uid.clone()).collect()
            };

            for uid in uids {
                self.heartbeat_check_one(&uid).await;
            }
        }
    }

    async fn heartbeat_check_one(self: &Arc<Self>, uid: &str) {
        let (command_ok, peer_ip, additional_kinds) = {
            let mut clients = self.clients.lock().await;
            let Some(record) = clients.get_mut(uid) else { return };
            let Some(conn) = record.connection.as_mut() else { return };
            let Some(command) = conn.stream_mut(StreamKind::Command) else { return };
            use tokio::io::AsyncWriteExt;
            let heartbeat = ProtocolMessage::new("heartbeat", "server", 0, 0.0);
            let framed = crate::protocol::encode_frame(&heartbeat).unwrap_or_default();
            let command_ok = command.writer.write_all(&framed).await.is_ok();
            let additional_kinds: Vec<StreamKind> = conn.kinds().into_iter().filter(|k| *k != StreamKind::Command).collect();
            (command_ok, record.ip_address.clone(), additional_kinds)
        };

        {
            let mut misses = self.heartbeat_misses.lock().await;
            let count = misses.entry(uid.to_string()).or_insert(0);

            if !command_ok {
                *count += 1;
                log::warn!("heartbeat miss #{count} for client {uid}");
                self.metrics.record_error(uid).await;

                if *count >= MAX_HEARTBEAT_MISSES {
                    drop(misses);
                    self.disconnect(uid).await;
                    return;
                }
                return;
            }
            *count = 0;
        }

        self.check_additional_streams(uid, peer_ip, additional_kinds).await;
    }

    /// §4.3/§4.5.1: probe every additional stream still attached to `uid`'s
    /// connection, and for any that writes closed, register a pending-stream
    /// promise and wait (in a detached task, so one dead client's reopen
    /// wait never blocks the next tick's heartbeat pass) for the client's
    /// own heartbeat loop to redial it.
    async fn check_additional_streams(self: &Arc<Self>, uid: &str, peer_ip: Option<String>, kinds: Vec<StreamKind>) {
        if kinds.is_empty() {
            return;
        }

        let mut closed_kinds = Vec::new();
        {
            let mut clients = self.clients.lock().await;
            let Some(record) = clients.get_mut(uid) else { return };
            let Some(conn) = record.connection.as_mut() else { return };
            for kind in kinds {
                let Some(pair) = conn.stream_mut(kind) else { continue };
                use tokio::io::AsyncWriteExt;
                let probe = ProtocolMessage::new("heartbeat", "server", 0, 0.0);
                let framed = crate::protocol::encode_frame(&probe).unwrap_or_default();
                if pair.writer.write_all(&framed).await.is_err() {
                    closed_kinds.push(kind);
                }
            }
            for kind in &closed_kinds {
                conn.take_stream(*kind);
            }
        }

        if closed_kinds.is_empty() {
            return;
        }

        let Some(ip) = peer_ip.and_then(|s| s.parse::<IpAddr>().ok()) else {
            log::warn!("cannot reopen stream(s) for {uid}: no known IP address on record");
            return;
        };

        for kind in closed_kinds {
            log::warn!("{kind:?} stream for client {uid} appears closed; awaiting reopen from {ip}");
            let (tx, rx) = oneshot::channel();
            self.pending_streams.lock().await.entry(ip).or_default().push((kind, tx));

            let this = Arc::clone(self);
            let uid = uid.to_string();
            tokio::spawn(async move { this.await_stream_reopen(uid, kind, rx).await });
        }
    }

    async fn await_stream_reopen(self: Arc<Self>, uid: String, kind: StreamKind, rx: oneshot::Receiver<TcpStream>) {
        let Ok(Ok(stream)) = tokio::time::timeout(CONNECTION_ATTEMPT_TIMEOUT, rx).await else {
            log::warn!("timed out waiting for {kind:?} reopen from client {uid}");
            return;
        };

        let (r, w) = tokio::io::split(stream);
        let screen_position = {
            let mut clients = self.clients.lock().await;
            let Some(record) = clients.get_mut(&uid) else { return };
            let Some(conn) = record.connection.as_mut() else { return };
            conn.attach(kind, StreamPair::new(r, w));
            record.screen_position
        };

        self.metrics.record_reconnection(&uid).await;
        self.event_bus
            .dispatch(LifecycleEvent::ClientStreamReconnected {
                client_uid: uid,
                screen_position,
                streams: vec![kind],
            })
            .await;
    }

    async fn disconnect(self: &Arc<Self>, uid: &str) {
        let screen_position = {
            let mut clients = self.clients.lock().await;
            let Some(record) = clients.get_mut(uid) else { return };
            record.mark_disconnected();
            record.screen_position
        };
        self.heartbeat_misses.lock().await.remove(uid);
        self.metrics.remove_connection(uid).await;
        self.event_bus
            .dispatch(LifecycleEvent::ClientDisconnected {
                client_uid: uid.to_string(),
                screen_position,
            })
            .await;
    }
}

/// Read bytes from `reader` into `decoder` until it yields one message or
/// `timeout` elapses.
async fn read_one_message(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    decoder: &mut crate::protocol::FrameDecoder,
    timeout: Duration,
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

fn ack_message(ack: bool, source: &str, sequence_id: u64) -> ProtocolMessage {
    let mut msg = ProtocolMessage::new("exchange", source, sequence_id, 0.0);
    msg.payload.insert("ack".to_string(), serde_json::json!(ack));
    msg
}

fn parse_requested_streams(msg: &ProtocolMessage) -> Vec<StreamKind> {
    msg.payload
        .get("streams")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64())
                .filter_map(|n| StreamKind::try_from(n as u8).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_resolution(msg: &ProtocolMessage) -> Option<(u32, u32)> {
    let res = msg.payload.get("screen_resolution")?.as_array()?;
    let w = res.first()?.as_u64()? as u32;
    let h = res.get(1)?.as_u64()? as u32;
    Some((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthorizedClient;
    use tokio::net::TcpStream;

    fn test_config(authorized: Vec<AuthorizedClient>) -> FabricConfig {
        FabricConfig {
            host: "127.0.0.1".into(),
            port: 0,
            authorized_clients: authorized,
            ..FabricConfig::default()
        }
    }

    #[tokio::test]
    async fn unknown_client_is_rejected() {
        let event_bus = Arc::new(EventBus::new());
        let metrics = Arc::new(crate::metrics::MetricsCollector::new());
        let handler = Arc::new(ServerConnectionHandler::bind(test_config(vec![]), event_bus, metrics).await.unwrap());
        let addr = handler.listener.local_addr().unwrap();

        let server = Arc::clone(&handler);
        tokio::spawn(async move {
            let _ = server.run_accept_loop().await;
        });

        let client_stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = tokio::io::split(client_stream);
        let exchange = Arc::new(MessageExchange::new(
            MessageExchangeConfig {
                auto_dispatch: false,
                ..MessageExchangeConfig::default()
            },
            "alpha",
            HEARTBEAT_INTERVAL,
        ));
        exchange.set_transport(crate::protocol::exchange::DEFAULT_TRANSPORT_ID, reader, writer).await;
        exchange.start().await;

        let first = exchange.recv(Duration::from_secs(2)).await.unwrap();
        assert_eq!(first.payload.get("ack"), Some(&serde_json::json!(false)));

        let seq = exchange.next_sequence_id();
        let mut ack = ack_message(true, "alpha", seq);
        ack.payload.insert("streams".to_string(), serde_json::json!([]));
        exchange.send(ack).await.unwrap();

        let second = exchange.recv(Duration::from_secs(2)).await.unwrap();
        assert_eq!(second.payload.get("ack"), Some(&serde_json::json!(false)));
        exchange.stop().await;
    }

    #[test]
    fn parse_requested_streams_filters_unknown_tags() {
        let mut msg = ProtocolMessage::new("exchange", "alpha", 0, 0.0);
        msg.payload.insert("streams".to_string(), serde_json::json!([1, 4, 99]));
        let streams = parse_requested_streams(&msg);
        assert_eq!(streams, vec![StreamKind::Mouse, StreamKind::Keyboard]);
    }

    #[test]
    fn parse_resolution_reads_width_height_pair() {
        let mut msg = ProtocolMessage::new("exchange", "alpha", 0, 0.0);
        msg.payload.insert("screen_resolution".to_string(), serde_json::json!([1920, 1080]));
        assert_eq!(parse_resolution(&msg), Some((1920, 1080)));
    }
}
