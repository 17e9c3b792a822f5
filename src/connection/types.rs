//! Client identity and connection bookkeeping (spec §3).
//!
//! Grounded on the teacher's `client/registry.rs` (identity-keyed registry
//! over a `HashMap`) and
//! `examples/original_source/src/data/client.py` for the identity
//! precedence rule used to match clients across reconnects.

use std::collections::HashMap;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::{ProtocolMessage, ScreenPosition, StreamKind};

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// `(reader_half, writer_half)` over one TCP (optionally TLS) socket.
pub struct StreamPair {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl StreamPair {
    pub fn new(reader: impl AsyncRead + Send + 'static, writer: impl AsyncWrite + Send + 'static) -> Self {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        }
    }
}

/// A client-addressed bundle of `StreamKind -> StreamPair`. Exactly one per
/// connected client; single-shot (no reuse after close).
#[derive(Default)]
pub struct ClientConnection {
    streams: HashMap<StreamKind, StreamPair>,
    closed: bool,
}

impl ClientConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, kind: StreamKind, pair: StreamPair) {
        self.streams.insert(kind, pair);
    }

    pub fn stream_mut(&mut self, kind: StreamKind) -> Option<&mut StreamPair> {
        self.streams.get_mut(&kind)
    }

    pub fn has_stream(&self, kind: StreamKind) -> bool {
        self.streams.contains_key(&kind)
    }

    /// Remove and return a stream pair, handing ownership to whichever
    /// stream handler drives that kind (spec §4.5 "transport configuration").
    pub fn take_stream(&mut self, kind: StreamKind) -> Option<StreamPair> {
        self.streams.remove(&kind)
    }

    pub fn kinds(&self) -> Vec<StreamKind> {
        self.streams.keys().copied().collect()
    }

    /// Close every pair; the object must not be reused afterward.
    pub fn close(&mut self) {
        self.streams.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Identity and negotiated state for one configured or discovered client.
pub struct ClientRecord {
    pub uid: String,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub screen_position: ScreenPosition,
    pub screen_resolution: Option<(u32, u32)>,
    pub ssl: bool,
    pub first_connection_date: Option<DateTime<Utc>>,
    pub last_connection_date: Option<DateTime<Utc>>,
    pub is_connected: bool,
    pub connection: Option<ClientConnection>,
}

impl ClientRecord {
    pub fn new(uid: impl Into<String>, screen_position: ScreenPosition) -> Self {
        Self {
            uid: uid.into(),
            hostname: None,
            ip_address: None,
            screen_position,
            screen_resolution: None,
            ssl: false,
            first_connection_date: None,
            last_connection_date: None,
            is_connected: false,
            connection: None,
        }
    }

    /// Mark the client connected, attaching its `ClientConnection` and
    /// stamping `first_connection_date` on the very first success.
    pub fn mark_connected(&mut self, connection: ClientConnection) {
        let now = Utc::now();
        if self.first_connection_date.is_none() {
            self.first_connection_date = Some(now);
        }
        self.last_connection_date = Some(now);
        self.is_connected = true;
        self.connection = Some(connection);
    }

    /// Tear down the connection on disconnect. The record itself persists
    /// (spec §3: destroyed only on explicit removal).
    pub fn mark_disconnected(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        self.is_connected = false;
    }

    /// Invariant check: `conn_socket.is_some() == is_connected`.
    pub fn invariant_holds(&self) -> bool {
        self.connection.is_some() == self.is_connected
    }
}

/// Owns every `ClientRecord`, enforcing the position-uniqueness invariant
/// (at most one client per non-center `ScreenPosition`).
#[derive(Default)]
pub struct ClientsManager {
    clients: HashMap<String, ClientRecord>,
}

impl ClientsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly configured/discovered client. Returns an error
    /// (the record is not inserted) if its `screen_position` is already
    /// held by another client.
    pub fn insert(&mut self, record: ClientRecord) -> Result<(), String> {
        if record.screen_position.is_unique_slot() {
            if let Some(existing) = self.client_at(record.screen_position) {
                return Err(format!(
                    "screen position {:?} already held by {}",
                    record.screen_position, existing.uid
                ));
            }
        }
        self.clients.insert(record.uid.clone(), record);
        Ok(())
    }

    pub fn get(&self, uid: &str) -> Option<&ClientRecord> {
        self.clients.get(uid)
    }

    pub fn get_mut(&mut self, uid: &str) -> Option<&mut ClientRecord> {
        self.clients.get_mut(uid)
    }

    pub fn remove(&mut self, uid: &str) -> Option<ClientRecord> {
        self.clients.remove(uid)
    }

    pub fn client_at(&self, position: ScreenPosition) -> Option<&ClientRecord> {
        self.clients.values().find(|c| c.screen_position == position)
    }

    pub fn client_at_mut(&mut self, position: ScreenPosition) -> Option<&mut ClientRecord> {
        self.clients.values_mut().find(|c| c.screen_position == position)
    }

    /// Identity-precedence lookup used across reconnects: hostname > ip > uid.
    pub fn find_by_identity(&self, hostname: Option<&str>, ip: Option<&str>, uid: &str) -> Option<&ClientRecord> {
        if let Some(h) = hostname {
            if let Some(found) = self.clients.values().find(|c| c.hostname.as_deref() == Some(h)) {
                return Some(found);
            }
        }
        if let Some(ip) = ip {
            if let Some(found) = self.clients.values().find(|c| c.ip_address.as_deref() == Some(ip)) {
                return Some(found);
            }
        }
        self.clients.get(uid)
    }

    pub fn connected_clients(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values().filter(|c| c.is_connected)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// The tagged set of `message_type` values the protocol itself defines
/// (§6), as opposed to free-form domain payloads.
pub fn handshake_message(ack: bool, source: impl Into<String>, sequence_id: u64, timestamp: f64) -> ProtocolMessage {
    let mut msg = ProtocolMessage::new("exchange", source, sequence_id, timestamp);
    msg.payload.insert("ack".to_string(), serde_json::json!(ack));
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_duplicate_screen_position() {
        let mut manager = ClientsManager::new();
        manager.insert(ClientRecord::new("uid-1", ScreenPosition::Top)).unwrap();
        let err = manager.insert(ClientRecord::new("uid-2", ScreenPosition::Top)).unwrap_err();
        assert!(err.contains("uid-1"));
    }

    #[test]
    fn center_and_none_positions_are_not_unique() {
        let mut manager = ClientsManager::new();
        manager.insert(ClientRecord::new("uid-1", ScreenPosition::None)).unwrap();
        manager.insert(ClientRecord::new("uid-2", ScreenPosition::None)).unwrap();
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn connection_invariant_tracks_is_connected() {
        let mut record = ClientRecord::new("uid-1", ScreenPosition::Top);
        assert!(record.invariant_holds());
        record.mark_connected(ClientConnection::new());
        assert!(record.invariant_holds());
        assert!(record.first_connection_date.is_some());
        record.mark_disconnected();
        assert!(record.invariant_holds());
        assert!(!record.is_connected);
    }

    #[test]
    fn find_by_identity_precedence() {
        let mut manager = ClientsManager::new();
        let mut a = ClientRecord::new("uid-1", ScreenPosition::Top);
        a.hostname = Some("alpha".into());
        manager.insert(a).unwrap();

        let mut b = ClientRecord::new("uid-2", ScreenPosition::Left);
        b.ip_address = Some("10.0.0.2".into());
        manager.insert(b).unwrap();

        assert_eq!(manager.find_by_identity(Some("alpha"), None, "uid-x").unwrap().uid, "uid-1");
        assert_eq!(manager.find_by_identity(None, Some("10.0.0.2"), "uid-x").unwrap().uid, "uid-2");
        assert!(manager.find_by_identity(None, None, "nope").is_none());
    }

    #[test]
    fn handshake_message_carries_ack_flag() {
        let msg = handshake_message(true, "server", 0, 1.0);
        assert_eq!(msg.message_type, "exchange");
        assert_eq!(msg.payload.get("ack"), Some(&serde_json::json!(true)));
    }
}
