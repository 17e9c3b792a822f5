//! Stream handlers: the three state machines that move per-device data
//! between the handshake layer's `ClientConnection` streams and the wire
//! (spec §4.5).

pub mod client_handler;
pub mod handler;
pub mod server_multicast;
pub mod server_unicast;

pub use client_handler::ClientStreamHandler;
pub use handler::SendQueue;
pub use server_multicast::ServerMulticastHandler;
pub use server_unicast::ServerUnicastHandler;

use std::sync::Arc;

use crate::connection::types::StreamPair;
use crate::protocol::MessageExchange;

/// Attach a stream pair to a `MessageExchange`'s reserved unicast slot.
pub(crate) async fn exchange_default_transport(exchange: &Arc<MessageExchange>, pair: StreamPair) {
    exchange
        .set_transport(crate::protocol::exchange::DEFAULT_TRANSPORT_ID, pair.reader, pair.writer)
        .await;
}

/// A stable, human-readable transport key for a multicast slot (spec
/// §4.2 "multicast mode keys transports by screen position").
pub(crate) fn screen_transport_id(screen: crate::protocol::ScreenPosition) -> String {
    format!("{screen:?}")
}
