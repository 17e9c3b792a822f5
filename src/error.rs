//! Error types that call sites need to match on programmatically.
//!
//! Most fallible operations in this crate return `anyhow::Result` and are
//! only ever logged or bubbled up. The handful of cases a caller actually
//! branches on (timeout vs. rejection vs. protocol violation) are collected
//! here instead of being buried in anyhow string matching.

use std::fmt;

/// Errors a caller may need to distinguish, as opposed to the catch-all
/// `anyhow::Error` used everywhere else.
#[derive(Debug)]
pub enum FabricError {
    /// `MessageExchange::send` was called with no transport registered
    /// under the requested id (or `"default"` in unicast mode).
    MissingTransport { transport_id: String },
    /// A handshake phase did not complete within its timeout.
    HandshakeTimeout { phase: &'static str },
    /// The peer's declared identity did not match an authorized client.
    Unauthorized { peer: String },
    /// A message violated the wire contract in a way that is not simply a
    /// resyncable framing error (e.g. required handshake field missing).
    ProtocolViolation { detail: String },
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTransport { transport_id } => {
                write!(f, "no transport registered under id {transport_id:?}")
            }
            Self::HandshakeTimeout { phase } => {
                write!(f, "handshake timed out waiting for {phase}")
            }
            Self::Unauthorized { peer } => {
                write!(f, "peer {peer} is not an authorized client")
            }
            Self::ProtocolViolation { detail } => write!(f, "protocol violation: {detail}"),
        }
    }
}

impl std::error::Error for FabricError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_mention_context() {
        let err = FabricError::MissingTransport {
            transport_id: "default".into(),
        };
        assert!(err.to_string().contains("default"));

        let err = FabricError::Unauthorized {
            peer: "10.0.0.5".into(),
        };
        assert!(err.to_string().contains("10.0.0.5"));
    }
}
