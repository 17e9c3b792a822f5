//! Application-wide constants for the input fabric.
//!
//! Centralizes magic numbers from the wire contract and the timing model
//! so they are defined exactly once. Constants are grouped by domain.

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// User-Agent-equivalent string for log lines and handshake diagnostics.
pub fn fabric_agent() -> String {
    format!("inputfabric/{}", env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// Wire format (§6)
// ============================================================================

/// Literal 2-byte frame marker immediately following the length prefix.
pub const FRAME_MARKER: [u8; 2] = *b"PY";

/// Default maximum chunk size in bytes before a message is split.
pub const DEFAULT_MAX_CHUNK: usize = 1024;

/// `MaxFrameSize = max_chunk * 100`, computed for the default `max_chunk`.
pub const fn max_frame_size(max_chunk: usize) -> usize {
    max_chunk * 100
}

/// Default primary server port carrying the `Command` stream post-handshake.
pub const DEFAULT_SERVER_PORT: u16 = 55655;

/// Default certificate-sharing port (§4.6).
pub const DEFAULT_CERT_SHARE_PORT: u16 = 55653;

// ============================================================================
// Timeouts (§4.3, §4.4, §5)
// ============================================================================

/// Timeout waiting for a single handshake message from the peer.
pub const HANDSHAKE_MSG_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout waiting for a dialed or pending-promise stream connection.
pub const CONNECTION_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before a client re-dials a stream marked for reopen.
pub const STREAM_CONN_DELAY_GUARD: Duration = Duration::from_millis(250);

/// Delay before the client's main loop retries a failed dial, once the
/// error counter has tripped.
pub const RECONNECTION_DELAY: Duration = Duration::from_secs(2);

/// Grace period `StreamHandler::stop` waits for its sender task to drain
/// before abandoning it.
pub const SENDER_STOP_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Polling & Heartbeat
// ============================================================================

/// Default interval between heartbeat checks on either side of a connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive heartbeat misses tolerated before a client is disconnected.
/// Shared by both connection handlers per SPEC_FULL.md §12.1 (open question
/// resolved to a single constant rather than diverging client/server values).
pub const MAX_HEARTBEAT_MISSES: u32 = 3;

/// Reassembly buffer entries older than this are evicted (§9 DESIGN NOTES:
/// "add a per-message_id deadline"). Expressed as a multiplier on
/// `HEARTBEAT_INTERVAL` per the recommended `10 × heartbeat_interval`.
pub const REASSEMBLY_DEADLINE_MULTIPLIER: u32 = 10;

// ============================================================================
// Backpressure (§4.5, §5)
// ============================================================================

/// Default bounded outgoing queue depth for a `StreamHandler`.
pub const DEFAULT_SEND_QUEUE_DEPTH: usize = 1000;

/// Outgoing queue depth for the high-frequency mouse stream.
pub const MOUSE_SEND_QUEUE_DEPTH: usize = 10_000;

/// Default bounded receive queue depth for manual (non-auto-dispatch)
/// `MessageExchange` polling.
pub const DEFAULT_RECEIVE_BUFFER: usize = 4096;

// ============================================================================
// Certificate sharing (§4.6)
// ============================================================================

/// PBKDF2-HMAC-SHA256 iteration count deriving the envelope key from the OTP.
pub const OTP_PBKDF2_ITERATIONS: u32 = 100_000;

/// Derived key length in bytes (AES-256).
pub const OTP_DERIVED_KEY_LEN: usize = 32;

/// Random salt length in bytes.
pub const OTP_SALT_LEN: usize = 16;

/// AES-GCM nonce length in bytes.
pub const OTP_NONCE_LEN: usize = 12;

/// Default auto-shutdown timeout for the certificate-sharing listener.
pub const DEFAULT_CERT_SHARE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Observability (SPEC_FULL.md §10.6)
// ============================================================================

/// Interval between `MetricsCollector` periodic summary log lines.
pub const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_values_are_reasonable() {
        assert!(HANDSHAKE_MSG_TIMEOUT < CONNECTION_ATTEMPT_TIMEOUT);
        assert!(HEARTBEAT_INTERVAL >= Duration::from_secs(1));
        assert!(MAX_HEARTBEAT_MISSES >= 1);
    }

    #[test]
    fn max_frame_size_matches_spec_default() {
        assert_eq!(max_frame_size(DEFAULT_MAX_CHUNK), 102_400);
    }

    #[test]
    fn cert_share_timeout_within_recommended_bound() {
        assert!(DEFAULT_CERT_SHARE_TIMEOUT <= Duration::from_secs(30));
    }
}
