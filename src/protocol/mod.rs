//! The network fabric's wire layer.
//!
//! ```text
//!   bytes on a TCP stream
//!        │
//!        ▼
//!   framing::FrameDecoder   (§4.1 — length-prefixed "PY" frames)
//!        │
//!        ▼
//!   message::ProtocolMessage (§3 — the typed envelope)
//!        │
//!        ▼
//!   exchange::MessageExchange (§4.2 — chunking, reassembly, dispatch)
//! ```
//!
//! Dependency order is leaves-first: `message` has no dependents inside
//! this module, `framing` depends only on `message`, `exchange` depends on
//! both.

pub mod exchange;
pub mod framing;
pub mod message;

pub use exchange::{MessageExchange, MessageExchangeConfig, MessageHandler, Transport};
pub use framing::{encode_frame, FrameDecoder};
pub use message::{ProtocolMessage, ScreenPosition, SequenceCounter, StreamKind};
