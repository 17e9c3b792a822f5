// Library modules
pub mod cert_share;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event_bus;
pub mod jwt;
pub mod metrics;
pub mod protocol;
pub mod stream;

// Re-export commonly used types
pub use config::{AuthorizedClient, FabricConfig};
pub use connection::{ClientConnectionHandler, ServerConnectionHandler};
pub use error::FabricError;
pub use event_bus::{EventBus, LifecycleEvent};
pub use metrics::{ConnectionMetrics, MetricsCollector};
pub use protocol::{MessageExchange, MessageExchangeConfig, ProtocolMessage, ScreenPosition, StreamKind};
pub use stream::{ClientStreamHandler, ServerMulticastHandler, ServerUnicastHandler};
