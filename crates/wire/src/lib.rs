pub mod connection;
pub mod error;
pub mod frame;
pub mod inbound;
pub mod outbound;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use error::{ConnectionError, FrameError};
pub use frame::{ClientFrame, ServerFrame};
pub use inbound::InboundRouter;
pub use outbound::{FrameReceiver, FrameSender, OutboundRouter, OutboundRouterError, frame_channel};
pub use transport::{WebSocketTransport, WireTransport};
