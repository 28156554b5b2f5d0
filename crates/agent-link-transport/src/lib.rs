//! Wire protocols and network adapters.
//!
//! Provides:
//! - Streaming event, chat socket and signaling protocols
//! - SSE decoding
//! - Socket `Channel` with heartbeat-driven liveness
//! - HTTP backend (feature: http)
//! - WebSocket connector (feature: websocket)

pub mod channel;
pub mod endpoints;
pub mod protocol;
pub mod sse;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{Channel, ChannelReceiver, ChannelRole};
pub use endpoints::Endpoints;
pub use protocol::{
    ChatFrame, ChatFrameType, InboundChatFrame, ProtocolError, SignalingMessage, StreamEvent,
};

#[cfg(feature = "http")]
pub use http::HttpBackend;

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;
