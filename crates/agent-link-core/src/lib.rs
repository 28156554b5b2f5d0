//! Core abstractions for assistant chat and call sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `Message` model and the `Reassembler` that builds it from fragments
//! - `HeartbeatMonitor` - probe/ack liveness per channel
//! - `CorrelationTable` - request/response matching with timeouts
//! - `EventBus` - typed event fanout for observers
//! - Backend, socket and media traits

pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod media;
pub mod message;
pub mod reassembler;
pub mod state;
pub mod traits;

pub use config::{ClientConfig, ConfigError};
pub use correlation::{CorrelationError, CorrelationTable, PendingResponse, generate_id};
pub use error::{MediaError, TransportError};
pub use events::{CallEvent, ChatEvent, EventBus};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, HeartbeatStats, LivenessProbe};
pub use media::{CallStatus, IceCandidate, PeerConnectionState, SessionDescription};
pub use message::{Attachment, GENERIC_ERROR_TEXT, Message, Role};
pub use reassembler::{Applied, ContentFragment, Fragment, Reassembler, reassemble};
pub use state::{ChannelState, Transport};
pub use traits::{ChatBackend, MediaDevices, PeerConnection, PeerConnectionFactory, SocketConnector};
