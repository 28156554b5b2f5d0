//! Voice call controller.
//!
//! Drives one call at a time: local audio capture, the signaling socket,
//! the offer/answer handshake, ICE exchange, renegotiation and teardown.
//! Media itself sits behind the [`agent_link_core::MediaDevices`] and
//! [`agent_link_core::PeerConnectionFactory`] traits.

pub mod controller;
pub mod error;

pub use controller::{CallController, CallPhase};
pub use error::CallError;
