//! Chat session orchestration.
//!
//! Provides:
//! - `ChatController` - session lifecycle, stream/socket selection and failover
//! - `ChatSocket` - the upgraded chat socket with acked sends
//! - History record mapping

pub mod controller;
pub mod error;
pub mod history;
pub mod socket;

pub use controller::{ChatController, ChatPhase};
pub use error::ChatError;
pub use socket::ChatSocket;
