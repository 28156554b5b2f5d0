//! Transport and channel liveness states.

use serde::{Deserialize, Serialize};

/// Which channel carries chat messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// One streaming HTTP request per exchange.
    #[default]
    Stream,
    /// The bidirectional socket channel.
    Socket,
}

/// Liveness of a socket channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    NeverConnected,
    Connected,
    Degraded,
}
