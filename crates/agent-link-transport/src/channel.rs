//! A socket channel guarded by its own heartbeat.
//!
//! Both the chat socket and the call signaling socket are a [`Channel`]:
//! the socket's outbound half, a liveness state and a [`HeartbeatMonitor`].
//! The inbound half is handed to the owner, which reads and interprets frames.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use agent_link_core::{
    ChannelState, HeartbeatConfig, HeartbeatMonitor, HeartbeatStats, LivenessProbe,
    SocketConnector, TransportError,
    traits::{SocketCommand, SocketEvent},
};
use serde::Serialize;
use tokio::sync::mpsc;

/// Which socket a channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Chat,
    Signaling,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Signaling => write!(f, "signaling"),
        }
    }
}

/// Inbound half of a channel.
pub type ChannelReceiver = mpsc::UnboundedReceiver<SocketEvent>;

/// An open socket plus liveness bookkeeping.
pub struct Channel {
    role: ChannelRole,
    outbound: mpsc::UnboundedSender<SocketCommand>,
    state: Arc<Mutex<ChannelState>>,
    heartbeat: HeartbeatMonitor,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Sends a heartbeat frame through the channel's outbound half.
struct FrameProbe<P> {
    outbound: mpsc::UnboundedSender<SocketCommand>,
    frame: P,
}

impl<P> LivenessProbe for FrameProbe<P>
where
    P: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    fn send_probe(&self) -> bool {
        let Some(text) = (self.frame)() else {
            return false;
        };
        self.outbound.send(SocketCommand::Text(text)).is_ok()
    }
}

impl Channel {
    /// Open a socket, bounded by `timeout`.
    ///
    /// # Errors
    /// Returns [`TransportError::Timeout`] if the socket did not open in time,
    /// or whatever the connector reported.
    pub async fn connect(
        connector: &dyn SocketConnector,
        url: &str,
        timeout: Duration,
        heartbeat: HeartbeatConfig,
        role: ChannelRole,
    ) -> Result<(Self, ChannelReceiver), TransportError> {
        tracing::debug!(%role, "opening socket channel");
        let connection = tokio::time::timeout(timeout, connector.connect(url))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        tracing::info!(%role, "socket channel connected");

        let channel = Self {
            role,
            outbound: connection.outbound,
            state: Arc::new(Mutex::new(ChannelState::Connected)),
            heartbeat: HeartbeatMonitor::new(heartbeat),
        };
        Ok((channel, connection.inbound))
    }

    /// Whether the socket is still accepting frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Open and not degraded.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.is_open() && self.state() == ChannelState::Connected
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a text frame.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] if the socket is gone.
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(SocketCommand::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    /// Serialize and queue a frame.
    ///
    /// # Errors
    /// Returns error if serialization fails or the socket is gone.
    pub fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        tracing::debug!(role = %self.role, frame = %text, "sending frame");
        self.send_text(text)
    }

    /// Start the heartbeat.
    ///
    /// `probe_frame` produces each probe's text. `on_failure` runs after the
    /// channel has been marked degraded, once per missed deadline.
    pub fn start_heartbeat<P, F>(&self, probe_frame: P, on_failure: F)
    where
        P: Fn() -> Option<String> + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let probe = Arc::new(FrameProbe {
            outbound: self.outbound.clone(),
            frame: probe_frame,
        });
        let state = Arc::clone(&self.state);
        let role = self.role;
        self.heartbeat.start(probe, move || {
            tracing::warn!(%role, "socket channel degraded");
            *state.lock().unwrap_or_else(PoisonError::into_inner) = ChannelState::Degraded;
            on_failure();
        });
    }

    /// Record a heartbeat ack. A degraded channel becomes live again.
    pub fn ack(&self) {
        self.heartbeat.on_ack();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ChannelState::Degraded && self.is_open() {
            *state = ChannelState::Connected;
        }
    }

    #[must_use]
    pub fn heartbeat_stats(&self) -> HeartbeatStats {
        self.heartbeat.stats()
    }

    /// Stop the heartbeat and close the socket. Idempotent.
    pub fn close(&self) {
        self.heartbeat.stop();
        if self.is_open() {
            tracing::debug!(role = %self.role, "closing socket channel");
            let _ = self.outbound.send(SocketCommand::Close);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use agent_link_core::traits::SocketConnection;
    use async_trait::async_trait;

    use super::*;

    struct PairConnector {
        peer: Mutex<Option<mpsc::UnboundedSender<mpsc::UnboundedReceiver<SocketCommand>>>>,
    }

    #[async_trait]
    impl SocketConnector for PairConnector {
        async fn connect(&self, _url: &str) -> Result<SocketConnection, TransportError> {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (_in_tx, in_rx) = mpsc::unbounded_channel();
            if let Some(peer) = self.peer.lock().unwrap().as_ref() {
                let _ = peer.send(out_rx);
            }
            Ok(SocketConnection {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    struct HangingConnector;

    #[async_trait]
    impl SocketConnector for HangingConnector {
        async fn connect(&self, _url: &str) -> Result<SocketConnection, TransportError> {
            std::future::pending().await
        }
    }

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(100),
            grace: Duration::from_millis(50),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let result = Channel::connect(
            &HangingConnector,
            "ws://test",
            Duration::from_secs(5),
            config(),
            ChannelRole::Chat,
        )
        .await;
        assert_eq!(result.unwrap_err(), TransportError::Timeout(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_degrades_and_ack_recovers() {
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let connector = PairConnector {
            peer: Mutex::new(Some(peer_tx)),
        };
        let (channel, _inbound) = Channel::connect(
            &connector,
            "ws://test",
            Duration::from_secs(1),
            config(),
            ChannelRole::Signaling,
        )
        .await
        .unwrap();
        let mut server = peer_rx.recv().await.unwrap();
        assert!(channel.is_live());

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        channel.start_heartbeat(
            || Some(r#"{"type":"ping"}"#.to_string()),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(
            server.recv().await,
            Some(SocketCommand::Text(r#"{"type":"ping"}"#.to_string()))
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Degraded);
        assert!(!channel.is_live());

        channel.ack();
        assert!(channel.is_live());
        assert!(channel.heartbeat_stats().last_ack.is_some());
    }

    #[tokio::test]
    async fn test_close_sends_close_once_open() {
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let connector = PairConnector {
            peer: Mutex::new(Some(peer_tx)),
        };
        let (channel, _inbound) = Channel::connect(
            &connector,
            "ws://test",
            Duration::from_secs(1),
            config(),
            ChannelRole::Chat,
        )
        .await
        .unwrap();
        let mut server = peer_rx.recv().await.unwrap();

        channel.send_json(&serde_json::json!({"type": "pong"})).unwrap();
        channel.close();
        assert_eq!(
            server.recv().await,
            Some(SocketCommand::Text(r#"{"type":"pong"}"#.to_string()))
        );
        assert_eq!(server.recv().await, Some(SocketCommand::Close));

        drop(server);
        assert!(!channel.is_open());
        assert_eq!(channel.send_text("x".into()), Err(TransportError::Closed));
        channel.close();
    }
}
