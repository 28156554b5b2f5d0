//! The chat socket: a heartbeat-guarded channel plus an ack table.

use std::{sync::Arc, time::Duration};

use agent_link_core::{CorrelationTable, TransportError, generate_id};
use agent_link_transport::{Channel, ChatFrame, InboundChatFrame};

use crate::error::ChatError;

/// Handle to an open chat socket. Cheap to clone.
#[derive(Clone)]
pub struct ChatSocket {
    channel: Arc<Channel>,
    acks: CorrelationTable<InboundChatFrame>,
}

impl ChatSocket {
    pub(crate) fn new(channel: Channel, ack_timeout: Duration) -> Self {
        Self {
            channel: Arc::new(channel),
            acks: CorrelationTable::new(ack_timeout),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Whether a send would go out over this socket right now.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.channel.is_live()
    }

    /// Send a frame without waiting for anything.
    ///
    /// # Errors
    /// Returns error if the frame cannot be encoded or the socket is gone.
    pub fn send(&self, frame: &ChatFrame) -> Result<(), TransportError> {
        let text = frame
            .encode()
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        tracing::debug!(frame = ?frame.kind, event_id = ?frame.event_id, "chat frame out");
        self.channel.send_text(text)
    }

    /// Send a frame and wait for the inbound frame carrying the same `eventId`.
    ///
    /// A frame without an id gets a fresh one.
    ///
    /// # Errors
    /// Returns error if the send fails, or if no matching frame arrives
    /// before the ack timeout or the socket closes.
    pub async fn send_with_ack(&self, mut frame: ChatFrame) -> Result<InboundChatFrame, ChatError> {
        let id = frame.event_id.get_or_insert_with(generate_id).clone();
        let pending = self.acks.register(Some(id));
        if let Err(e) = self.send(&frame) {
            self.acks.reject(pending.id(), e.to_string());
            return Err(e.into());
        }
        Ok(pending.wait().await?)
    }

    /// Send a frame whose ack is only watched for logging.
    pub(crate) fn send_tracked(&self, frame: ChatFrame) -> Result<(), TransportError> {
        let pending = self.acks.register(frame.event_id.clone());
        if let Err(e) = self.send(&frame) {
            self.acks.reject(pending.id(), e.to_string());
            return Err(e);
        }
        tokio::spawn(async move {
            if let Err(e) = pending.wait().await {
                tracing::debug!("chat frame not acknowledged: {e}");
            }
        });
        Ok(())
    }

    /// Complete any pending request with this inbound frame's id.
    pub(crate) fn settle(&self, frame: &InboundChatFrame) -> bool {
        frame
            .event_id()
            .is_some_and(|id| self.acks.resolve(id, frame.clone()))
    }

    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Close the socket and fail every pending ack.
    pub(crate) fn close(&self, reason: &str) {
        self.acks.reject_all(reason);
        self.channel.close();
    }
}

impl std::fmt::Debug for ChatSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSocket")
            .field("channel", &self.channel)
            .field("pending_acks", &self.acks.len())
            .finish()
    }
}
