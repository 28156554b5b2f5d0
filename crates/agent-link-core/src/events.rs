//! Typed event fanout for controller observers.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    ChannelState, Transport,
    media::{CallStatus, RemoteTrack},
    message::Message,
};

const EVENT_CAPACITY: usize = 1024;

/// Chat session notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A message was appended at `index`.
    MessageAdded { index: usize, message: Message },
    /// The message at `index` changed in place.
    MessageUpdated { index: usize, message: Message },
    TypingOn,
    TypingOff,
    SessionIdChanged { session_id: String },
    TransportChanged { transport: Transport },
    ChannelStateChanged { state: ChannelState },
}

/// Call session notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    StatusChanged { status: CallStatus },
    Error { message: String },
    RemoteTrack { track: RemoteTrack },
}

/// Multi-subscriber broadcast of controller events.
///
/// Emitting never blocks; slow subscribers lose the oldest events.
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Deliver an event to every current subscriber.
    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Live events as a stream, skipping over lag gaps.
    #[must_use]
    pub fn stream(&self) -> futures::stream::BoxStream<'static, E> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fanout_to_all_subscribers() {
        let bus = EventBus::<ChatEvent>::new();
        let mut first = bus.subscribe();
        let mut second = bus.stream();

        bus.emit(ChatEvent::TypingOn);

        assert_eq!(first.recv().await.unwrap(), ChatEvent::TypingOn);
        assert_eq!(second.next().await.unwrap(), ChatEvent::TypingOn);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::<CallEvent>::new();
        bus.emit(CallEvent::Error {
            message: "nobody listening".into(),
        });
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&ChatEvent::SessionIdChanged {
            session_id: "s1".into(),
        })
        .unwrap();
        assert!(json.contains("session_id_changed"));
    }
}
