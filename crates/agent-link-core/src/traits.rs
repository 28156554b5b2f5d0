//! Traits for the backend, socket and media collaborators.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    error::{MediaError, TransportError},
    media::{AudioLevels, IceCandidate, PeerConnectionState, RemoteTrack, SessionDescription},
    message::VideoAttachment,
};

/// Configuration handed out by the backend's config endpoint.
///
/// Fetched once per controller and cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    /// Bearer token to use from now on.
    #[serde(default, alias = "accessToken")]
    pub token: Option<String>,
    #[serde(default, alias = "websocketUrl")]
    pub socket_url: Option<String>,
    #[serde(default)]
    pub signaling_url: Option<String>,
    /// Everything else the backend sent.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// A previous session of the same caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(alias = "sessionId", alias = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// One stored message as returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub role: String,
    #[serde(default, alias = "content")]
    pub message: String,
    /// Record kind, e.g. `"video"`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub video: Option<VideoAttachment>,
}

/// A raw server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerSentEvent {
    /// The `event:` name, if the server sent one.
    pub event: Option<String>,
    pub data: String,
}

/// Body of a streaming response, one event at a time.
///
/// Dropping the stream releases the underlying connection.
pub type EventStream = BoxStream<'static, Result<ServerSentEvent, TransportError>>;

/// Parameters of one streaming exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamRequest {
    pub session_id: Option<String>,
    /// Correlation id of a previous stream to resume.
    pub request_id: Option<String>,
    pub message: String,
    pub html: Option<String>,
    pub credential: Option<String>,
}

/// HTTP side of the assistant backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Fetch client configuration. This is the authentication exchange.
    async fn fetch_config(&self) -> Result<RemoteConfig, TransportError>;

    /// List previous sessions for a caller identity.
    async fn list_sessions(
        &self,
        external_id: &str,
        credential: Option<&str>,
    ) -> Result<Vec<SessionSummary>, TransportError>;

    /// Fetch the ordered message history of a session.
    async fn fetch_history(
        &self,
        session_id: &str,
        credential: Option<&str>,
    ) -> Result<Vec<HistoryRecord>, TransportError>;

    /// Send a message and open its response stream.
    async fn open_stream(&self, request: StreamRequest) -> Result<EventStream, TransportError>;
}

/// Outbound instruction for a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Text(String),
    Close,
}

/// Inbound socket traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// The socket is gone. Always the last event.
    Closed { code: Option<u16>, reason: String },
}

/// An established socket, as a pair of channels.
///
/// The socket counts as open while `outbound` has a live receiver.
#[derive(Debug)]
pub struct SocketConnection {
    pub outbound: mpsc::UnboundedSender<SocketCommand>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens text-frame sockets.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SocketConnection, TransportError>;
}

/// A captured local audio track.
pub trait AudioTrack: Send + Sync {
    fn id(&self) -> String;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Stop capture. Idempotent.
    fn stop(&self);
}

/// Local capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_audio(&self) -> Result<Arc<dyn AudioTrack>, MediaError>;
}

/// Events raised by a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A locally gathered candidate to send to the remote side.
    IceCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteTrack(RemoteTrack),
}

/// A peer-to-peer media session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Create an answer and apply it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Read instantaneous audio energy from connection statistics.
    async fn audio_levels(&self) -> Result<AudioLevels, MediaError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Builds peer connections around a local track.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        local_audio: Arc<dyn AudioTrack>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}
