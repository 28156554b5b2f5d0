//! Call signaling controller.
//!
//! Runs one call at a time through
//! `Idle -> AcquiringMedia -> Connecting -> OfferSent -> Connected`, with
//! `Renegotiating` reachable only from `Connected`, and `Error` /
//! `Disconnected` at the end.
//!
//! State sits behind one mutex that is never held across an `.await`.
//! The signaling reader, the peer event pump and heartbeat callbacks hold a
//! `Weak` reference and the epoch of the call that spawned them; anything
//! tagged with an older epoch is ignored.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use agent_link_core::{
    CallEvent, CallStatus, ClientConfig, EventBus, MediaDevices, PeerConnection,
    PeerConnectionFactory, SessionDescription, SocketConnector,
    media::{AudioLevels, RemoteTrack},
    traits::{AudioTrack, PeerEvent, SocketEvent},
};
use agent_link_transport::{
    Channel, ChannelReceiver, ChannelRole, Endpoints, SignalingMessage, protocol::SdpPayload,
};
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::CallError;

/// Lifecycle phase of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    #[default]
    Idle,
    AcquiringMedia,
    /// Opening the signaling socket and the peer connection.
    Connecting,
    /// Waiting for the answer.
    OfferSent,
    Connected,
    Renegotiating,
    Error,
    Disconnected,
}

impl CallPhase {
    /// Whether a call is being set up or is up.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::AcquiringMedia
                | Self::Connecting
                | Self::OfferSent
                | Self::Connected
                | Self::Renegotiating
        )
    }

    const fn is_established(self) -> bool {
        matches!(self, Self::Connected | Self::Renegotiating)
    }
}

type AnswerSender = oneshot::Sender<Result<SessionDescription, CallError>>;

/// Resources of one call attempt. Filled in as the handshake progresses.
struct CallSession {
    epoch: u64,
    local_audio: Option<Arc<dyn AudioTrack>>,
    signaling: Option<Arc<Channel>>,
    peer: Option<Arc<dyn PeerConnection>>,
    answer: Option<AnswerSender>,
    remote_track: Option<RemoteTrack>,
}

impl CallSession {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            local_audio: None,
            signaling: None,
            peer: None,
            answer: None,
            remote_track: None,
        }
    }

    /// Stop capture and close signaling. The peer is handed back because
    /// closing it is async.
    ///
    /// With an `error`, a caller still waiting for the answer gets it.
    fn release(&mut self, error: Option<&CallError>) -> Option<Arc<dyn PeerConnection>> {
        if let Some(answer) = self.answer.take() {
            if let Some(error) = error {
                let _ = answer.send(Err(error.clone()));
            }
        }
        if let Some(track) = self.local_audio.take() {
            tracing::debug!(track = %track.id(), "stopping local audio");
            track.stop();
        }
        if let Some(channel) = self.signaling.take() {
            channel.close();
        }
        self.peer.take()
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(peer) = self.release(None) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { peer.close().await });
            }
        }
    }
}

#[derive(Default)]
struct State {
    phase: CallPhase,
    status: CallStatus,
    muted: bool,
    call: Option<CallSession>,
    epoch: u64,
}

impl State {
    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    fn current(&mut self, epoch: u64) -> Option<&mut CallSession> {
        self.call.as_mut().filter(|call| call.epoch == epoch)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.call.as_ref().is_some_and(|call| call.epoch == epoch)
    }
}

struct Inner {
    config: ClientConfig,
    endpoints: Endpoints,
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    connector: Arc<dyn SocketConnector>,
    events: EventBus<CallEvent>,
    state: Mutex<State>,
}

/// Voice call controller. Cheap to clone; clones share the call.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<Inner>,
}

impl CallController {
    /// # Errors
    /// Returns [`CallError::Signaling`] if the API base is invalid.
    pub fn new(
        config: ClientConfig,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<Self, CallError> {
        let endpoints = Endpoints::new(&config.api_base).map_err(CallError::Signaling)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                endpoints,
                media,
                peers,
                connector,
                events: EventBus::new(),
                state: Mutex::new(State::default()),
            }),
        })
    }

    /// Start a call and wait until the answer has been applied.
    ///
    /// Does nothing while another call is being set up or is up. Any
    /// failure releases everything acquired so far before returning, and
    /// is reported as status `error` followed by `disconnected`.
    ///
    /// # Errors
    /// Returns error if media, signaling or negotiation fails, if no answer
    /// arrives within the answer timeout, or [`CallError::Cancelled`] if the
    /// call was ended meanwhile.
    pub async fn start_call(&self, session_id: Option<String>) -> Result<(), CallError> {
        let inner = &self.inner;
        let epoch = {
            let mut state = inner.state();
            if state.phase.is_active() {
                tracing::debug!(phase = ?state.phase, "call already in progress, ignoring start");
                return Ok(());
            }
            let epoch = state.next_epoch();
            state.call = Some(CallSession::new(epoch));
            state.phase = CallPhase::AcquiringMedia;
            state.muted = false;
            inner.set_status(&mut state, CallStatus::Connecting);
            epoch
        };
        tracing::info!(session_id = ?session_id, "starting call");

        match inner.negotiate(epoch, session_id.as_deref()).await {
            Ok(()) => Ok(()),
            Err(e) => Err(inner.fail(epoch, e).await),
        }
    }

    /// Hang up. Sends `end` while signaling is open, then releases media,
    /// the socket and the peer connection. No-op without a call.
    pub async fn end_call(&self) {
        let inner = &self.inner;
        let (epoch, signaling) = {
            let state = inner.state();
            match &state.call {
                Some(call) => (call.epoch, call.signaling.clone()),
                None => return,
            }
        };
        if let Some(channel) = signaling.filter(|channel| channel.is_open()) {
            if let Err(e) = send_signal(&channel, &SignalingMessage::End) {
                tracing::debug!("could not send end frame: {e}");
            }
        }
        inner.hang_up(epoch, "ended locally").await;
    }

    /// Flip the local track's enabled flag. Returns whether audio is now muted.
    ///
    /// # Errors
    /// Returns [`CallError::NoLocalMedia`] if no track has been captured.
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let mut state = self.inner.state();
        let track = state
            .call
            .as_ref()
            .and_then(|call| call.local_audio.clone())
            .ok_or(CallError::NoLocalMedia)?;
        let muted = track.is_enabled();
        track.set_enabled(!muted);
        state.muted = muted;
        tracing::info!(muted, "microphone toggled");
        Ok(muted)
    }

    /// Current microphone energy, 0.0 to 1.0.
    ///
    /// # Errors
    /// Returns [`CallError::NotConnected`] without a peer connection.
    pub async fn local_audio_level(&self) -> Result<f64, CallError> {
        Ok(self.inner.audio_levels().await?.input)
    }

    /// Current remote audio energy, 0.0 to 1.0.
    ///
    /// # Errors
    /// Returns [`CallError::NotConnected`] without a peer connection.
    pub async fn remote_audio_level(&self) -> Result<f64, CallError> {
        Ok(self.inner.audio_levels().await?.output)
    }

    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.inner.state().status
    }

    #[must_use]
    pub fn phase(&self) -> CallPhase {
        self.inner.state().phase
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.inner.state().muted
    }

    #[must_use]
    pub fn remote_track(&self) -> Option<RemoteTrack> {
        self.inner
            .state()
            .call
            .as_ref()
            .and_then(|call| call.remote_track.clone())
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> BoxStream<'static, CallEvent> {
        self.inner.events.stream()
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("CallController")
            .field("phase", &state.phase)
            .field("status", &state.status)
            .field("muted", &state.muted)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: &mut State, status: CallStatus) {
        if state.status != status {
            state.status = status;
            tracing::info!(?status, "call status changed");
            self.events.emit(CallEvent::StatusChanged { status });
        }
    }

    /// Media, signaling, peer, offer, answer. Every step re-checks the
    /// epoch and releases what it just acquired if the call is gone.
    async fn negotiate(
        self: &Arc<Self>,
        epoch: u64,
        session_id: Option<&str>,
    ) -> Result<(), CallError> {
        let track = self.media.acquire_audio().await?;
        {
            let mut state = self.state();
            let Some(call) = state.current(epoch) else {
                track.stop();
                return Err(CallError::Cancelled);
            };
            call.local_audio = Some(Arc::clone(&track));
            state.phase = CallPhase::Connecting;
        }
        tracing::debug!(track = %track.id(), "local audio acquired");

        let url = self.endpoints.signaling(
            self.config.signaling_url.as_deref(),
            session_id,
            self.config.credential.as_deref(),
        )?;
        let (channel, inbound) = Channel::connect(
            self.connector.as_ref(),
            url.as_str(),
            self.config.connect_timeout(),
            self.config.heartbeat(),
            ChannelRole::Signaling,
        )
        .await?;
        let channel = Arc::new(channel);
        {
            let mut state = self.state();
            let Some(call) = state.current(epoch) else {
                channel.close();
                return Err(CallError::Cancelled);
            };
            call.signaling = Some(Arc::clone(&channel));
        }
        let weak = Arc::downgrade(self);
        channel.start_heartbeat(
            || SignalingMessage::Ping.encode().ok(),
            move || {
                if let Some(inner) = weak.upgrade() {
                    tokio::spawn(async move {
                        inner
                            .lost(epoch, CallError::SignalingClosed, "signaling heartbeat missed")
                            .await;
                    });
                }
            },
        );
        tokio::spawn(read_signaling(
            Arc::downgrade(self),
            epoch,
            Arc::clone(&channel),
            inbound,
        ));

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = self.peers.create(track, peer_tx).await?;
        let installed = {
            let mut state = self.state();
            match state.current(epoch) {
                Some(call) => {
                    call.peer = Some(Arc::clone(&peer));
                    true
                }
                None => false,
            }
        };
        if !installed {
            peer.close().await;
            return Err(CallError::Cancelled);
        }
        tokio::spawn(pump_peer_events(
            Arc::downgrade(self),
            epoch,
            Arc::clone(&channel),
            peer_rx,
        ));

        let offer = peer.create_offer().await?;
        let (answer_tx, answer_rx) = oneshot::channel();
        {
            let mut state = self.state();
            let Some(call) = state.current(epoch) else {
                return Err(CallError::Cancelled);
            };
            call.answer = Some(answer_tx);
            state.phase = CallPhase::OfferSent;
        }
        send_signal(&channel, &SignalingMessage::Offer(SdpPayload::from(&offer)))?;
        tracing::info!("offer sent, waiting for answer");

        let timeout = self.config.answer_timeout();
        let answer = match tokio::time::timeout(timeout, answer_rx).await {
            Err(_) => return Err(CallError::Timeout(timeout)),
            Ok(Err(_)) => return Err(CallError::Cancelled),
            Ok(Ok(answer)) => answer?,
        };
        peer.set_remote_description(answer).await?;

        let mut state = self.state();
        if !state.is_current(epoch) {
            return Err(CallError::Cancelled);
        }
        state.phase = CallPhase::Connected;
        self.set_status(&mut state, CallStatus::Connected);
        drop(state);
        tracing::info!("call connected");
        Ok(())
    }

    /// Tear the call down after a failure and report it. Returns `error`.
    ///
    /// Resources are released before the error is surfaced. A call that is
    /// already gone is left alone.
    async fn fail(&self, epoch: u64, error: CallError) -> CallError {
        let peer = {
            let mut state = self.state();
            if !state.is_current(epoch) {
                return error;
            }
            state.phase = CallPhase::Error;
            state.call.take().and_then(|mut call| call.release(Some(&error)))
        };
        if let Some(peer) = peer {
            peer.close().await;
        }
        tracing::error!("call failed: {error}");

        let mut state = self.state();
        if state.epoch == epoch {
            self.set_status(&mut state, CallStatus::Error);
            self.events.emit(CallEvent::Error {
                message: error.to_string(),
            });
            state.phase = CallPhase::Disconnected;
            self.set_status(&mut state, CallStatus::Disconnected);
        }
        error
    }

    /// Tear the call down without an error.
    async fn hang_up(&self, epoch: u64, reason: &str) {
        let peer = {
            let mut state = self.state();
            if !state.is_current(epoch) {
                return;
            }
            state.phase = CallPhase::Disconnected;
            state.call.take().and_then(|mut call| call.release(None))
        };
        tracing::info!(reason, "call ended");
        if let Some(peer) = peer {
            peer.close().await;
        }

        let mut state = self.state();
        if state.epoch == epoch {
            self.set_status(&mut state, CallStatus::Disconnected);
        }
    }

    /// The signaling socket or the peer connection went away. An
    /// established call just ends; one still being set up fails.
    async fn lost(&self, epoch: u64, error: CallError, reason: &str) {
        let established = {
            let state = self.state();
            if !state.is_current(epoch) {
                return;
            }
            state.phase.is_established()
        };
        if established {
            self.hang_up(epoch, reason).await;
        } else {
            self.fail(epoch, error).await;
        }
    }

    async fn audio_levels(&self) -> Result<AudioLevels, CallError> {
        let peer = self
            .state()
            .call
            .as_ref()
            .and_then(|call| call.peer.clone())
            .ok_or(CallError::NotConnected)?;
        Ok(peer.audio_levels().await?)
    }

    fn peer(&self, epoch: u64) -> Option<Arc<dyn PeerConnection>> {
        self.state().current(epoch).and_then(|call| call.peer.clone())
    }

    fn deliver_answer(&self, epoch: u64, answer: SessionDescription) {
        let waiter = self.state().current(epoch).and_then(|call| call.answer.take());
        match waiter {
            Some(waiter) => {
                tracing::debug!("answer received");
                let _ = waiter.send(Ok(answer));
            }
            None => tracing::warn!("unexpected answer, ignoring"),
        }
    }

    /// Apply a mid-call offer and send back exactly one answer.
    async fn renegotiate(&self, epoch: u64, channel: &Channel, offer: SessionDescription) {
        let peer = {
            let mut state = self.state();
            if state.phase != CallPhase::Connected {
                tracing::warn!(phase = ?state.phase, "renegotiation offer outside a connected call, ignoring");
                return;
            }
            let Some(peer) = state.current(epoch).and_then(|call| call.peer.clone()) else {
                return;
            };
            state.phase = CallPhase::Renegotiating;
            peer
        };
        tracing::info!("renegotiating");

        let result = async {
            peer.set_remote_description(offer).await?;
            let answer = peer.create_answer().await?;
            send_signal(
                channel,
                &SignalingMessage::RenegotiationAnswer(SdpPayload::from(&answer)),
            )
        }
        .await;

        let mut state = self.state();
        if state.is_current(epoch) && state.phase == CallPhase::Renegotiating {
            state.phase = CallPhase::Connected;
        }
        drop(state);
        if let Err(e) = result {
            tracing::warn!("renegotiation failed: {e}");
            self.events.emit(CallEvent::Error {
                message: e.to_string(),
            });
        }
    }

    async fn on_signal(&self, epoch: u64, channel: &Channel, message: SignalingMessage) -> bool {
        match message {
            SignalingMessage::Ping => {
                if let Err(e) = send_signal(channel, &SignalingMessage::Pong) {
                    tracing::debug!("could not answer signaling ping: {e}");
                }
            }
            SignalingMessage::Pong => {}
            SignalingMessage::Answer(payload) => {
                self.deliver_answer(epoch, SessionDescription::answer(payload.sdp));
            }
            SignalingMessage::Ice(candidate) => match self.peer(epoch) {
                Some(peer) => {
                    if let Err(e) = peer.add_ice_candidate(candidate).await {
                        tracing::warn!("could not apply remote candidate: {e}");
                    }
                }
                None => tracing::warn!("remote candidate before peer connection, ignoring"),
            },
            SignalingMessage::RenegotiationOffer(payload) => {
                self.renegotiate(epoch, channel, SessionDescription::offer(payload.sdp))
                    .await;
            }
            SignalingMessage::End => {
                self.lost(
                    epoch,
                    CallError::Remote("call ended by remote".to_string()),
                    "ended by remote",
                )
                .await;
                return false;
            }
            SignalingMessage::Error(payload) => {
                let message = SignalingMessage::error_message(&payload);
                self.fail(epoch, CallError::Remote(message)).await;
                return false;
            }
            other @ (SignalingMessage::Offer(_) | SignalingMessage::RenegotiationAnswer(_)) => {
                tracing::warn!(frame = ?other, "unexpected signaling frame, ignoring");
            }
        }
        true
    }

    async fn on_peer_event(&self, epoch: u64, channel: &Channel, event: PeerEvent) -> bool {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Err(e) = send_signal(channel, &SignalingMessage::Ice(candidate)) {
                    tracing::debug!("could not send local candidate: {e}");
                }
            }
            PeerEvent::StateChanged(peer_state) => {
                tracing::debug!(state = ?peer_state, "peer connection state");
                if peer_state.is_terminal() {
                    self.lost(
                        epoch,
                        CallError::Handshake(format!("peer connection {peer_state:?}")),
                        "peer connection closed",
                    )
                    .await;
                    return false;
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let stored = {
                    let mut state = self.state();
                    state
                        .current(epoch)
                        .map(|call| call.remote_track = Some(track.clone()))
                        .is_some()
                };
                if stored {
                    tracing::info!(track = %track.id, kind = %track.kind, "remote track");
                    self.events.emit(CallEvent::RemoteTrack { track });
                }
            }
        }
        true
    }
}

fn send_signal(channel: &Channel, message: &SignalingMessage) -> Result<(), CallError> {
    let text = message
        .encode()
        .map_err(|e| CallError::Handshake(e.to_string()))?;
    tracing::debug!(frame = %text, "signaling frame out");
    Ok(channel.send_text(text)?)
}

/// Handle signaling frames in arrival order until the socket or the call ends.
async fn read_signaling(
    inner: Weak<Inner>,
    epoch: u64,
    channel: Arc<Channel>,
    mut inbound: ChannelReceiver,
) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.state().is_current(epoch) {
            return;
        }
        match event {
            SocketEvent::Text(text) => {
                channel.ack();
                match SignalingMessage::decode(&text) {
                    Ok(message) => {
                        tracing::debug!(frame = ?message, "signaling frame in");
                        if !inner.on_signal(epoch, &channel, message).await {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!("ignoring signaling frame: {e}"),
                }
            }
            SocketEvent::Closed { code, reason } => {
                tracing::info!(?code, %reason, "signaling socket closed");
                inner
                    .lost(epoch, CallError::SignalingClosed, "signaling closed")
                    .await;
                return;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner
            .lost(epoch, CallError::SignalingClosed, "signaling closed")
            .await;
    }
}

async fn pump_peer_events(
    inner: Weak<Inner>,
    epoch: u64,
    channel: Arc<Channel>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.state().is_current(epoch) {
            return;
        }
        if !inner.on_peer_event(epoch, &channel, event).await {
            return;
        }
    }
}
