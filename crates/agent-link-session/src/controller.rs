//! Chat transport controller.
//!
//! Owns the live chat session: authentication, history, the choice between
//! the streaming endpoint and the socket, failover between them, and
//! reassembly of streamed fragments into the message list.
//!
//! All state sits behind one mutex that is never held across an `.await`.
//! Background tasks (stream readers, the socket reader, heartbeat callbacks)
//! hold a `Weak` reference and tag their work with the epoch they were
//! started under, so work belonging to a torn-down session or a superseded
//! request is dropped on the floor.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use agent_link_core::{
    ChannelState, ChatBackend, ChatEvent, ClientConfig, EventBus, Fragment, GENERIC_ERROR_TEXT,
    Message, Reassembler, SocketConnector, Transport, TransportError, generate_id,
    traits::{RemoteConfig, SessionSummary, SocketEvent, StreamRequest},
};
use agent_link_transport::{
    Channel, ChannelReceiver, ChannelRole, ChatFrame, Endpoints, InboundChatFrame, StreamEvent,
};
use futures::{StreamExt, stream::BoxStream};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{error::ChatError, history, socket::ChatSocket};

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPhase {
    #[default]
    Uninitialized,
    Authenticating,
    /// Session ready, nothing in flight.
    Idle,
    /// A streaming request is outstanding.
    Streaming,
    /// Messages flow over the socket.
    Socket,
    /// The socket was lost; the next send uses the streaming endpoint.
    Degraded,
    Closed,
}

/// The one live conversation.
struct Session {
    session_id: Option<String>,
    request_id: Option<String>,
    messages: Vec<Message>,
    transport: Transport,
    channel_state: ChannelState,
    reassembler: Reassembler,
    /// Epoch of the current streaming exchange.
    exchange: u64,
    pending: Option<CancellationToken>,
    socket: Option<(u64, ChatSocket)>,
    ever_connected: bool,
}

impl Session {
    fn new(session_id: Option<String>, messages: Vec<Message>) -> Self {
        Self {
            session_id,
            request_id: None,
            messages,
            transport: Transport::Stream,
            channel_state: ChannelState::NeverConnected,
            reassembler: Reassembler::new(),
            exchange: 0,
            pending: None,
            socket: None,
            ever_connected: false,
        }
    }

    fn is_current(&self, exchange: u64) -> bool {
        self.exchange == exchange && self.pending.is_some()
    }

    fn socket_is(&self, epoch: u64) -> bool {
        matches!(&self.socket, Some((current, _)) if *current == epoch)
    }

    fn live_socket(&self) -> Option<&ChatSocket> {
        match &self.socket {
            Some((_, socket)) if self.transport == Transport::Socket && socket.is_live() => {
                Some(socket)
            }
            _ => None,
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }

    fn teardown(&mut self) {
        self.cancel_pending();
        if let Some((_, socket)) = self.socket.take() {
            socket.close("session closed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[derive(Default)]
struct State {
    phase: ChatPhase,
    auth: Option<RemoteConfig>,
    session: Option<Session>,
    epoch: u64,
}

impl State {
    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }
}

struct Inner {
    config: ClientConfig,
    endpoints: Endpoints,
    backend: Arc<dyn ChatBackend>,
    connector: Arc<dyn SocketConnector>,
    events: EventBus<ChatEvent>,
    state: Mutex<State>,
}

/// Outcome of reading one streaming event.
enum StreamFlow {
    Continue,
    Finished(Option<String>),
    Upgrade,
}

/// Outcome of moving an exchange onto the socket.
enum Upgrade {
    Connected(Option<String>),
    /// The socket worked before; keep reading the stream.
    Transient,
    Failed(ChatError),
}

/// Chat session controller. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ChatController {
    inner: Arc<Inner>,
}

impl ChatController {
    /// # Errors
    /// Returns [`ChatError::Initialization`] if the API base is invalid.
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<Self, ChatError> {
        let endpoints = Endpoints::new(&config.api_base)
            .map_err(|e| ChatError::Initialization(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                endpoints,
                backend,
                connector,
                events: EventBus::new(),
                state: Mutex::new(State::default()),
            }),
        })
    }

    /// Start a session, tearing down the current one first.
    ///
    /// Authenticates once per controller and reuses the result afterwards.
    /// With a `session_id` the stored history is loaded before returning.
    ///
    /// # Errors
    /// Returns error if authentication or the history fetch fails, or
    /// [`ChatError::Cancelled`] if another `start_chat` or `end_chat`
    /// happened meanwhile.
    pub async fn start_chat(&self, session_id: Option<String>) -> Result<(), ChatError> {
        let inner = &self.inner;
        let epoch = {
            let mut state = inner.state();
            if let Some(mut old) = state.session.take() {
                tracing::info!(session_id = ?old.session_id, "tearing down previous chat session");
                old.teardown();
            }
            state.phase = if state.auth.is_some() {
                ChatPhase::Idle
            } else {
                ChatPhase::Authenticating
            };
            state.next_epoch()
        };

        let auth = inner.authenticate(epoch).await?;
        let messages = match &session_id {
            Some(id) => {
                let credential = inner.credential_from(Some(&auth));
                let records = inner
                    .backend
                    .fetch_history(id, credential.as_deref())
                    .await
                    .map_err(|e| {
                        tracing::error!(session_id = %id, "history fetch failed: {e}");
                        ChatError::from(e)
                    })?;
                history::to_messages(records)
            }
            None => Vec::new(),
        };

        let mut state = inner.state();
        if state.epoch != epoch {
            return Err(ChatError::Cancelled);
        }
        let session = state.session.insert(Session::new(session_id.clone(), messages));
        if let Some(id) = session_id {
            tracing::info!(session_id = %id, history = session.messages.len(), "chat session started");
            inner.events.emit(ChatEvent::SessionIdChanged { session_id: id });
        } else {
            tracing::info!("chat session started");
        }
        for index in 0..session.messages.len() {
            inner.emit_message(session, index, true);
        }
        state.phase = ChatPhase::Idle;
        Ok(())
    }

    /// Send a user message.
    ///
    /// Over a live socket this returns as soon as the frame is queued; the
    /// reply arrives as message events. Otherwise it opens a streaming
    /// request and resolves once that exchange is complete, or once the
    /// backend has moved it onto the socket.
    ///
    /// Returns the session id known at completion.
    ///
    /// # Errors
    /// Returns [`ChatError::NoSession`] before `start_chat`, the transport or
    /// backend failure that ended the exchange, or [`ChatError::Cancelled`]
    /// if a newer send superseded this one.
    pub async fn send_message(
        &self,
        text: &str,
        html: Option<&str>,
    ) -> Result<Option<String>, ChatError> {
        let inner = &self.inner;
        let (exchange, cancel, request) = {
            let mut state = inner.state();
            let credential = inner.credential_from(state.auth.as_ref());
            let exchange = state.next_epoch();
            let State { phase, session, .. } = &mut *state;
            let Some(session) = session.as_mut() else {
                return Err(ChatError::NoSession);
            };

            inner.finish_open_tail(session);
            inner.push_message(session, Message::user(text, html.map(str::to_string)));
            session.reassembler.reset();

            if let Some(socket) = session.live_socket().cloned() {
                let frame = ChatFrame::message(generate_id(), text, html);
                match socket.send_tracked(frame) {
                    Ok(()) => return Ok(session.session_id.clone()),
                    Err(e) => {
                        tracing::warn!("socket send failed, falling back to stream: {e}");
                        socket.close("send failed");
                        session.socket = None;
                        session.transport = Transport::Stream;
                        session.channel_state = ChannelState::Degraded;
                        inner.events.emit(ChatEvent::TransportChanged {
                            transport: Transport::Stream,
                        });
                    }
                }
            }

            session.cancel_pending();
            inner.push_message(session, Message::placeholder());
            let cancel = CancellationToken::new();
            session.pending = Some(cancel.clone());
            session.exchange = exchange;
            *phase = ChatPhase::Streaming;

            let request = StreamRequest {
                session_id: session.session_id.clone(),
                request_id: session.request_id.clone(),
                message: text.to_string(),
                html: html.map(str::to_string),
                credential,
            };
            (exchange, cancel, request)
        };

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(run_exchange(
            Arc::downgrade(inner),
            exchange,
            cancel,
            request,
            done_tx,
        ));
        done_rx.await.unwrap_or(Err(ChatError::Cancelled))
    }

    /// Previous sessions of `external_id`, or of the configured identity.
    ///
    /// # Errors
    /// Returns error if no identity is known or the lookup fails.
    pub async fn previous_sessions(
        &self,
        external_id: Option<&str>,
    ) -> Result<Vec<SessionSummary>, ChatError> {
        let inner = &self.inner;
        let external_id = external_id
            .map(str::to_string)
            .or_else(|| inner.config.external_id.clone())
            .ok_or_else(|| ChatError::Initialization("no external id configured".into()))?;
        let credential = {
            let state = inner.state();
            inner.credential_from(state.auth.as_ref())
        };
        Ok(inner
            .backend
            .list_sessions(&external_id, credential.as_deref())
            .await?)
    }

    /// End the session: tell the socket, cancel everything, forget the auth.
    pub fn end_chat(&self) {
        let mut state = self.inner.state();
        state.next_epoch();
        if let Some(mut session) = state.session.take() {
            let open_socket = session
                .socket
                .as_ref()
                .map(|(_, socket)| socket)
                .filter(|socket| socket.channel().is_open());
            if let Some(socket) = open_socket {
                if let Err(e) = socket.send(&ChatFrame::end(generate_id())) {
                    tracing::debug!("could not send end frame: {e}");
                }
            }
            session.teardown();
            tracing::info!(session_id = ?session.session_id, "chat session ended");
        }
        state.auth = None;
        state.phase = ChatPhase::Closed;
    }

    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.inner
            .state()
            .session
            .as_ref()
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner
            .state()
            .session
            .as_ref()
            .and_then(|s| s.session_id.clone())
    }

    #[must_use]
    pub fn transport(&self) -> Transport {
        self.inner
            .state()
            .session
            .as_ref()
            .map_or(Transport::Stream, |s| s.transport)
    }

    #[must_use]
    pub fn phase(&self) -> ChatPhase {
        self.inner.state().phase
    }

    #[must_use]
    pub fn channel_state(&self) -> ChannelState {
        self.inner
            .state()
            .session
            .as_ref()
            .map_or(ChannelState::NeverConnected, |s| s.channel_state)
    }

    /// The open chat socket, if any.
    #[must_use]
    pub fn socket(&self) -> Option<ChatSocket> {
        self.inner
            .state()
            .session
            .as_ref()
            .and_then(|s| s.socket.as_ref().map(|(_, socket)| socket.clone()))
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> BoxStream<'static, ChatEvent> {
        self.inner.events.stream()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn credential_from(&self, auth: Option<&RemoteConfig>) -> Option<String> {
        auth.and_then(|a| a.token.clone())
            .or_else(|| self.config.credential.clone())
    }

    async fn authenticate(&self, epoch: u64) -> Result<RemoteConfig, ChatError> {
        let cached = self.state().auth.clone();
        if let Some(auth) = cached {
            return Ok(auth);
        }
        tracing::info!("authenticating");
        let result = self.backend.fetch_config().await;

        let mut state = self.state();
        if state.epoch != epoch {
            return Err(ChatError::Cancelled);
        }
        match result {
            Ok(auth) => {
                state.auth = Some(auth.clone());
                state.phase = ChatPhase::Idle;
                Ok(auth)
            }
            Err(e) => {
                tracing::error!("authentication failed: {e}");
                state.phase = ChatPhase::Uninitialized;
                Err(e.into())
            }
        }
    }

    fn emit_message(&self, session: &Session, index: usize, added: bool) {
        let message = session.messages[index].clone();
        self.events.emit(if added {
            ChatEvent::MessageAdded { index, message }
        } else {
            ChatEvent::MessageUpdated { index, message }
        });
    }

    fn push_message(&self, session: &mut Session, message: Message) {
        session.messages.push(message);
        self.emit_message(session, session.messages.len() - 1, true);
    }

    fn finish_open_tail(&self, session: &mut Session) {
        let Some(index) = session.messages.len().checked_sub(1) else {
            return;
        };
        if session.messages[index].is_open() {
            session.messages[index].finish();
            self.emit_message(session, index, false);
        }
    }

    fn fail_open_tail(&self, session: &mut Session) {
        let Some(index) = session.messages.len().checked_sub(1) else {
            return;
        };
        if session.messages[index].is_open() {
            session.messages[index].fail(GENERIC_ERROR_TEXT);
            self.emit_message(session, index, false);
        }
    }

    fn apply_fragment(&self, session: &mut Session, fragment: Fragment) -> Result<bool, String> {
        let failure = match &fragment {
            Fragment::Error { reason } => Some(reason.clone()),
            Fragment::Content(_) => None,
        };
        let applied = session.reassembler.apply(&mut session.messages, fragment);
        self.emit_message(session, applied.index, applied.added);
        match failure {
            Some(reason) => Err(reason),
            None => Ok(applied.terminal),
        }
    }

    fn on_stream_event(&self, exchange: u64, event: StreamEvent) -> Result<StreamFlow, ChatError> {
        let mut state = self.state();
        let session = state
            .session
            .as_mut()
            .filter(|s| s.is_current(exchange))
            .ok_or(ChatError::Cancelled)?;

        match event {
            StreamEvent::Connected {
                session_id,
                request_id,
            } => {
                if let Some(id) = session_id.filter(|id| session.session_id.as_ref() != Some(id)) {
                    tracing::info!(session_id = %id, "session id assigned");
                    session.session_id = Some(id.clone());
                    self.events.emit(ChatEvent::SessionIdChanged { session_id: id });
                }
                if request_id.is_some() {
                    session.request_id = request_id;
                }
                Ok(StreamFlow::Continue)
            }
            StreamEvent::UpgradeToWebsocket { request_id } => {
                tracing::info!("backend requested socket upgrade");
                if request_id.is_some() {
                    session.request_id = request_id;
                }
                Ok(StreamFlow::Upgrade)
            }
            StreamEvent::Fragment(fragment) => match self.apply_fragment(session, fragment) {
                Ok(false) => Ok(StreamFlow::Continue),
                Ok(true) => Ok(StreamFlow::Finished(session.session_id.clone())),
                Err(reason) => {
                    tracing::error!(%reason, "backend reported an error");
                    Err(ChatError::Backend(reason))
                }
            },
        }
    }

    /// The stream ended without a terminal event.
    fn finish_exchange(&self, exchange: u64) -> Result<Option<String>, ChatError> {
        let mut state = self.state();
        let session = state
            .session
            .as_mut()
            .filter(|s| s.is_current(exchange))
            .ok_or(ChatError::Cancelled)?;
        self.finish_open_tail(session);
        Ok(session.session_id.clone())
    }

    /// Fail the exchange's tail message and convert the error.
    fn fail_exchange(&self, exchange: u64, error: TransportError) -> ChatError {
        tracing::error!("chat exchange failed: {error}");
        let mut state = self.state();
        if let Some(session) = state.session.as_mut().filter(|s| s.is_current(exchange)) {
            let _ = self.apply_fragment(session, Fragment::Error {
                reason: error.to_string(),
            });
        }
        error.into()
    }

    fn end_exchange(&self, exchange: u64) {
        let mut state = self.state();
        let State { phase, session, .. } = &mut *state;
        let Some(session) = session.as_mut().filter(|s| s.exchange == exchange) else {
            return;
        };
        session.pending = None;
        *phase = match (session.transport, session.channel_state) {
            (Transport::Socket, _) => ChatPhase::Socket,
            (Transport::Stream, ChannelState::Degraded) => ChatPhase::Degraded,
            (Transport::Stream, _) => ChatPhase::Idle,
        };
    }

    async fn upgrade_socket(self: &Arc<Self>, exchange: u64) -> Upgrade {
        let (url, ever_connected) = {
            let mut state = self.state();
            let socket_override = state
                .auth
                .as_ref()
                .and_then(|a| a.socket_url.clone())
                .or_else(|| self.config.socket_url.clone());
            let token = self.credential_from(state.auth.as_ref());
            let State { phase, session, .. } = &mut *state;
            let Some(session) = session.as_mut().filter(|s| s.is_current(exchange)) else {
                return Upgrade::Failed(ChatError::Cancelled);
            };

            // Reuse an open socket rather than opening a second one.
            if session.socket.as_ref().is_some_and(|(_, socket)| socket.is_live()) {
                session.transport = Transport::Socket;
                *phase = ChatPhase::Socket;
                self.events.emit(ChatEvent::TransportChanged {
                    transport: Transport::Socket,
                });
                return Upgrade::Connected(session.session_id.clone());
            }

            let url = self.endpoints.socket(
                socket_override.as_deref(),
                session.session_id.as_deref(),
                session.request_id.as_deref(),
                token.as_deref(),
            );
            (url, session.ever_connected)
        };

        let result = match url {
            Ok(url) => {
                Channel::connect(
                    self.connector.as_ref(),
                    url.as_str(),
                    self.config.connect_timeout(),
                    self.config.heartbeat(),
                    ChannelRole::Chat,
                )
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((channel, inbound)) => self.install_socket(exchange, channel, inbound),
            Err(e) if ever_connected => {
                tracing::warn!("socket reconnect failed, staying on stream: {e}");
                Upgrade::Transient
            }
            Err(e) => {
                tracing::error!("socket connect failed: {e}");
                Upgrade::Failed(self.fail_exchange(exchange, e))
            }
        }
    }

    fn install_socket(
        self: &Arc<Self>,
        exchange: u64,
        channel: Channel,
        inbound: ChannelReceiver,
    ) -> Upgrade {
        let mut state = self.state();
        let epoch = state.next_epoch();
        let State { phase, session, .. } = &mut *state;
        let Some(session) = session.as_mut().filter(|s| s.is_current(exchange)) else {
            channel.close();
            return Upgrade::Failed(ChatError::Cancelled);
        };

        let socket = ChatSocket::new(channel, self.config.ack_timeout());
        let weak = Arc::downgrade(self);
        let on_failure = {
            let weak = weak.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_socket_lost(epoch, "heartbeat ack timeout");
                }
            }
        };
        socket.channel().start_heartbeat(
            || ChatFrame::ping(generate_id()).encode().ok(),
            on_failure,
        );
        if let Some((_, old)) = session.socket.replace((epoch, socket.clone())) {
            old.close("replaced");
        }

        session.ever_connected = true;
        session.transport = Transport::Socket;
        session.channel_state = ChannelState::Connected;
        *phase = ChatPhase::Socket;
        tracing::info!(session_id = ?session.session_id, "chat moved to socket");
        self.events.emit(ChatEvent::ChannelStateChanged {
            state: ChannelState::Connected,
        });
        self.events.emit(ChatEvent::TransportChanged {
            transport: Transport::Socket,
        });

        tokio::spawn(read_socket(weak, epoch, socket, inbound));
        Upgrade::Connected(session.session_id.clone())
    }

    fn on_socket_frame(&self, epoch: u64, socket: &ChatSocket, text: &str) {
        let frame = match InboundChatFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("ignoring chat frame: {e}");
                return;
            }
        };
        tracing::debug!(event_id = ?frame.event_id(), "chat frame in");
        socket.channel().ack();
        socket.settle(&frame);

        match frame {
            InboundChatFrame::Ping { event_id } => {
                let pong = ChatFrame::pong(event_id.unwrap_or_else(generate_id));
                if let Err(e) = socket.send(&pong) {
                    tracing::debug!("could not answer ping: {e}");
                }
            }
            InboundChatFrame::Pong { .. } => {}
            InboundChatFrame::Message { fragment, .. } => {
                let mut state = self.state();
                let Some(session) = state.session.as_mut().filter(|s| s.socket_is(epoch)) else {
                    return;
                };
                if let Err(reason) = self.apply_fragment(session, fragment) {
                    tracing::error!(%reason, "backend reported an error over the socket");
                }
            }
            InboundChatFrame::Typing { .. } => self.events.emit(ChatEvent::TypingOn),
            InboundChatFrame::TypingOff { .. } => self.events.emit(ChatEvent::TypingOff),
            InboundChatFrame::End { .. } => {
                let mut state = self.state();
                if let Some(session) = state.session.as_mut().filter(|s| s.socket_is(epoch)) {
                    self.finish_open_tail(session);
                }
                self.events.emit(ChatEvent::TypingOff);
            }
        }
    }

    /// Drop the socket and fall back to streaming.
    fn on_socket_lost(&self, epoch: u64, reason: &str) {
        let mut state = self.state();
        let State { phase, session, .. } = &mut *state;
        let Some(session) = session.as_mut().filter(|s| s.socket_is(epoch)) else {
            return;
        };
        if let Some((_, socket)) = session.socket.take() {
            socket.close(reason);
        }
        tracing::info!(reason, "chat socket lost, falling back to stream");

        let was_socket = session.transport == Transport::Socket;
        session.transport = Transport::Stream;
        session.channel_state = ChannelState::Degraded;
        if session.pending.is_none() {
            *phase = ChatPhase::Degraded;
            // The reply that was arriving over the socket will never complete.
            self.fail_open_tail(session);
        }
        self.events.emit(ChatEvent::ChannelStateChanged {
            state: ChannelState::Degraded,
        });
        if was_socket {
            self.events.emit(ChatEvent::TransportChanged {
                transport: Transport::Stream,
            });
        }
    }
}

async fn run_exchange(
    weak: Weak<Inner>,
    exchange: u64,
    cancel: CancellationToken,
    request: StreamRequest,
    done: oneshot::Sender<Result<Option<String>, ChatError>>,
) {
    let result = tokio::select! {
        () = cancel.cancelled() => Err(ChatError::Cancelled),
        result = drive_exchange(&weak, exchange, request) => result,
    };
    if let Some(inner) = weak.upgrade() {
        inner.end_exchange(exchange);
    }
    let _ = done.send(result);
}

async fn drive_exchange(
    weak: &Weak<Inner>,
    exchange: u64,
    request: StreamRequest,
) -> Result<Option<String>, ChatError> {
    let backend = weak
        .upgrade()
        .map(|inner| Arc::clone(&inner.backend))
        .ok_or(ChatError::Cancelled)?;

    let mut stream = match backend.open_stream(request).await {
        Ok(stream) => stream,
        Err(e) => {
            let inner = weak.upgrade().ok_or(ChatError::Cancelled)?;
            return Err(inner.fail_exchange(exchange, e));
        }
    };

    while let Some(item) = stream.next().await {
        let inner = weak.upgrade().ok_or(ChatError::Cancelled)?;
        let raw = match item {
            Ok(raw) => raw,
            Err(e) => return Err(inner.fail_exchange(exchange, e)),
        };
        let event = match StreamEvent::decode(&raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("ignoring stream event: {e}");
                continue;
            }
        };
        match inner.on_stream_event(exchange, event)? {
            StreamFlow::Continue => {}
            StreamFlow::Finished(session_id) => return Ok(session_id),
            StreamFlow::Upgrade => match inner.upgrade_socket(exchange).await {
                Upgrade::Connected(session_id) => return Ok(session_id),
                Upgrade::Transient => {}
                Upgrade::Failed(e) => return Err(e),
            },
        }
    }

    weak.upgrade()
        .ok_or(ChatError::Cancelled)?
        .finish_exchange(exchange)
}

async fn read_socket(weak: Weak<Inner>, epoch: u64, socket: ChatSocket, mut inbound: ChannelReceiver) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            SocketEvent::Text(text) => inner.on_socket_frame(epoch, &socket, &text),
            SocketEvent::Closed { code, reason } => {
                tracing::debug!(?code, %reason, "chat socket closed");
                inner.on_socket_lost(epoch, "socket closed");
                return;
            }
        }
    }
    if let Some(inner) = weak.upgrade() {
        inner.on_socket_lost(epoch, "socket dropped");
    }
}
