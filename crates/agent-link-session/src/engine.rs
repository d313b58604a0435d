//! Session engine.
//!
//! Keeps one logical session alive across physical connections: opens the
//! transport, performs the handshake, filters replayed messages, persists the
//! replay cursor, reconnects with backoff and publishes everything on a single
//! ordered event stream.
//!
//! All mutable state lives behind one async mutex. Work that outlives a call
//! (receive loops, heartbeats, timers) is tagged with the epoch it was started
//! for and drops out silently once that epoch is superseded.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use agent_link_core::{
    Attachment, Connection, ConnectionStatus, Connector, CursorStore, EngineConfig, ErrorClass,
    ErrorCode, FrameReceiver, MessageId, PermissionChoice, PermissionMode, SessionIdentity,
    StreamEvent,
};
use agent_link_transport::{
    ClientMessage, ControlMessage, ServerMessage, StreamMessage, decode, encode,
    normalize_endpoint,
    protocol::{SUPPORTED_PROTOCOL_VERSION, decode_history},
};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{EpochHandle, LossOutcome},
    error::EngineError,
    state::{Admission, EngineState},
};

/// Ordered stream of engine events.
pub type EventStream = UnboundedReceiverStream<StreamEvent>;

/// Work deferred by a timer.
enum Scheduled {
    Reconnect,
    Resend(ClientMessage),
}

struct Inner<C, S> {
    connector: C,
    store: S,
    config: EngineConfig,
    state: Mutex<EngineState>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

/// Client engine for one logical agent session.
///
/// Cheap to clone; clones share the same session.
pub struct SessionEngine<C, S>
where
    C: Connector,
    S: CursorStore,
{
    inner: Arc<Inner<C, S>>,
}

impl<C, S> Clone for SessionEngine<C, S>
where
    C: Connector,
    S: CursorStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, S> SessionEngine<C, S>
where
    C: Connector,
    S: CursorStore,
{
    /// Create an engine and the stream its events are delivered on.
    ///
    /// Out-of-range settings are logged and clamped: a zero heartbeat
    /// interval disables the heartbeat and a zero dedup capacity keeps one id.
    #[must_use]
    pub fn new(connector: C, store: S, config: EngineConfig) -> (Self, EventStream) {
        if let Err(e) = config.validate() {
            tracing::warn!("Engine config: {e}");
        }
        let (events, rx) = mpsc::unbounded_channel();
        let state = EngineState::new(&config);
        let engine = Self {
            inner: Arc::new(Inner {
                connector,
                store,
                config,
                state: Mutex::new(state),
                events,
            }),
        };
        (engine, UnboundedReceiverStream::new(rx))
    }

    /// Open a connection and start or resume a session.
    ///
    /// With a `session_id` the persisted cursor of that session is restored
    /// and offered to the server so it can replay what was missed.
    ///
    /// # Errors
    /// Returns [`EngineError::AlreadyActive`] unless disconnected,
    /// [`EngineError::NetworkUnavailable`] while offline, and
    /// [`EngineError::InvalidEndpoint`] or [`EngineError::Transport`] when
    /// the connection cannot be opened.
    pub async fn connect(
        &self,
        endpoint: &str,
        session_id: Option<String>,
        model: Option<String>,
    ) -> Result<(), EngineError> {
        let endpoint = normalize_endpoint(endpoint)?;
        let handle = {
            let mut state = self.inner.state.lock().await;
            let handle = state.machine.begin_connect()?;

            if session_id.is_none() || session_id != state.identity.session_id {
                state.identity.clear();
                state.reset_session_scope();
                state.identity.session_id.clone_from(&session_id);
            }
            if let Some(id) = session_id.as_deref().filter(|_| state.cursor.is_none()) {
                state.cursor = self.inner.load_cursor(id).await;
            }
            state.endpoint = Some(endpoint);
            state.model = model.or_else(|| self.inner.config.default_model.clone());

            tracing::info!(
                session_id = ?state.identity.session_id,
                cursor = ?state.cursor,
                epoch = %handle.epoch,
                "Connecting"
            );
            self.inner.flush_status(&mut state);
            handle
        };
        self.inner.open(handle, false).await
    }

    /// Close the connection. No automatic reconnection follows.
    ///
    /// With `preserve_session` the session id and cursor are kept so a later
    /// [`connect`](Self::connect) can resume; otherwise both are forgotten,
    /// including the persisted cursor.
    pub async fn disconnect(&self, preserve_session: bool) {
        let mut state = self.inner.state.lock().await;
        let transport = state.machine.shutdown(true);
        state.identity.invalidate_agent();
        if !preserve_session {
            if let Some(session_id) = state.identity.session_id.take() {
                self.inner.clear_cursor(&session_id).await;
            }
            state.identity.clear();
            state.reset_session_scope();
        }
        self.inner.flush_status(&mut state);
        drop(state);

        if let Some(mut transport) = transport {
            transport.close().await;
        }
        tracing::info!(preserve_session, "Disconnected");
    }

    /// Recover right away: cancels any scheduled attempt, resets the attempt
    /// counter and opens a new connection. A failure falls back to normal
    /// backoff. Returns whether an attempt was started.
    pub async fn reconnect_now(&self) -> bool {
        let handle = {
            let mut state = self.inner.state.lock().await;
            if !state.can_recover() {
                tracing::debug!(status = ?state.machine.status(), "Reconnect not possible");
                return false;
            }
            let handle = state.machine.begin_recovery();
            tracing::info!(epoch = %handle.epoch, "Reconnecting now");
            self.inner.flush_status(&mut state);
            handle
        };
        let _ = self.inner.open(handle, true).await;
        true
    }

    /// Close the transport but keep the session for a later
    /// [`reconnect_now`](Self::reconnect_now). Used when the host app goes to
    /// the background.
    pub async fn suspend(&self) {
        let mut state = self.inner.state.lock().await;
        let transport = state.machine.shutdown(false);
        state.identity.invalidate_agent();
        self.inner.flush_status(&mut state);
        drop(state);

        if let Some(mut transport) = transport {
            transport.close().await;
        }
        tracing::debug!("Suspended");
    }

    /// Record host connectivity. Going offline abandons a scheduled reconnect.
    pub async fn set_network_available(&self, available: bool) {
        let mut state = self.inner.state.lock().await;
        if state.machine.set_network_available(available) {
            tracing::info!(available, "Network status changed");
            self.inner.emit(StreamEvent::NetworkStatusChanged { available });
        }
        self.inner.flush_status(&mut state);
    }

    /// Low-power mode suppresses automatic backoff reconnects. Explicit
    /// triggers still work.
    pub async fn set_low_power(&self, on: bool) {
        let mut state = self.inner.state.lock().await;
        state.machine.set_low_power(on);
        self.inner.flush_status(&mut state);
    }

    /// Change the endpoint used by later reconnects.
    ///
    /// # Errors
    /// Returns [`EngineError::EndpointLocked`] unless disconnected, or
    /// [`EngineError::InvalidEndpoint`] if the URL is unusable.
    pub async fn set_endpoint(&self, endpoint: &str) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        if !state.machine.status().is_disconnected() {
            return Err(EngineError::EndpointLocked);
        }
        state.endpoint = Some(normalize_endpoint(endpoint)?);
        Ok(())
    }

    /// Send user input.
    ///
    /// # Errors
    /// Returns [`EngineError::NotConnected`] unless connected, or the
    /// transport error if the send fails.
    pub async fn send_input(
        &self,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
        mode: Option<PermissionMode>,
    ) -> Result<(), EngineError> {
        self.send(ClientMessage::input(text, attachments, mode)).await
    }

    /// Interrupt the current turn.
    ///
    /// # Errors
    /// Returns [`EngineError::NotConnected`] unless connected.
    pub async fn interrupt(&self) -> Result<(), EngineError> {
        self.send(ClientMessage::Interrupt).await
    }

    /// Stop the agent.
    ///
    /// # Errors
    /// Returns [`EngineError::NotConnected`] unless connected.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.send(ClientMessage::Stop).await
    }

    /// Answer a permission request.
    ///
    /// Answering an unknown or already answered request is a no-op, so
    /// repeated calls send at most one response.
    ///
    /// # Errors
    /// Returns [`EngineError::NotConnected`] unless connected. The request
    /// stays answerable if sending fails.
    pub async fn respond_permission(
        &self,
        request_id: &str,
        choice: PermissionChoice,
    ) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        if !state.machine.status().is_connected() {
            return Err(EngineError::NotConnected);
        }
        if !state.permissions.remove(request_id) {
            tracing::debug!(request_id, "Permission request already answered");
            return Ok(());
        }
        let message = ClientMessage::PermissionResponse {
            request_id: request_id.to_string(),
            choice,
        };
        if let Err(e) = self.inner.send_locked(&mut state, message).await {
            state.permissions.insert(request_id.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Answer a question request (question id -> answer).
    ///
    /// Same idempotence as [`respond_permission`](Self::respond_permission).
    ///
    /// # Errors
    /// Returns [`EngineError::NotConnected`] unless connected.
    pub async fn respond_question(
        &self,
        request_id: &str,
        answers: BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        if !state.machine.status().is_connected() {
            return Err(EngineError::NotConnected);
        }
        if !state.questions.remove(request_id) {
            tracing::debug!(request_id, "Question request already answered");
            return Ok(());
        }
        let message = ClientMessage::QuestionResponse {
            request_id: request_id.to_string(),
            answers,
        };
        if let Err(e) = self.inner.send_locked(&mut state, message).await {
            state.questions.insert(request_id.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Switch the model. Also used for later handshakes.
    ///
    /// # Errors
    /// Returns [`EngineError::NotConnected`] unless connected.
    pub async fn set_model(&self, model: impl Into<String>) -> Result<(), EngineError> {
        let model = model.into();
        let mut state = self.inner.state.lock().await;
        self.inner
            .send_locked(
                &mut state,
                ClientMessage::SetModel {
                    model: model.clone(),
                },
            )
            .await?;
        state.model = Some(model);
        Ok(())
    }

    /// Switch the permission mode.
    ///
    /// # Errors
    /// Returns [`EngineError::NotConnected`] unless connected.
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), EngineError> {
        self.send(ClientMessage::SetPermissionMode { mode }).await
    }

    /// Ask the server to redo the turn that produced `message_id`.
    ///
    /// # Errors
    /// Returns [`EngineError::NotConnected`] unless connected.
    pub async fn retry(&self, message_id: MessageId) -> Result<(), EngineError> {
        self.send(ClientMessage::Retry { message_id }).await
    }

    /// Send a keepalive ping.
    ///
    /// # Errors
    /// Returns [`EngineError::NotConnected`] unless connected.
    pub async fn ping(&self) -> Result<(), EngineError> {
        self.send(ClientMessage::Ping).await
    }

    /// Subscribe to the server's session list. Updates arrive as
    /// [`StreamEvent::SessionList`].
    ///
    /// # Errors
    /// Returns [`EngineError::NotConnected`] unless connected.
    pub async fn subscribe_sessions(&self) -> Result<(), EngineError> {
        self.send(ClientMessage::SubscribeSessions).await
    }

    async fn send(&self, message: ClientMessage) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        self.inner.send_locked(&mut state, message).await
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().await.machine.status().clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.state.lock().await.identity.session_id.clone()
    }

    pub async fn agent_id(&self) -> Option<String> {
        self.inner.state.lock().await.identity.agent_id.clone()
    }

    /// Last accepted message id of the current session.
    pub async fn cursor(&self) -> Option<MessageId> {
        self.inner.state.lock().await.cursor.clone()
    }

    /// Whether an automatic reconnect attempt is scheduled.
    pub async fn has_pending_reconnect(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.machine.has_pending()
            && matches!(state.machine.status(), ConnectionStatus::Reconnecting { .. })
    }

    /// Permission requests awaiting an answer, sorted.
    pub async fn pending_permission_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<String> = state.permissions.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Question requests awaiting an answer, sorted.
    pub async fn pending_question_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<String> = state.questions.iter().cloned().collect();
        ids.sort();
        ids
    }
}

impl<C, S> Inner<C, S>
where
    C: Connector,
    S: CursorStore,
{
    fn emit(&self, event: StreamEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Event stream dropped");
        }
    }

    fn flush_status(&self, state: &mut EngineState) {
        for status in state.machine.take_transitions() {
            self.emit(StreamEvent::StatusChanged { status });
        }
    }

    async fn load_cursor(&self, session_id: &str) -> Option<MessageId> {
        match self.store.load(session_id).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(session_id, "Failed to load cursor: {e}");
                None
            }
        }
    }

    async fn persist_cursor(&self, session_id: Option<&String>, cursor: Option<&MessageId>) {
        let (Some(session_id), Some(cursor)) = (session_id, cursor) else {
            return;
        };
        if let Err(e) = self.store.save(session_id, cursor).await {
            tracing::warn!(session_id, %cursor, "Failed to persist cursor: {e}");
        }
    }

    async fn clear_cursor(&self, session_id: &str) {
        if let Err(e) = self.store.clear(session_id).await {
            tracing::warn!(session_id, "Failed to clear cursor: {e}");
        }
    }

    async fn send_locked(
        &self,
        state: &mut EngineState,
        message: ClientMessage,
    ) -> Result<(), EngineError> {
        if !state.machine.status().is_connected() {
            return Err(EngineError::NotConnected);
        }
        let frame = encode(&message)?;
        state.machine.send(frame).await?;
        tracing::debug!(kind = message.kind(), "Sent command");
        if !matches!(message, ClientMessage::Ping) {
            state.last_command = Some(message);
        }
        Ok(())
    }

    /// Open a transport for `handle` and send the handshake.
    ///
    /// The state lock is not held while the transport opens; the epoch is
    /// checked again afterwards. `recovering` attempts feed failures back
    /// into backoff, user connects only report them.
    async fn open(
        self: &Arc<Self>,
        handle: EpochHandle,
        recovering: bool,
    ) -> Result<(), EngineError> {
        let Some(endpoint) = self.state.lock().await.endpoint.clone() else {
            return Err(EngineError::InvalidEndpoint("no endpoint set".into()));
        };

        let opened = self.connector.open(&endpoint).await;

        let mut state = self.state.lock().await;
        if !state.machine.is_current(handle.epoch) {
            tracing::debug!(epoch = %handle.epoch, "Connection superseded while opening");
            if let Ok(mut connection) = opened {
                connection.sender.close().await;
            }
            return Ok(());
        }

        let Connection {
            mut sender,
            receiver,
        } = match opened {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(%endpoint, epoch = %handle.epoch, "Connection failed: {e}");
                self.fail_open(&mut state, recovering);
                return Err(e.into());
            }
        };

        let handshake = encode(&state.handshake(self.config.helper))?;
        if let Err(e) = sender.send_text(handshake).await {
            tracing::warn!(epoch = %handle.epoch, "Handshake failed: {e}");
            sender.close().await;
            self.fail_open(&mut state, recovering);
            return Err(e.into());
        }

        state.machine.attach(sender);
        tracing::debug!(
            %endpoint,
            epoch = %handle.epoch,
            "Transport open, awaiting acknowledgment"
        );
        self.spawn_receiver(handle.clone(), receiver);
        if let Some(interval) = self.config.heartbeat_interval() {
            self.spawn_heartbeat(handle, interval);
        }
        Ok(())
    }

    fn fail_open(self: &Arc<Self>, state: &mut EngineState, recovering: bool) {
        if recovering {
            self.handle_loss(state);
        } else {
            state.machine.on_open_failed();
            self.flush_status(state);
        }
    }

    /// The current epoch's transport is gone. Schedules the next attempt if
    /// the session is eligible.
    fn handle_loss(self: &Arc<Self>, state: &mut EngineState) {
        state.identity.invalidate_agent();
        let has_session = state.identity.session_id.is_some();
        let outcome = state.machine.on_transport_lost(has_session);
        self.flush_status(state);

        match outcome {
            LossOutcome::Reconnect { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis(), "Scheduling reconnect");
                self.emit(StreamEvent::Reconnecting {
                    attempt,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                });
                self.schedule(state, delay, Scheduled::Reconnect);
            }
            LossOutcome::Exhausted { attempts } => {
                tracing::warn!(attempts, "Giving up reconnecting");
                self.emit(StreamEvent::ReconnectFailed { attempts });
            }
            LossOutcome::Idle => {
                tracing::debug!("Not reconnecting");
            }
        }
    }

    fn schedule(self: &Arc<Self>, state: &mut EngineState, delay: Duration, work: Scheduled) {
        let token = CancellationToken::new();
        state.machine.set_pending(token.clone());
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => inner.fire(&token, work).await,
            }
        });
    }

    async fn fire(self: Arc<Self>, token: &CancellationToken, work: Scheduled) {
        let mut state = self.state.lock().await;
        // Replacing or cancelling a pending timer cancels its token, so an
        // uncancelled token is still the current one.
        if token.is_cancelled() {
            return;
        }
        match work {
            Scheduled::Reconnect => {
                if !matches!(state.machine.status(), ConnectionStatus::Reconnecting { .. }) {
                    state.machine.clear_pending();
                    return;
                }
                let handle = state.machine.begin_attempt();
                tracing::info!(
                    attempt = state.machine.attempt(),
                    epoch = %handle.epoch,
                    "Reconnecting"
                );
                self.flush_status(&mut state);
                drop(state);
                let _ = self.open(handle, true).await;
            }
            Scheduled::Resend(message) => {
                state.machine.clear_pending();
                tracing::info!(kind = message.kind(), "Resending rate-limited command");
                if let Err(e) = self.send_locked(&mut state, message).await {
                    tracing::warn!("Failed to resend command: {e}");
                }
                // Resent once; a second throttle is only reported.
                state.last_command = None;
            }
        }
    }

    fn spawn_receiver(self: &Arc<Self>, handle: EpochHandle, receiver: Box<dyn FrameReceiver>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.receive_loop(handle, receiver).await });
    }

    fn spawn_heartbeat(self: &Arc<Self>, handle: EpochHandle, interval: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.heartbeat(handle, interval).await });
    }

    async fn receive_loop(
        self: Arc<Self>,
        handle: EpochHandle,
        mut receiver: Box<dyn FrameReceiver>,
    ) {
        let EpochHandle { epoch, cancel } = handle;
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(%epoch, "Receive loop superseded");
                    return;
                }
                next = receiver.next_frame() => next,
            };

            let mut state = self.state.lock().await;
            if !state.machine.is_current(epoch) {
                tracing::debug!(%epoch, "Dropping frame from stale connection");
                return;
            }

            match next {
                Ok(Some(frame)) => match decode(&frame) {
                    Ok(message) => self.handle_message(&mut state, message).await,
                    Err(e) => tracing::warn!(%epoch, "Dropping undecodable frame: {e}"),
                },
                Ok(None) => {
                    tracing::info!(%epoch, "Connection closed by server");
                    self.handle_loss(&mut state);
                    return;
                }
                Err(e) => {
                    tracing::warn!(%epoch, "Connection lost: {e}");
                    self.handle_loss(&mut state);
                    return;
                }
            }

            if !state.machine.is_current(epoch) {
                return;
            }
        }
    }

    async fn heartbeat(self: Arc<Self>, handle: EpochHandle, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = handle.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let mut state = self.state.lock().await;
            if !state.machine.is_current(handle.epoch) {
                return;
            }
            if !state.machine.status().is_connected() {
                continue;
            }
            if let Err(e) = self.send_locked(&mut state, ClientMessage::Ping).await {
                tracing::debug!(epoch = %handle.epoch, "Heartbeat failed: {e}");
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, state: &mut EngineState, message: ServerMessage) {
        match message {
            ServerMessage::Stream(message) => {
                if let Some(event) = self.accept(state, message, false).await {
                    self.emit(event);
                }
            }
            ServerMessage::Control(control) => self.handle_control(state, control).await,
        }
    }

    /// Run a stream message through the replay filter. Returns its event if
    /// it is new.
    async fn accept(
        &self,
        state: &mut EngineState,
        message: StreamMessage,
        from_history: bool,
    ) -> Option<StreamEvent> {
        match state.admit(&message.id, message.replay || from_history) {
            Admission::Duplicate => {
                tracing::trace!(id = %message.id, "Dropping duplicate message");
                None
            }
            Admission::Accepted { advanced } => {
                if advanced {
                    self.persist_cursor(state.identity.session_id.as_ref(), state.cursor.as_ref())
                        .await;
                }
                state.build_event(message)
            }
        }
    }

    async fn handle_control(self: &Arc<Self>, state: &mut EngineState, control: ControlMessage) {
        match control {
            ControlMessage::Connected {
                agent_id,
                session_id,
                model,
                protocol_version,
            } => {
                self.on_connected(state, agent_id, session_id, model, protocol_version).await;
            }
            ControlMessage::Error {
                code,
                message,
                retry_after_ms,
            } => self.on_error(state, code, message, retry_after_ms).await,
            ControlMessage::Pong => tracing::trace!("Pong"),
            ControlMessage::History { messages, has_more } => {
                let mut events = Vec::new();
                for message in decode_history(messages) {
                    if let Some(event) = self.accept(state, message, true).await {
                        events.push(event);
                    }
                }
                tracing::debug!(accepted = events.len(), has_more, "History batch");
                self.emit(StreamEvent::HistoryBatch { events, has_more });
            }
            ControlMessage::Sessions { sessions } => {
                self.emit(StreamEvent::SessionList { sessions });
            }
        }
    }

    async fn on_connected(
        &self,
        state: &mut EngineState,
        agent_id: String,
        session_id: String,
        model: Option<String>,
        protocol_version: u32,
    ) {
        if protocol_version > SUPPORTED_PROTOCOL_VERSION {
            tracing::warn!(
                protocol_version,
                supported = SUPPORTED_PROTOCOL_VERSION,
                "Server speaks a newer protocol"
            );
        }

        if let Some(previous) = state
            .identity
            .session_id
            .clone()
            .filter(|previous| *previous != session_id)
        {
            tracing::info!(%previous, %session_id, "Server assigned a new session");
            self.clear_cursor(&previous).await;
            state.reset_session_scope();
        }

        state.identity = SessionIdentity {
            session_id: Some(session_id.clone()),
            agent_id: Some(agent_id.clone()),
            protocol_version: Some(protocol_version),
            model: model.clone(),
        };
        let ended_episode = state.machine.on_connected(agent_id.clone());
        self.persist_cursor(state.identity.session_id.as_ref(), state.cursor.as_ref()).await;

        tracing::info!(%session_id, %agent_id, protocol_version, "Connected");
        self.flush_status(state);
        self.emit(StreamEvent::Connected {
            session_id: session_id.clone(),
            agent_id,
            model,
            protocol_version,
        });
        if ended_episode {
            self.emit(StreamEvent::Reconnected { session_id });
        }
    }

    async fn on_error(
        self: &Arc<Self>,
        state: &mut EngineState,
        code: ErrorCode,
        message: String,
        retry_after_ms: Option<u64>,
    ) {
        tracing::warn!(?code, %message, "Server error");
        match code.class() {
            ErrorClass::SessionValidity => {
                if let Some(session_id) = state.identity.session_id.take() {
                    self.clear_cursor(&session_id).await;
                }
                state.identity.clear();
                state.reset_session_scope();
                self.teardown(state, false).await;
                self.emit(StreamEvent::ConnectionError { code, message });
            }
            ErrorClass::Superseded => {
                self.teardown(state, true).await;
                self.emit(StreamEvent::ConnectionReplaced);
            }
            ErrorClass::CursorStale => {
                state.replay_floor = None;
                self.emit(StreamEvent::CursorInvalid {
                    session_id: state.identity.session_id.clone(),
                    cursor: state.cursor.take(),
                });
                if let Some(session_id) = state.identity.session_id.clone() {
                    self.clear_cursor(&session_id).await;
                }
            }
            ErrorClass::Capacity => {
                self.emit(StreamEvent::CapacityError {
                    code,
                    message,
                    retry_after_ms,
                });
                self.on_capacity(state, code, retry_after_ms).await;
            }
            ErrorClass::Other => self.emit(StreamEvent::Error { code, message }),
        }
    }

    async fn on_capacity(
        self: &Arc<Self>,
        state: &mut EngineState,
        code: ErrorCode,
        retry_after_ms: Option<u64>,
    ) {
        let delay =
            retry_after_ms.map_or(self.config.reconnect.base_delay(), Duration::from_millis);
        let connected = state.machine.status().is_connected();
        match code {
            ErrorCode::RateLimited if connected => {
                if let Some(command) = state.last_command.take() {
                    tracing::info!(
                        kind = command.kind(),
                        delay_ms = delay.as_millis(),
                        "Will resend"
                    );
                    self.schedule(state, delay, Scheduled::Resend(command));
                }
            }
            ErrorCode::RateLimited => {
                self.teardown(state, false).await;
                state.machine.defer();
                self.flush_status(state);
                tracing::info!(delay_ms = delay.as_millis(), "Handshake throttled, retrying later");
                self.schedule(state, delay, Scheduled::Reconnect);
            }
            _ if !connected => self.teardown(state, false).await,
            _ => {}
        }
    }

    /// Close the current connection from inside the receive path.
    async fn teardown(&self, state: &mut EngineState, manual: bool) {
        let transport = state.machine.shutdown(manual);
        state.identity.invalidate_agent();
        self.flush_status(state);
        if let Some(mut transport) = transport {
            transport.close().await;
        }
    }
}
