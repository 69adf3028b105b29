//! Session protocol client.
//!
//! Owns one connection task per `connect()` call chain. The task selects over
//! queued outbound messages, inbound transport events, the heartbeat interval
//! and cancellation; between transports it waits out the reconnect delay and
//! opens a new one through the [`Connector`]. Every transition goes through
//! [`ProtocolMachine`], and the returned effects are executed with no lock
//! held while callbacks run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;

use super::base::{
    ConnectionConfig, ProtocolEvent, ProtocolEventCallback, ProtocolState, RealtimeError,
    RealtimeErrorCallback, RealtimeResult,
};
use super::machine::{Effect, ProtocolMachine};
use super::messages::{ClientEvent, ServerEvent, SessionConfig};
use super::transport::{Connector, TransportEvent, TransportLink, WebSocketConnector};

/// How long `finish()` waits for the server to close before disconnecting.
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot returned by [`SessionProtocolClient::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ProtocolState,
    pub session_id: Option<String>,
    pub response_id: Option<String>,
    pub reconnect_attempts: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub dropped_deltas: u64,
    /// Time since the last inbound message; `None` before the first one
    pub last_inbound_age: Option<Duration>,
}

struct ClientInner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    machine: Mutex<ProtocolMachine>,
    /// Outbound queue drained by the connection task
    queue: Mutex<Option<mpsc::UnboundedSender<String>>>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
    event_callback: Mutex<Option<ProtocolEventCallback>>,
    error_callback: Mutex<Option<RealtimeErrorCallback>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    last_inbound: Mutex<Option<Instant>>,
}

/// Client for the realtime session protocol.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct SessionProtocolClient {
    inner: Arc<ClientInner>,
}

impl SessionProtocolClient {
    /// Create a client using the WebSocket transport.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector::new()))
    }

    /// Create a client with a custom transport.
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let machine = ProtocolMachine::new(config.reconnection.clone());
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                machine: Mutex::new(machine),
                queue: Mutex::new(None),
                cancel: Mutex::new(None),
                task: Mutex::new(None),
                event_callback: Mutex::new(None),
                error_callback: Mutex::new(None),
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                last_inbound: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Register the protocol event callback.
    pub fn on_event(&self, callback: ProtocolEventCallback) {
        *self.inner.event_callback.lock() = Some(callback);
    }

    /// Register the error callback.
    pub fn on_error(&self, callback: RealtimeErrorCallback) {
        *self.inner.error_callback.lock() = Some(callback);
    }

    pub fn state(&self) -> ProtocolState {
        self.inner.machine.lock().state()
    }

    /// Whether a transport is open and audio may be sent.
    pub fn is_ready(&self) -> bool {
        self.inner.machine.lock().can_send_audio()
    }

    pub fn get_status(&self) -> ConnectionStatus {
        let (state, session_id, response_id, reconnect_attempts, dropped_deltas) = {
            let machine = self.inner.machine.lock();
            (
                machine.state(),
                machine.session_id().map(str::to_string),
                machine.response_id().map(str::to_string),
                machine.reconnect_attempts(),
                machine.dropped_deltas(),
            )
        };
        ConnectionStatus {
            state,
            session_id,
            response_id,
            reconnect_attempts,
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
            dropped_deltas,
            last_inbound_age: self.inner.last_inbound.lock().map(|t| t.elapsed()),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the connection.
    ///
    /// A no-op when already connecting or connected. The open is bounded by
    /// the configured connect timeout.
    pub async fn connect(&self) -> RealtimeResult<()> {
        if !self.inner.machine.lock().connect() {
            tracing::debug!("connect ignored; connection already exists");
            return Ok(());
        }

        let timeout = self.inner.config.connect_timeout();
        let opened = tokio::time::timeout(timeout, self.inner.connector.connect(&self.inner.config))
            .await
            .unwrap_or_else(|_| {
                Err(RealtimeError::Timeout(format!(
                    "connection not established within {}ms",
                    timeout.as_millis()
                )))
            });
        let link = match opened {
            Ok(link) => link,
            Err(e) => {
                tracing::error!(error = %e, "failed to connect");
                self.inner.machine.lock().connect_failed();
                return Err(e);
            }
        };

        let initial = {
            let mut machine = self.inner.machine.lock();
            if machine.state() != ProtocolState::Connecting {
                // disconnect() raced the open
                return Ok(());
            }
            machine.transport_opened()
        };

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        *self.inner.queue.lock() = Some(queue_tx);
        *self.inner.cancel.lock() = Some(cancel.clone());

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            ConnectionTask::new(inner, link, queue_rx, cancel)
                .run(initial)
                .await;
        });
        if let Some(previous) = self.inner.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Close the connection without reconnecting.
    pub fn disconnect(&self) {
        let effects = self.inner.machine.lock().disconnect();
        self.inner.dispatch(effects);
        if let Some(token) = self.inner.cancel.lock().take() {
            token.cancel();
        }
        self.inner.queue.lock().take();
    }

    /// Ask the server to end the session and wait for it to close.
    ///
    /// Falls back to [`disconnect`](Self::disconnect) after `wait`.
    pub async fn finish(&self, wait: Duration) -> RealtimeResult<()> {
        let effects = self.inner.machine.lock().finish()?;
        self.inner.dispatch(effects);

        let handle = self.inner.task.lock().take();
        if let Some(mut handle) = handle
            && tokio::time::timeout(wait, &mut handle).await.is_err()
        {
            tracing::warn!("server did not close the session in time");
            self.disconnect();
            let _ = handle.await;
        }
        // Drops the queue and token of the finished task
        self.disconnect();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Push (and remember) the session configuration.
    pub fn update_session(&self, config: SessionConfig) -> RealtimeResult<()> {
        let effects = self.inner.machine.lock().update_session(config)?;
        self.inner.dispatch_checked(effects)
    }

    /// Queue one encoded PCM16 frame. Never waits.
    pub fn send_audio_frame(&self, data: &[u8]) -> RealtimeResult<()> {
        if !self.is_ready() {
            return Err(RealtimeError::NotConnected);
        }
        self.inner.enqueue(&ClientEvent::audio_append(data))
    }

    /// Commit the input buffer (manual turn detection).
    pub fn commit(&self) -> RealtimeResult<()> {
        let effects = self.inner.machine.lock().commit()?;
        self.inner.dispatch_checked(effects)
    }

    /// Cancel the in-flight response.
    pub fn cancel_response(&self) -> RealtimeResult<()> {
        let effects = self.inner.machine.lock().cancel_response()?;
        self.inner.dispatch_checked(effects)
    }

    /// Signal locally detected speech; interrupts an active response.
    pub fn local_speech_started(&self) {
        let effects = self.inner.machine.lock().local_speech_started();
        self.inner.dispatch(effects);
    }
}

impl ClientInner {
    fn emit(&self, event: ProtocolEvent) {
        let callback = self.event_callback.lock().clone();
        if let Some(cb) = callback {
            cb(event);
        }
    }

    fn raise(&self, error: RealtimeError) {
        tracing::warn!(error = %error, "realtime error");
        let callback = self.error_callback.lock().clone();
        if let Some(cb) = callback {
            cb(error);
        }
    }

    fn enqueue(&self, event: &ClientEvent) -> RealtimeResult<()> {
        let message = event.to_message()?;
        let queue = self.queue.lock().clone();
        match queue {
            Some(tx) => tx
                .send(message.text)
                .map_err(|_| RealtimeError::NotConnected),
            None => Err(RealtimeError::NotConnected),
        }
    }

    /// Execute effects produced by a local command.
    fn dispatch_checked(&self, effects: Vec<Effect>) -> RealtimeResult<()> {
        let mut result = Ok(());
        for effect in effects {
            match effect {
                Effect::Send(event) => {
                    if let Err(e) = self.enqueue(&event)
                        && result.is_ok()
                    {
                        result = Err(e);
                    }
                }
                other => self.dispatch(vec![other]),
            }
        }
        result
    }

    fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(event) => {
                    if let Err(e) = self.enqueue(&event) {
                        tracing::debug!(event = event.type_name(), error = %e, "dropping outbound event");
                    }
                }
                Effect::Emit(event) => self.emit(event),
                Effect::Error(error) => self.raise(error),
                Effect::CloseTransport => {
                    if let Some(token) = self.cancel.lock().as_ref() {
                        token.cancel();
                    }
                }
                // Owned by the connection task
                Effect::ScheduleReconnect { .. } | Effect::StartHeartbeat | Effect::StopHeartbeat => {}
            }
        }
    }
}

// =============================================================================
// Connection task
// =============================================================================

struct ConnectionTask {
    inner: Arc<ClientInner>,
    link: Option<TransportLink>,
    queue: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    heartbeat: Option<Interval>,
    pending_reconnect: Option<Duration>,
}

impl ConnectionTask {
    fn new(
        inner: Arc<ClientInner>,
        link: TransportLink,
        queue: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            link: Some(link),
            queue,
            cancel,
            heartbeat: None,
            pending_reconnect: None,
        }
    }

    async fn run(mut self, initial: Vec<Effect>) {
        self.apply(initial);

        loop {
            if self.link.is_some() {
                if !self.pump().await {
                    break;
                }
            } else if !self.reconnect().await {
                break;
            }
        }

        self.heartbeat = None;
        self.link = None;
        tracing::debug!("connection task finished");
    }

    /// Serve the open transport until it closes. Returns `false` on cancel.
    async fn pump(&mut self) -> bool {
        let Some(link) = self.link.as_mut() else {
            return true;
        };

        tokio::select! {
            _ = self.cancel.cancelled() => false,

            Some(text) = self.queue.recv() => {
                if link.outbound.send(text).is_ok() {
                    self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                true
            }

            inbound = link.inbound.recv() => {
                match inbound {
                    Some(TransportEvent::Message(text)) => self.handle_text(&text),
                    Some(TransportEvent::Closed { reason }) => self.handle_closed(&reason),
                    None => self.handle_closed("transport dropped"),
                }
                true
            }

            _ = tick(&mut self.heartbeat) => {
                tracing::trace!("heartbeat");
                self.send(&ClientEvent::Ping);
                true
            }
        }
    }

    /// Wait out the scheduled delay and try one reconnect. Returns `false`
    /// when nothing more is scheduled or the task was cancelled.
    async fn reconnect(&mut self) -> bool {
        let Some(delay) = self.pending_reconnect.take() else {
            return false;
        };

        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        if !self.inner.machine.lock().reconnect_due() {
            return false;
        }

        let config = &self.inner.config;
        let timeout = config.connect_timeout();
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            opened = tokio::time::timeout(timeout, self.inner.connector.connect(config)) => opened,
        };

        let effects = match opened {
            Ok(Ok(link)) => {
                tracing::info!("reconnected");
                self.link = Some(link);
                self.inner.machine.lock().transport_opened()
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "reconnect attempt failed");
                self.inner.machine.lock().reconnect_failed(&e)
            }
            Err(_) => {
                let e = RealtimeError::Timeout("reconnect timed out".to_string());
                tracing::warn!(error = %e, "reconnect attempt failed");
                self.inner.machine.lock().reconnect_failed(&e)
            }
        };
        self.apply(effects);
        true
    }

    fn handle_text(&mut self, text: &str) {
        self.inner.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.inner.last_inbound.lock() = Some(Instant::now());

        let event = match ServerEvent::parse(text) {
            Ok((_, event)) => event,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse server event");
                return;
            }
        };
        let effects = self.inner.machine.lock().handle_server_event(event);
        self.apply(effects);
    }

    fn handle_closed(&mut self, reason: &str) {
        tracing::info!(reason, "transport closed");
        self.link = None;
        // Messages queued for the dead transport are stale
        while self.queue.try_recv().is_ok() {}
        let effects = self.inner.machine.lock().transport_closed(reason);
        self.apply(effects);
    }

    fn send(&mut self, event: &ClientEvent) {
        let Some(link) = self.link.as_ref() else {
            tracing::debug!(event = event.type_name(), "no transport; dropping event");
            return;
        };
        match event.to_message() {
            Ok(message) => {
                if link.outbound.send(message.text).is_ok() {
                    self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => self.inner.raise(e),
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(event) => self.send(&event),
                Effect::Emit(event) => self.inner.emit(event),
                Effect::Error(error) => self.inner.raise(error),
                Effect::ScheduleReconnect { delay, .. } => self.pending_reconnect = Some(delay),
                Effect::StartHeartbeat => {
                    self.heartbeat = self.inner.config.heartbeat_interval().map(|period| {
                        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
                    });
                }
                Effect::StopHeartbeat => self.heartbeat = None,
                Effect::CloseTransport => {
                    self.link = None;
                    self.cancel.cancel();
                }
            }
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
