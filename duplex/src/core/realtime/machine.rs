//! Synchronous protocol state machine.
//!
//! The machine consumes transport signals, server events and local commands
//! and returns the ordered [`Effect`]s the connection task must execute. It
//! performs no I/O, so every transition is unit-testable.
//!
//! ```text
//! Disconnected ─connect─► Connecting ─open─► Connected ─session.update─► SessionPending
//!      ▲                                                                      │
//!      │                                                          session.created
//!      │                                                                      ▼
//!      ├──── transport closed (reconnect scheduled) ◄──── ResponseIdle ⇄ ResponseActive
//!      │                                                          │
//!      └──────────────── transport closed ◄──── Closing ◄──finish─┘
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use super::base::{
    InterruptSource, ProtocolEvent, ProtocolState, RealtimeError, RealtimeResult,
    ReconnectionConfig, TranscriptChannel,
};
use super::messages::{ClientEvent, ServerEvent, SessionConfig};

/// Cancelled or superseded response ids remembered for filtering.
const SUPPRESSED_CAPACITY: usize = 32;

/// An action the connection task must carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Serialize and send a client event
    Send(ClientEvent),
    /// Deliver an event to the event callback
    Emit(ProtocolEvent),
    /// Deliver an error to the error callback
    Error(RealtimeError),
    /// Open a new transport after `delay`
    ScheduleReconnect { attempt: u32, delay: Duration },
    StartHeartbeat,
    StopHeartbeat,
    /// Close the current transport without reconnecting
    CloseTransport,
}

/// The session protocol state machine.
#[derive(Debug)]
pub struct ProtocolMachine {
    state: ProtocolState,
    reconnection: ReconnectionConfig,
    session_config: Option<SessionConfig>,
    session_id: Option<String>,
    response_id: Option<String>,
    suppressed: VecDeque<String>,
    attempts: u32,
    intentional: bool,
    exhausted: bool,
    input_transcript: String,
    speech_transcript: String,
    text_output: String,
    dropped_deltas: u64,
}

impl ProtocolMachine {
    pub fn new(reconnection: ReconnectionConfig) -> Self {
        Self {
            state: ProtocolState::Disconnected,
            reconnection,
            session_config: None,
            session_id: None,
            response_id: None,
            suppressed: VecDeque::with_capacity(SUPPRESSED_CAPACITY),
            attempts: 0,
            intentional: false,
            exhausted: false,
            input_transcript: String::new(),
            speech_transcript: String::new(),
            text_output: String::new(),
            dropped_deltas: 0,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    pub fn session_config(&self) -> Option<&SessionConfig> {
        self.session_config.as_ref()
    }

    /// Reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    /// Audio deltas dropped because their response was cancelled or unknown.
    pub fn dropped_deltas(&self) -> u64 {
        self.dropped_deltas
    }

    /// Whether `response_id` was cancelled or superseded.
    pub fn is_suppressed(&self, response_id: &str) -> bool {
        self.suppressed.iter().any(|id| id == response_id)
    }

    /// Whether input audio may be sent.
    pub fn can_send_audio(&self) -> bool {
        self.state.is_connected()
    }

    // -------------------------------------------------------------------------
    // Local commands
    // -------------------------------------------------------------------------

    /// Begin connecting. Returns `false` when a connection already exists or is
    /// in progress.
    pub fn connect(&mut self) -> bool {
        if self.state != ProtocolState::Disconnected {
            return false;
        }
        self.state = ProtocolState::Connecting;
        self.intentional = false;
        self.exhausted = false;
        self.attempts = 0;
        true
    }

    /// The initial open failed; no reconnect is scheduled.
    pub fn connect_failed(&mut self) {
        if self.state == ProtocolState::Connecting {
            self.state = ProtocolState::Disconnected;
        }
    }

    /// Store the configuration and push it when a transport is open.
    pub fn update_session(&mut self, config: SessionConfig) -> RealtimeResult<Vec<Effect>> {
        if self.state == ProtocolState::Closing {
            return Err(RealtimeError::InvalidState(
                "session is closing".to_string(),
            ));
        }
        self.session_config = Some(config.clone());
        if !self.state.is_connected() {
            // Sent when the transport opens
            return Ok(Vec::new());
        }
        if self.state == ProtocolState::Connected {
            self.state = ProtocolState::SessionPending;
        }
        Ok(vec![Effect::Send(ClientEvent::SessionUpdate { session: config })])
    }

    /// Commit buffered input audio (manual turn detection only).
    pub fn commit(&mut self) -> RealtimeResult<Vec<Effect>> {
        if !self.state.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        if self.session_config.as_ref().is_none_or(|c| c.is_server_vad()) {
            return Err(RealtimeError::InvalidState(
                "commit is only valid with manual turn detection".to_string(),
            ));
        }
        Ok(vec![Effect::Send(ClientEvent::InputAudioBufferCommit)])
    }

    /// Cancel the in-flight response.
    pub fn cancel_response(&mut self) -> RealtimeResult<Vec<Effect>> {
        if !self.state.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        if self.state != ProtocolState::ResponseActive {
            return Err(RealtimeError::InvalidState(
                "no active response".to_string(),
            ));
        }
        Ok(self.interrupt(InterruptSource::Client))
    }

    /// Local speech detected while a response may be playing.
    pub fn local_speech_started(&mut self) -> Vec<Effect> {
        if self.state == ProtocolState::ResponseActive {
            self.interrupt(InterruptSource::LocalVad)
        } else {
            Vec::new()
        }
    }

    /// Ask the server to end the session.
    pub fn finish(&mut self) -> RealtimeResult<Vec<Effect>> {
        if !self.state.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        self.state = ProtocolState::Closing;
        self.intentional = true;
        Ok(vec![Effect::Send(ClientEvent::SessionFinish)])
    }

    /// Intentional disconnect; suppresses reconnection.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        self.intentional = true;
        if self.state == ProtocolState::Disconnected {
            return Vec::new();
        }
        self.state = ProtocolState::Disconnected;
        self.clear_session();
        vec![
            Effect::StopHeartbeat,
            Effect::CloseTransport,
            Effect::Emit(ProtocolEvent::Disconnected {
                reason: "client disconnect".to_string(),
            }),
        ]
    }

    // -------------------------------------------------------------------------
    // Transport signals
    // -------------------------------------------------------------------------

    /// A transport opened (initial or reconnect).
    pub fn transport_opened(&mut self) -> Vec<Effect> {
        let reconnected = self.attempts > 0;
        self.state = ProtocolState::Connected;
        self.attempts = 0;
        self.exhausted = false;

        let mut effects = vec![
            Effect::StartHeartbeat,
            Effect::Emit(ProtocolEvent::Connected { reconnected }),
        ];
        if let Some(config) = self.session_config.clone() {
            self.state = ProtocolState::SessionPending;
            effects.push(Effect::Send(ClientEvent::SessionUpdate { session: config }));
        }
        effects
    }

    /// The transport closed or failed.
    pub fn transport_closed(&mut self, reason: &str) -> Vec<Effect> {
        if self.state == ProtocolState::Disconnected {
            return Vec::new();
        }
        let expected = self.intentional || self.state == ProtocolState::Closing;
        self.state = ProtocolState::Disconnected;
        self.clear_session();

        let mut effects = vec![
            Effect::StopHeartbeat,
            Effect::Emit(ProtocolEvent::Disconnected {
                reason: reason.to_string(),
            }),
        ];
        if !expected {
            effects.extend(self.next_reconnect(reason));
        }
        effects
    }

    /// A scheduled reconnect timer fired. Returns `true` when the task should
    /// open a new transport.
    pub fn reconnect_due(&mut self) -> bool {
        if self.state != ProtocolState::Disconnected || self.intentional || self.exhausted {
            return false;
        }
        self.state = ProtocolState::Connecting;
        true
    }

    /// A reconnect attempt failed to open.
    pub fn reconnect_failed(&mut self, error: &RealtimeError) -> Vec<Effect> {
        if self.state == ProtocolState::Connecting {
            self.state = ProtocolState::Disconnected;
        }
        if self.intentional {
            return Vec::new();
        }
        self.next_reconnect(&error.to_string())
    }

    /// Report the loss and either schedule the next attempt or give up.
    ///
    /// Every unexpected loss surfaces as a transient `Transport` error; giving
    /// up adds one terminal error (`MaxRetriesExceeded`, or `ConnectionLost`
    /// when reconnection is disabled).
    fn next_reconnect(&mut self, reason: &str) -> Vec<Effect> {
        if self.exhausted {
            return Vec::new();
        }
        let mut effects = vec![Effect::Error(RealtimeError::Transport(reason.to_string()))];

        if self.reconnection.should_retry(self.attempts) {
            self.attempts = self.attempts.saturating_add(1);
            let delay = self.reconnection.delay(self.attempts);
            tracing::info!(
                attempt = self.attempts,
                max_attempts = self.reconnection.max_attempts,
                delay_ms = delay.as_millis() as u64,
                reason,
                "scheduling reconnect"
            );
            effects.push(Effect::Emit(ProtocolEvent::Reconnecting {
                attempt: self.attempts,
                delay,
            }));
            effects.push(Effect::ScheduleReconnect {
                attempt: self.attempts,
                delay,
            });
            return effects;
        }

        self.exhausted = true;
        if self.reconnection.enabled {
            tracing::warn!(attempts = self.attempts, "reconnection attempts exhausted");
            effects.push(Effect::Error(RealtimeError::MaxRetriesExceeded {
                attempts: self.attempts,
            }));
        } else {
            effects.push(Effect::Error(RealtimeError::ConnectionLost(reason.to_string())));
        }
        effects
    }

    // -------------------------------------------------------------------------
    // Server events
    // -------------------------------------------------------------------------

    /// Apply one inbound server event.
    pub fn handle_server_event(&mut self, event: ServerEvent) -> Vec<Effect> {
        match event {
            ServerEvent::Error { error } => vec![Effect::Error(error.into())],

            ServerEvent::SessionCreated { session } => {
                self.session_id = Some(session.id.clone());
                if matches!(
                    self.state,
                    ProtocolState::Connected | ProtocolState::SessionPending
                ) {
                    self.state = ProtocolState::ResponseIdle;
                }
                vec![Effect::Emit(ProtocolEvent::SessionCreated {
                    session_id: session.id,
                })]
            }

            ServerEvent::SessionUpdated { session } => {
                if let Some(session) = session
                    && self.session_id.is_none()
                {
                    self.session_id = Some(session.id);
                }
                if self.state == ProtocolState::SessionPending {
                    self.state = ProtocolState::ResponseIdle;
                }
                vec![Effect::Emit(ProtocolEvent::SessionUpdated)]
            }

            ServerEvent::SpeechStarted {
                audio_start_ms,
                item_id,
            } => {
                let mut effects = Vec::new();
                if self.state == ProtocolState::ResponseActive {
                    effects.extend(self.interrupt(InterruptSource::ServerVad));
                }
                self.input_transcript.clear();
                effects.push(Effect::Emit(ProtocolEvent::SpeechStarted {
                    audio_start_ms,
                    item_id,
                }));
                effects
            }

            ServerEvent::SpeechStopped {
                audio_end_ms,
                item_id,
            } => vec![Effect::Emit(ProtocolEvent::SpeechStopped {
                audio_end_ms,
                item_id,
            })],

            ServerEvent::InputAudioBufferCommitted { item_id } => {
                vec![Effect::Emit(ProtocolEvent::InputCommitted { item_id })]
            }

            ServerEvent::InputAudioBufferCleared => vec![Effect::Emit(ProtocolEvent::InputCleared)],

            ServerEvent::TranscriptionDelta { delta, .. } => {
                self.input_transcript.push_str(&delta);
                vec![Effect::Emit(ProtocolEvent::Transcript {
                    channel: TranscriptChannel::Input,
                    response_id: None,
                    delta,
                    text: self.input_transcript.clone(),
                    is_final: false,
                })]
            }

            ServerEvent::TranscriptionCompleted { transcript, .. } => {
                self.input_transcript.clear();
                vec![Effect::Emit(ProtocolEvent::Transcript {
                    channel: TranscriptChannel::Input,
                    response_id: None,
                    delta: String::new(),
                    text: transcript,
                    is_final: true,
                })]
            }

            ServerEvent::TranscriptionFailed { error, .. } => {
                self.input_transcript.clear();
                let message = error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "input transcription failed".to_string());
                vec![Effect::Error(RealtimeError::Protocol {
                    code: Some("transcription_failed".to_string()),
                    message,
                })]
            }

            ServerEvent::ResponseCreated { response } => self.response_created(response.id),

            ServerEvent::ResponseDone { response } => {
                if self.response_id.as_deref() != Some(response.id.as_str()) {
                    tracing::debug!(response_id = %response.id, "ignoring done for inactive response");
                    return Vec::new();
                }
                self.response_id = None;
                self.state = ProtocolState::ResponseIdle;
                self.clear_output_text();
                vec![Effect::Emit(ProtocolEvent::ResponseDone {
                    response_id: response.id,
                    status: response.status,
                })]
            }

            ServerEvent::AudioDelta { response_id, delta } => {
                match self.accept(response_id.as_deref()) {
                    Some(id) => vec![Effect::Emit(ProtocolEvent::AudioDelta {
                        response_id: id,
                        delta,
                    })],
                    None => {
                        self.dropped_deltas += 1;
                        tracing::trace!(?response_id, "dropping audio for inactive response");
                        Vec::new()
                    }
                }
            }

            ServerEvent::AudioDone { response_id } => match self.accept(response_id.as_deref()) {
                Some(id) => vec![Effect::Emit(ProtocolEvent::AudioDone { response_id: id })],
                None => Vec::new(),
            },

            ServerEvent::AudioTranscriptDelta { response_id, delta } => {
                let Some(id) = self.accept(response_id.as_deref()) else {
                    return Vec::new();
                };
                self.speech_transcript.push_str(&delta);
                vec![Effect::Emit(ProtocolEvent::Transcript {
                    channel: TranscriptChannel::Speech,
                    response_id: Some(id),
                    delta,
                    text: self.speech_transcript.clone(),
                    is_final: false,
                })]
            }

            ServerEvent::AudioTranscriptDone {
                response_id,
                transcript,
            } => {
                let Some(id) = self.accept(response_id.as_deref()) else {
                    return Vec::new();
                };
                let accumulated = std::mem::take(&mut self.speech_transcript);
                vec![Effect::Emit(ProtocolEvent::Transcript {
                    channel: TranscriptChannel::Speech,
                    response_id: Some(id),
                    delta: String::new(),
                    text: transcript.unwrap_or(accumulated),
                    is_final: true,
                })]
            }

            ServerEvent::TextDelta { response_id, delta } => {
                let Some(id) = self.accept(response_id.as_deref()) else {
                    return Vec::new();
                };
                self.text_output.push_str(&delta);
                vec![Effect::Emit(ProtocolEvent::Transcript {
                    channel: TranscriptChannel::Text,
                    response_id: Some(id),
                    delta,
                    text: self.text_output.clone(),
                    is_final: false,
                })]
            }

            ServerEvent::TextDone { response_id, text } => {
                let Some(id) = self.accept(response_id.as_deref()) else {
                    return Vec::new();
                };
                let accumulated = std::mem::take(&mut self.text_output);
                vec![Effect::Emit(ProtocolEvent::Transcript {
                    channel: TranscriptChannel::Text,
                    response_id: Some(id),
                    delta: String::new(),
                    text: text.unwrap_or(accumulated),
                    is_final: true,
                })]
            }

            ServerEvent::ConversationItemCreated { .. }
            | ServerEvent::OutputItemAdded { .. }
            | ServerEvent::OutputItemDone { .. }
            | ServerEvent::ContentPartAdded { .. }
            | ServerEvent::ContentPartDone { .. }
            | ServerEvent::Unknown => Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn response_created(&mut self, id: String) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(previous) = self.response_id.take() {
            if previous == id {
                self.response_id = Some(previous);
                return effects;
            }
            tracing::warn!(
                previous = %previous,
                next = %id,
                "response created while another is active"
            );
            effects.push(Effect::Error(RealtimeError::protocol(format!(
                "response {id} created while {previous} is active"
            ))));
            self.suppress(previous.clone());
            effects.push(Effect::Emit(ProtocolEvent::ResponseSuperseded {
                response_id: previous,
            }));
        }

        self.clear_output_text();
        self.response_id = Some(id.clone());
        self.state = ProtocolState::ResponseActive;
        effects.push(Effect::Emit(ProtocolEvent::ResponseStarted { response_id: id }));
        effects
    }

    /// Barge-in: cancel, then tell listeners to flush playback.
    fn interrupt(&mut self, source: InterruptSource) -> Vec<Effect> {
        let Some(id) = self.response_id.take() else {
            return Vec::new();
        };
        self.suppress(id.clone());
        self.state = ProtocolState::ResponseIdle;
        self.clear_output_text();
        tracing::debug!(response_id = %id, ?source, "interrupting response");
        vec![
            Effect::Send(ClientEvent::ResponseCancel {
                response_id: Some(id.clone()),
            }),
            Effect::Emit(ProtocolEvent::BargeIn {
                response_id: id,
                source,
            }),
        ]
    }

    /// Resolve the response a streamed event belongs to, or `None` to drop it.
    fn accept(&self, response_id: Option<&str>) -> Option<String> {
        let current = self.response_id.as_deref()?;
        match response_id {
            Some(id) if id == current && !self.is_suppressed(id) => Some(id.to_string()),
            Some(_) => None,
            None => Some(current.to_string()),
        }
    }

    fn suppress(&mut self, id: String) {
        if self.is_suppressed(&id) {
            return;
        }
        if self.suppressed.len() == SUPPRESSED_CAPACITY {
            self.suppressed.pop_front();
        }
        self.suppressed.push_back(id);
    }

    fn clear_output_text(&mut self) {
        self.speech_transcript.clear();
        self.text_output.clear();
    }

    fn clear_session(&mut self) {
        self.session_id = None;
        if let Some(id) = self.response_id.take() {
            self.suppress(id);
        }
        self.input_transcript.clear();
        self.clear_output_text();
    }
}

// =============================================================================
// Tests
// =============================================================================
