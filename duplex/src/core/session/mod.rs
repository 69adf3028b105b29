//! Session coordination.
//!
//! `SessionCoordinator` connects the capture path to the protocol client and
//! the protocol client's events to the playback path:
//!
//! ```text
//! CaptureEncoder ──frame──► submit_frame ──► SessionProtocolClient::send_audio_frame
//!
//! SessionProtocolClient ──ProtocolEvent──► handle_event
//!     AudioDelta ──► base64 ──► PCM decode ──► resample ──► smoother ──► PlaybackScheduler
//!     Transcript ──► TranscriptBuffer ──► on_transcript
//!     BargeIn    ──► PlaybackScheduler::stop + smoother reset ──► on_action(Interrupted)
//! ```
//!
//! It owns the authoritative response filter: audio for a response that was
//! cancelled or superseded never reaches the scheduler. Protocol events arrive
//! from the connection task while local barge-in arrives from the capture
//! thread, so the filter lock is held from the response check until the chunk
//! is scheduled, and cancellation flushes playback under the same lock.

pub mod transcript;

pub use transcript::{TranscriptBuffer, TranscriptEntry, TranscriptUpdate};

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::capture::{AudioFrame, FrameCallback};
use crate::core::codec::{self, LinearResampler, PcmWidth};
use crate::core::context::{EngineContext, EngineStats, EngineStatsSnapshot};
use crate::core::playback::{
    AudioSmoother, PlaybackError, PlaybackScheduler, PlaybackStats, PlaybackStatus,
};
use crate::core::realtime::{
    ConnectionStatus, InterruptSource, ProtocolEvent, RealtimeError, SessionProtocolClient,
};
use crate::errors::{EngineError, EngineResult};

/// Cancelled ids remembered by the response filter.
const CANCELLED_CAPACITY: usize = 32;

/// Coarse conversation actions for a UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionAction {
    ResponseStarted { response_id: String },
    ResponseFinished { response_id: String },
    Interrupted {
        response_id: String,
        source: InterruptSource,
    },
    /// All scheduled audio has played
    PlaybackIdle,
    Reconnecting { attempt: u32 },
    /// The conversation cannot continue
    Failed { error: String },
}

pub type ActionCallback = Arc<dyn Fn(SessionAction) + Send + Sync>;

pub type TranscriptCallback = Arc<dyn Fn(TranscriptUpdate) + Send + Sync>;

/// Snapshot returned by [`SessionCoordinator::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub engine: EngineStatsSnapshot,
    pub playback: PlaybackStats,
    pub playback_status: PlaybackStatus,
    pub connection: ConnectionStatus,
    pub clamped_samples: u64,
}

// =============================================================================
// Response Filter
// =============================================================================

/// Tracks which response may produce audible output.
#[derive(Debug, Default)]
pub struct ResponseFilter {
    current: Option<String>,
    cancelled: VecDeque<String>,
}

impl ResponseFilter {
    pub fn start(&mut self, response_id: &str) {
        self.current = Some(response_id.to_string());
    }

    pub fn cancel(&mut self, response_id: &str) {
        if self.current.as_deref() == Some(response_id) {
            self.current = None;
        }
        if !self.cancelled.iter().any(|id| id == response_id) {
            if self.cancelled.len() == CANCELLED_CAPACITY {
                self.cancelled.pop_front();
            }
            self.cancelled.push_back(response_id.to_string());
        }
    }

    pub fn finish(&mut self, response_id: &str) {
        if self.current.as_deref() == Some(response_id) {
            self.current = None;
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Whether output tagged with `response_id` may be played.
    pub fn accepts(&self, response_id: &str) -> bool {
        self.current.as_deref() == Some(response_id)
            && !self.cancelled.iter().any(|id| id == response_id)
    }
}

// =============================================================================
// Output Path
// =============================================================================

/// Stateful inbound conversion: protocol PCM to smoothed device-rate samples.
struct OutputPath {
    width: PcmWidth,
    resampler: LinearResampler,
    smoother: AudioSmoother,
}

impl OutputPath {
    fn convert(&mut self, delta: &str) -> EngineResult<Vec<f32>> {
        let bytes = codec::decode_base64(delta)?;
        let samples = codec::decode(&bytes, self.width)?;
        let samples = self.resampler.process(&samples);
        Ok(self.smoother.smooth(samples))
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.smoother.reset();
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct SessionCoordinator {
    context: EngineContext,
    client: SessionProtocolClient,
    scheduler: Arc<PlaybackScheduler>,
    output: Mutex<OutputPath>,
    filter: Mutex<ResponseFilter>,
    transcripts: Mutex<TranscriptBuffer>,
    transcript_callback: Mutex<Option<TranscriptCallback>>,
    action_callback: Mutex<Option<ActionCallback>>,
}

impl SessionCoordinator {
    /// Build a coordinator and register it with the client and scheduler.
    pub fn new(
        context: EngineContext,
        client: SessionProtocolClient,
        scheduler: Arc<PlaybackScheduler>,
    ) -> EngineResult<Arc<Self>> {
        let playback = &context.config.playback;
        let resampler = LinearResampler::new(playback.sample_rate, scheduler.sample_rate())?;
        let smoother = AudioSmoother::new(scheduler.sample_rate(), playback.crossfade_ms)
            .with_dc_removal(playback.dc_removal);
        scheduler.set_volume(playback.volume);

        tracing::debug!(
            protocol_rate = playback.sample_rate,
            device_rate = scheduler.sample_rate(),
            width = playback.width.as_str(),
            "session output path configured"
        );

        let coordinator = Arc::new(Self {
            output: Mutex::new(OutputPath {
                width: playback.width,
                resampler,
                smoother,
            }),
            context,
            client,
            scheduler,
            filter: Mutex::new(ResponseFilter::default()),
            transcripts: Mutex::new(TranscriptBuffer::new()),
            transcript_callback: Mutex::new(None),
            action_callback: Mutex::new(None),
        });
        coordinator.attach();
        Ok(coordinator)
    }

    fn attach(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.client.on_event(Arc::new(move |event| {
            if let Some(this) = weak.upgrade() {
                this.handle_event(event);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        self.client.on_error(Arc::new(move |error| {
            if let Some(this) = weak.upgrade() {
                this.handle_error(error);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        self.scheduler.on_ended(Arc::new(move || {
            if let Some(this) = weak.upgrade() {
                this.emit_action(SessionAction::PlaybackIdle);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        self.scheduler.on_error(Arc::new(move |error| {
            if let Some(this) = weak.upgrade() {
                this.handle_playback_error(error);
            }
        }));
    }

    pub fn client(&self) -> &SessionProtocolClient {
        &self.client
    }

    pub fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.scheduler
    }

    pub fn on_transcript(&self, callback: TranscriptCallback) {
        *self.transcript_callback.lock() = Some(callback);
    }

    pub fn on_action(&self, callback: ActionCallback) {
        *self.action_callback.lock() = Some(callback);
    }

    /// Push the configured session and open the connection.
    pub async fn start(&self) -> EngineResult<()> {
        self.client.update_session(self.context.config.session_config())?;
        self.client.connect().await?;
        Ok(())
    }

    /// End the session gracefully and silence playback.
    pub async fn finish(&self) -> EngineResult<()> {
        let result = match self.client.finish(crate::core::realtime::FINISH_TIMEOUT).await {
            Ok(()) | Err(RealtimeError::NotConnected) => Ok(()),
            Err(e) => Err(EngineError::from(e)),
        };
        self.client.disconnect();
        self.stop_playback();
        result
    }

    // -------------------------------------------------------------------------
    // Capture side
    // -------------------------------------------------------------------------

    /// Frame callback for [`CaptureEncoder::start`](crate::core::capture::CaptureEncoder::start).
    pub fn frame_callback(self: &Arc<Self>) -> FrameCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |frame| {
            if let Some(this) = weak.upgrade() {
                this.submit_frame(frame);
            }
        })
    }

    /// Forward one capture frame; never waits.
    pub fn submit_frame(&self, frame: AudioFrame) {
        let capture = &self.context.config.capture;
        if capture.local_barge_in
            && frame.rms >= capture.barge_in_threshold
            && self.scheduler.get_status().is_playing
        {
            tracing::debug!(rms = frame.rms, "local speech over playback");
            self.client.local_speech_started();
        }

        match self.client.send_audio_frame(&frame.data) {
            Ok(()) => EngineStats::incr(&self.context.stats.frames_sent),
            Err(e) => {
                tracing::trace!(seq = frame.seq, error = %e, "dropping capture frame");
                EngineStats::incr(&self.context.stats.frames_dropped);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Protocol side
    // -------------------------------------------------------------------------

    /// Apply one protocol event.
    pub fn handle_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::ResponseStarted { response_id } => {
                {
                    let mut filter = self.filter.lock();
                    filter.start(&response_id);
                    // A new turn never crossfades against the last one
                    self.output.lock().reset();
                }
                self.transcripts.lock().clear_assistant();
                self.emit_action(SessionAction::ResponseStarted { response_id });
            }

            ProtocolEvent::AudioDelta { response_id, delta } => {
                self.play_delta(&response_id, &delta);
            }

            ProtocolEvent::AudioDone { response_id } => {
                tracing::debug!(%response_id, "response audio complete");
            }

            ProtocolEvent::ResponseDone {
                response_id,
                status,
            } => {
                tracing::debug!(%response_id, ?status, "response done");
                self.filter.lock().finish(&response_id);
                self.emit_action(SessionAction::ResponseFinished { response_id });
            }

            ProtocolEvent::ResponseSuperseded { response_id } => {
                self.cancel_response(&response_id);
            }

            ProtocolEvent::BargeIn {
                response_id,
                source,
            } => {
                tracing::info!(%response_id, ?source, "barge-in");
                self.cancel_response(&response_id);
                self.transcripts.lock().clear_assistant();
                EngineStats::incr(&self.context.stats.barge_ins);
                self.emit_action(SessionAction::Interrupted {
                    response_id,
                    source,
                });
            }

            ProtocolEvent::Transcript {
                channel,
                response_id,
                text,
                is_final,
                ..
            } => {
                if let Some(id) = response_id.as_deref()
                    && !self.filter.lock().accepts(id)
                {
                    return;
                }
                let update = self
                    .transcripts
                    .lock()
                    .apply(channel, response_id, text, is_final);
                let callback = self.transcript_callback.lock().clone();
                if let Some(cb) = callback {
                    cb(update);
                }
            }

            ProtocolEvent::Connected { reconnected } => {
                if reconnected {
                    EngineStats::incr(&self.context.stats.reconnects);
                }
            }

            ProtocolEvent::Disconnected { reason } => {
                tracing::info!(%reason, "session disconnected");
                self.filter.lock().reset();
                self.transcripts.lock().clear_partials();
            }

            ProtocolEvent::Reconnecting { attempt, .. } => {
                self.emit_action(SessionAction::Reconnecting { attempt });
            }

            ProtocolEvent::SessionCreated { session_id } => {
                tracing::info!(%session_id, "session created");
            }

            other @ (ProtocolEvent::SpeechStarted { .. }
            | ProtocolEvent::SpeechStopped { .. }
            | ProtocolEvent::InputCommitted { .. }
            | ProtocolEvent::InputCleared
            | ProtocolEvent::SessionUpdated) => {
                tracing::debug!(event = ?other, "session event");
            }
        }
    }

    /// Classify a client error and surface terminal ones.
    ///
    /// A `Transport` error marks one lost connection or failed attempt and is
    /// followed by a reconnect; only terminal errors end the conversation.
    pub fn handle_error(&self, error: RealtimeError) {
        let stats = &self.context.stats;
        match error {
            RealtimeError::Protocol { .. } => EngineStats::incr(&stats.protocol_errors),
            RealtimeError::Transport(_) => EngineStats::incr(&stats.transport_errors),
            _ => {}
        }
        let error = EngineError::from(error);
        if error.is_terminal() {
            tracing::error!(error = %error, "session failed");
            self.stop_playback();
            self.emit_action(SessionAction::Failed {
                error: error.to_string(),
            });
        } else {
            tracing::warn!(error = %error, "session error");
        }
    }

    /// Report a failed output device.
    pub fn handle_playback_error(&self, error: PlaybackError) {
        self.output.lock().reset();
        let error = EngineError::from(error);
        if error.is_terminal() {
            tracing::error!(error = %error, "playback failed");
            self.emit_action(SessionAction::Failed {
                error: error.to_string(),
            });
        } else {
            tracing::warn!(error = %error, "playback error");
        }
    }

    /// Silence playback immediately (user-triggered stop).
    pub fn stop_playback(&self) {
        self.flush_output();
    }

    pub fn transcripts(&self) -> Vec<TranscriptEntry> {
        self.transcripts.lock().entries().to_vec()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            engine: self.context.stats.snapshot(),
            playback: self.scheduler.stats(),
            playback_status: self.scheduler.get_status(),
            connection: self.client.get_status(),
            clamped_samples: self.output.lock().smoother.clamped_samples(),
        }
    }

    fn play_delta(&self, response_id: &str, delta: &str) {
        let stats = &self.context.stats;
        EngineStats::incr(&stats.chunks_received);

        let filter = self.filter.lock();
        if !filter.accepts(response_id) {
            tracing::trace!(response_id, "suppressing audio for inactive response");
            EngineStats::incr(&stats.chunks_suppressed);
            return;
        }

        let samples = match self.output.lock().convert(delta) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(response_id, error = %e, "skipping undecodable audio chunk");
                EngineStats::incr(&stats.decode_errors);
                return;
            }
        };

        let scheduled = self.scheduler.enqueue(samples);
        drop(filter);

        match scheduled {
            Ok(Some(_)) => EngineStats::incr(&stats.chunks_scheduled),
            Ok(None) => {}
            Err(PlaybackError::SinkClosed) => {
                tracing::debug!(response_id, "audio sink closed; dropping chunk");
                EngineStats::incr(&stats.playback_errors);
            }
            Err(e) => {
                tracing::error!(response_id, error = %e, "failed to schedule audio");
                EngineStats::incr(&stats.playback_errors);
                self.scheduler.handle_device_failure(e);
            }
        }
    }

    /// Cancel `response_id` and flush what it already scheduled.
    fn cancel_response(&self, response_id: &str) {
        let mut filter = self.filter.lock();
        filter.cancel(response_id);
        self.flush_output();
    }

    fn flush_output(&self) {
        self.scheduler.stop();
        self.output.lock().reset();
    }

    fn emit_action(&self, action: SessionAction) {
        let callback = self.action_callback.lock().clone();
        if let Some(cb) = callback {
            cb(action);
        }
    }
}
