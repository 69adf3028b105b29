//! Gapless playback scheduling.
//!
//! The `PlaybackScheduler` places every decoded buffer at an absolute start
//! time on the sink's clock so consecutive buffers play back-to-back:
//!
//! ```text
//! start = max(next_start_time, now + lead)
//! next_start_time = start + duration
//! ```
//!
//! When buffers arrive faster than they play, they chain without gaps. When an
//! arrival gap causes an underrun, scheduling re-synchronizes to `now + lead`.
//!
//! Scheduled buffers are tracked in an in-flight set. A sink reports natural
//! completion through [`PlaybackScheduler::handle_source_ended`]; when the set
//! drains the scheduler becomes idle and fires `on_ended` once. `stop()`
//! removes every entry from the set before stopping it on the sink, so late
//! completions for stopped sources are ignored and never fire `on_ended`.
//!
//! A failed output device drains the set the same way and is reported once
//! through `on_error`; later enqueues are rejected.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waav_duplex::core::playback::{OfflineSink, PlaybackScheduler};
//!
//! let sink = Arc::new(OfflineSink::new(24000));
//! let scheduler = PlaybackScheduler::new(sink.clone(), 0.05);
//! scheduler.on_ended(Arc::new(|| println!("idle")));
//! scheduler.enqueue(vec![0.0; 2400])?;
//! ```

pub mod device;
pub mod offline;
pub mod smoother;

pub use device::{CpalOutput, CpalSinkHandle};
pub use offline::{OfflineSink, OfflineSource};
pub use smoother::AudioSmoother;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::codec::PcmWidth;
use crate::core::probe::DeviceError;

/// Minimum scheduling lead in seconds.
pub const MIN_LEAD_SECONDS: f64 = 0.02;

/// Default scheduling lead in seconds.
pub const DEFAULT_LEAD_SECONDS: f64 = 0.05;

/// Protocol output rate in Hz.
pub const DEFAULT_OUTPUT_RATE: u32 = 24000;

/// Playback settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Output device name; `None` selects the default device
    pub device: Option<String>,
    /// Rate of audio received from the protocol in Hz
    pub sample_rate: u32,
    /// Width of audio received from the protocol
    pub width: PcmWidth,
    /// Scheduling lead in milliseconds
    pub lead_ms: u32,
    /// Crossfade at chunk boundaries in milliseconds
    pub crossfade_ms: f32,
    /// Remove per-chunk DC offset
    pub dc_removal: bool,
    /// Output volume in `0..=1`
    pub volume: f32,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: DEFAULT_OUTPUT_RATE,
            width: PcmWidth::Pcm16,
            lead_ms: (DEFAULT_LEAD_SECONDS * 1000.0) as u32,
            crossfade_ms: smoother::DEFAULT_CROSSFADE_MS,
            dc_removal: true,
            volume: 1.0,
        }
    }
}

impl PlaybackSettings {
    pub fn lead_seconds(&self) -> f64 {
        f64::from(self.lead_ms) / 1000.0
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the playback path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// Output device access denied
    #[error("Output device permission denied: {0}")]
    PermissionDenied(String),

    /// Output device missing, busy or lost
    #[error("Output device error: {0}")]
    Device(String),

    /// The sink has been shut down
    #[error("Audio sink closed")]
    SinkClosed,
}

/// Result type for playback operations.
pub type PlaybackResult<T> = Result<T, PlaybackError>;

impl From<DeviceError> for PlaybackError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::PermissionDenied(msg) => PlaybackError::PermissionDenied(msg),
            other => PlaybackError::Device(other.to_string()),
        }
    }
}

// =============================================================================
// Sink Interface
// =============================================================================

/// Identifier of one scheduled buffer.
pub type SourceId = u64;

/// Output device abstraction.
///
/// Implementations play each scheduled buffer starting at `start_time` seconds
/// on their own clock, apply a single shared gain to everything they render,
/// and report natural completion of a source back to the scheduler.
pub trait AudioSink: Send + Sync {
    /// Current time on the sink clock, in seconds.
    fn now(&self) -> f64;

    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Schedule mono samples to start at `start_time`.
    fn schedule(&self, id: SourceId, samples: Arc<[f32]>, start_time: f64) -> PlaybackResult<()>;

    /// Stop a source immediately without reporting completion.
    fn stop_source(&self, id: SourceId);

    /// Set the shared output gain.
    fn set_gain(&self, gain: f32);
}

/// Callback fired when playback transitions to idle.
pub type PlaybackEndedCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback fired once when the output device fails.
pub type PlaybackErrorCallback = Arc<dyn Fn(PlaybackError) + Send + Sync>;

/// Notification from a rendering sink back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// A source finished playing naturally
    Ended(SourceId),
    /// The output stream stopped rendering
    Failed(PlaybackError),
}

// =============================================================================
// Status
// =============================================================================

/// An entry in the in-flight set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduledSource {
    /// Source identifier
    pub id: SourceId,
    /// Absolute start time on the sink clock (seconds)
    pub start_time: f64,
    /// Buffer duration (seconds)
    pub duration: f64,
}

impl ScheduledSource {
    /// Absolute end time on the sink clock.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Point-in-time scheduler status.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackStatus {
    pub is_playing: bool,
    pub queue_length: usize,
    pub next_start_time: f64,
    /// Seconds of audio scheduled beyond the sink clock
    pub buffered_seconds: f64,
    /// Time since the last buffer was enqueued
    pub last_enqueue_age: Option<Duration>,
    pub volume: f32,
}

/// Cumulative scheduler counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaybackStats {
    pub buffers_scheduled: u64,
    pub samples_scheduled: u64,
    /// Times scheduling re-synchronized to the clock after an underrun
    pub underruns: u64,
    /// Non-finite samples replaced with silence
    pub sanitized_samples: u64,
    pub ended_events: u64,
    pub stopped_sources: u64,
    /// In-flight sources dropped by a device failure
    pub failed_sources: u64,
}

// =============================================================================
// Scheduler
// =============================================================================

struct SchedulerState {
    next_start_time: f64,
    sources: BTreeMap<SourceId, ScheduledSource>,
    next_id: SourceId,
    last_enqueue: Option<Instant>,
    volume: f32,
    failed: bool,
    stats: PlaybackStats,
}

/// Schedules decoded buffers on an [`AudioSink`] for gapless playback.
pub struct PlaybackScheduler {
    sink: Arc<dyn AudioSink>,
    lead: f64,
    state: Mutex<SchedulerState>,
    on_ended: Mutex<Option<PlaybackEndedCallback>>,
    on_error: Mutex<Option<PlaybackErrorCallback>>,
}

impl PlaybackScheduler {
    /// Create a scheduler. `lead_seconds` is raised to at least 20 ms.
    pub fn new(sink: Arc<dyn AudioSink>, lead_seconds: f64) -> Self {
        Self {
            sink,
            lead: lead_seconds.max(MIN_LEAD_SECONDS),
            state: Mutex::new(SchedulerState {
                next_start_time: 0.0,
                sources: BTreeMap::new(),
                next_id: 1,
                last_enqueue: None,
                volume: 1.0,
                failed: false,
                stats: PlaybackStats::default(),
            }),
            on_ended: Mutex::new(None),
            on_error: Mutex::new(None),
        }
    }

    /// Register the idle-transition callback.
    pub fn on_ended(&self, callback: PlaybackEndedCallback) {
        *self.on_ended.lock() = Some(callback);
    }

    /// Register the device-failure callback.
    pub fn on_error(&self, callback: PlaybackErrorCallback) {
        *self.on_error.lock() = Some(callback);
    }

    /// Output sample rate of the underlying sink.
    pub fn sample_rate(&self) -> u32 {
        self.sink.sample_rate()
    }

    /// Scheduling lead in seconds.
    pub fn lead(&self) -> f64 {
        self.lead
    }

    /// Schedule a buffer for gapless playback.
    ///
    /// Non-finite samples are replaced with silence. Empty buffers are ignored
    /// and return `Ok(None)`.
    pub fn enqueue(&self, mut buffer: Vec<f32>) -> PlaybackResult<Option<ScheduledSource>> {
        if buffer.is_empty() {
            return Ok(None);
        }

        let mut sanitized = 0u64;
        for sample in buffer.iter_mut() {
            if !sample.is_finite() {
                *sample = 0.0;
                sanitized += 1;
            }
        }
        if sanitized > 0 {
            tracing::warn!(sanitized, "replaced non-finite samples with silence");
        }

        let rate = self.sink.sample_rate().max(1);
        let duration = buffer.len() as f64 / rate as f64;
        let now = self.sink.now();
        let earliest = now + self.lead;

        let source = {
            let mut state = self.state.lock();
            if state.failed {
                return Err(PlaybackError::Device("output device failed".to_string()));
            }
            let resuming = state.next_start_time > 0.0;
            let start_time = if resuming {
                state.next_start_time.max(earliest)
            } else {
                earliest
            };
            if resuming && earliest > state.next_start_time {
                state.stats.underruns += 1;
                tracing::debug!(
                    gap_ms = (earliest - state.next_start_time) * 1000.0,
                    "playback underrun, resynchronizing"
                );
            }

            let id = state.next_id;
            state.next_id += 1;
            state.next_start_time = start_time + duration;
            state.last_enqueue = Some(Instant::now());
            state.stats.buffers_scheduled += 1;
            state.stats.samples_scheduled += buffer.len() as u64;
            state.stats.sanitized_samples += sanitized;

            let source = ScheduledSource {
                id,
                start_time,
                duration,
            };
            state.sources.insert(id, source);
            source
        };

        if let Err(e) = self
            .sink
            .schedule(source.id, Arc::from(buffer), source.start_time)
        {
            let mut state = self.state.lock();
            state.sources.remove(&source.id);
            if state.sources.is_empty() {
                state.next_start_time = 0.0;
            }
            return Err(e);
        }

        tracing::trace!(
            id = source.id,
            start = source.start_time,
            duration = source.duration,
            "scheduled playback buffer"
        );
        Ok(Some(source))
    }

    /// Report that a source finished playing naturally.
    ///
    /// Unknown ids (already stopped) are ignored. Fires `on_ended` when the
    /// in-flight set drains.
    pub fn handle_source_ended(&self, id: SourceId) {
        let callback = {
            let mut state = self.state.lock();
            if state.sources.remove(&id).is_none() {
                return;
            }
            if !state.sources.is_empty() {
                return;
            }
            state.next_start_time = 0.0;
            state.stats.ended_events += 1;
            self.on_ended.lock().clone()
        };

        tracing::debug!("playback idle");
        // Lock released: the callback may call back into the scheduler
        if let Some(cb) = callback {
            cb();
        }
    }

    /// Immediately halt all in-flight audio.
    ///
    /// Entries are removed from the in-flight set before the sink stops them,
    /// which cancels their completion handling. Safe to call from inside the
    /// `on_ended` callback.
    pub fn stop(&self) {
        let snapshot: Vec<SourceId> = {
            let mut state = self.state.lock();
            let ids: Vec<SourceId> = state.sources.keys().copied().collect();
            state.sources.clear();
            state.next_start_time = 0.0;
            state.stats.stopped_sources += ids.len() as u64;
            ids
        };

        for id in &snapshot {
            self.sink.stop_source(*id);
        }
        if !snapshot.is_empty() {
            tracing::debug!(stopped = snapshot.len(), "playback stopped");
        }
    }

    /// Report that the sink can no longer render.
    ///
    /// Drains the in-flight set without firing `on_ended` and reports the
    /// error through `on_error`. Only the first failure is reported.
    pub fn handle_device_failure(&self, error: PlaybackError) {
        let (dropped, callback) = {
            let mut state = self.state.lock();
            if state.failed {
                return;
            }
            state.failed = true;
            let ids: Vec<SourceId> = state.sources.keys().copied().collect();
            state.sources.clear();
            state.next_start_time = 0.0;
            state.stats.failed_sources += ids.len() as u64;
            (ids, self.on_error.lock().clone())
        };

        for id in &dropped {
            self.sink.stop_source(*id);
        }
        tracing::error!(error = %error, dropped = dropped.len(), "audio output failed");
        if let Some(cb) = callback {
            cb(error);
        }
    }

    /// Whether a device failure has been reported.
    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// Set output volume (clamped to `0..=1`).
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.state.lock().volume = volume;
        self.sink.set_gain(volume);
    }

    /// Snapshot of the scheduling state.
    pub fn get_status(&self) -> PlaybackStatus {
        let now = self.sink.now();
        let state = self.state.lock();
        let is_playing = !state.sources.is_empty();
        PlaybackStatus {
            is_playing,
            queue_length: state.sources.len(),
            next_start_time: state.next_start_time,
            buffered_seconds: if is_playing {
                (state.next_start_time - now).max(0.0)
            } else {
                0.0
            },
            last_enqueue_age: state.last_enqueue.map(|t| t.elapsed()),
            volume: state.volume,
        }
    }

    /// Cumulative counters.
    pub fn stats(&self) -> PlaybackStats {
        self.state.lock().stats.clone()
    }

    /// In-flight sources in scheduling order.
    pub fn scheduled_sources(&self) -> Vec<ScheduledSource> {
        self.state.lock().sources.values().copied().collect()
    }

    /// Spawn a task that forwards sink notifications into the scheduler.
    pub fn attach_completions(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SinkEvent>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SinkEvent::Ended(id) => scheduler.handle_source_ended(id),
                    SinkEvent::Failed(error) => scheduler.handle_device_failure(error),
                }
            }
            tracing::debug!("playback completion channel closed");
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
