//! Device-free sink with a caller-driven clock.
//!
//! Used for headless runs and tests. Nothing is rendered; the owner advances
//! the clock and forwards the returned completions to the scheduler.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{AudioSink, PlaybackError, PlaybackResult, SourceId};

/// A buffer accepted by an [`OfflineSink`].
#[derive(Debug, Clone)]
pub struct OfflineSource {
    pub id: SourceId,
    pub samples: Arc<[f32]>,
    pub start_time: f64,
}

#[derive(Default)]
struct OfflineState {
    now: f64,
    gain: f32,
    closed: bool,
    failure: Option<PlaybackError>,
    pending: Vec<OfflineSource>,
    scheduled: Vec<OfflineSource>,
    stopped: Vec<SourceId>,
}

/// Sink that records scheduling calls instead of rendering.
pub struct OfflineSink {
    sample_rate: u32,
    state: Mutex<OfflineState>,
}

impl OfflineSink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Mutex::new(OfflineState {
                gain: 1.0,
                ..Default::default()
            }),
        }
    }

    /// Move the clock forward to `time` and return the ids of sources that
    /// finished by then, in end-time order.
    pub fn advance_to(&self, time: f64) -> Vec<SourceId> {
        let mut state = self.state.lock();
        if time > state.now {
            state.now = time;
        }
        let now = state.now;
        let rate = self.sample_rate.max(1) as f64;

        let mut finished: Vec<(f64, SourceId)> = Vec::new();
        state.pending.retain(|source| {
            let end = source.start_time + source.samples.len() as f64 / rate;
            if end <= now {
                finished.push((end, source.id));
                false
            } else {
                true
            }
        });
        finished.sort_by(|a, b| a.0.total_cmp(&b.0));
        finished.into_iter().map(|(_, id)| id).collect()
    }

    /// Every buffer ever scheduled, in call order.
    pub fn scheduled(&self) -> Vec<OfflineSource> {
        self.state.lock().scheduled.clone()
    }

    /// Ids passed to `stop_source`.
    pub fn stopped(&self) -> Vec<SourceId> {
        self.state.lock().stopped.clone()
    }

    /// Sources neither finished nor stopped.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn gain(&self) -> f32 {
        self.state.lock().gain
    }

    /// Simulate a lost output device: pending sources never finish and
    /// further scheduling fails with the returned error.
    pub fn fail(&self, message: &str) -> PlaybackError {
        let error = PlaybackError::Device(message.to_string());
        let mut state = self.state.lock();
        state.failure = Some(error.clone());
        state.pending.clear();
        error
    }

    /// Reject further scheduling.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
    }
}

impl AudioSink for OfflineSink {
    fn now(&self) -> f64 {
        self.state.lock().now
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn schedule(&self, id: SourceId, samples: Arc<[f32]>, start_time: f64) -> PlaybackResult<()> {
        let mut state = self.state.lock();
        if let Some(error) = &state.failure {
            return Err(error.clone());
        }
        if state.closed {
            return Err(PlaybackError::SinkClosed);
        }
        let source = OfflineSource {
            id,
            samples,
            start_time,
        };
        state.scheduled.push(source.clone());
        state.pending.push(source);
        Ok(())
    }

    fn stop_source(&self, id: SourceId) {
        let mut state = self.state.lock();
        state.pending.retain(|s| s.id != id);
        state.stopped.push(id);
    }

    fn set_gain(&self, gain: f32) {
        self.state.lock().gain = gain;
    }
}
