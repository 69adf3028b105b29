//! Microphone capture and frame encoding.
//!
//! Device samples (interleaved f32 at the device rate) are mixed to mono,
//! resampled to the protocol input rate, sliced into fixed-duration frames and
//! encoded as PCM16. Partial frames carry over between device callbacks.
//!
//! ```text
//! device ──► mix_to_mono ──► LinearResampler ──► chunker ──► gate ──► PCM16 ──► on_frame
//!                                                    └──► level meter ──► on_level
//! ```

pub mod device;

pub use device::CpalCaptureSource;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::codec::{self, CodecError, LinearResampler, PcmWidth};
use crate::core::probe::DeviceError;

/// Protocol input rate in Hz.
pub const DEFAULT_INPUT_RATE: u32 = 16000;

/// Default frame duration in milliseconds.
pub const DEFAULT_FRAME_MS: u32 = 20;

/// Default level reporting interval in milliseconds of audio.
pub const DEFAULT_LEVEL_INTERVAL_MS: u32 = 50;

/// dBFS mapped to a level of 0%.
const LEVEL_FLOOR_DB: f32 = -60.0;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Input device error: {0}")]
    Device(String),

    #[error("Capture not initialized")]
    NotInitialized,

    #[error("Capture disposed")]
    Disposed,

    #[error("Invalid capture settings: {0}")]
    InvalidSettings(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type CaptureResult<T> = Result<T, CaptureError>;

impl From<DeviceError> for CaptureError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::PermissionDenied(msg) => CaptureError::PermissionDenied(msg),
            other => CaptureError::Device(other.to_string()),
        }
    }
}

// =============================================================================
// Types
// =============================================================================

/// Capture settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Input device name; `None` selects the default device
    pub device: Option<String>,
    /// Protocol input rate in Hz
    pub sample_rate: u32,
    /// Frame duration in milliseconds
    pub frame_ms: u32,
    /// Drop frames whose RMS falls below this value
    pub gate_threshold: Option<f32>,
    /// Level report cadence in milliseconds of audio
    pub level_interval_ms: u32,
    /// Treat loud frames as a local barge-in signal while a response plays
    pub local_barge_in: bool,
    /// RMS above which a frame counts as local speech
    pub barge_in_threshold: f32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: DEFAULT_INPUT_RATE,
            frame_ms: DEFAULT_FRAME_MS,
            gate_threshold: None,
            level_interval_ms: DEFAULT_LEVEL_INTERVAL_MS,
            local_barge_in: false,
            barge_in_threshold: 0.05,
        }
    }
}

impl CaptureSettings {
    /// Samples per emitted frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Samples per level report.
    pub fn level_samples(&self) -> usize {
        ((self.sample_rate as usize * self.level_interval_ms as usize) / 1000).max(1)
    }
}

/// Native format reported by a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// One encoded outbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Monotonic sequence number starting at 0 for each capture run
    pub seq: u64,
    /// PCM16 little-endian payload
    pub data: Bytes,
    /// RMS of the frame before encoding
    pub rms: f32,
}

impl AudioFrame {
    /// Number of samples in the frame.
    pub fn samples(&self) -> usize {
        self.data.len() / PcmWidth::Pcm16.bytes()
    }
}

/// Capture lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureState {
    Uninitialized,
    Ready,
    Capturing,
    Disposed,
}

/// Cumulative capture counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    pub frames_emitted: u64,
    pub frames_gated: u64,
    pub samples_captured: u64,
    pub device_errors: u64,
}

#[derive(Default)]
struct CaptureCounters {
    frames_emitted: AtomicU64,
    frames_gated: AtomicU64,
    samples_captured: AtomicU64,
    device_errors: AtomicU64,
}

/// Encoded frame callback.
pub type FrameCallback = Arc<dyn Fn(AudioFrame) + Send + Sync>;

/// Level callback, percent in `0..=100`.
pub type LevelCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Capture failure callback.
pub type CaptureErrorCallback = Arc<dyn Fn(CaptureError) + Send + Sync>;

/// Raw interleaved sample callback handed to a [`CaptureSource`].
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Device failure callback handed to a [`CaptureSource`].
pub type SourceErrorCallback = Box<dyn FnMut(CaptureError) + Send + 'static>;

// =============================================================================
// Source Interface
// =============================================================================

/// Microphone abstraction.
pub trait CaptureSource {
    /// Acquire the device and report its native format.
    fn open(&mut self) -> CaptureResult<CaptureFormat>;

    /// Begin pushing interleaved samples.
    fn start(&mut self, on_samples: SampleCallback, on_error: SourceErrorCallback)
    -> CaptureResult<()>;

    /// Stop pushing samples. The device stays open.
    fn stop(&mut self);

    /// Release the device.
    fn close(&mut self);
}

// =============================================================================
// Frame Pipeline
// =============================================================================

/// Frames and level reports produced by one device callback.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub frames: Vec<AudioFrame>,
    pub levels: Vec<f32>,
    pub gated: u64,
}

/// Device-independent half of the capture path.
pub struct FramePipeline {
    channels: usize,
    resampler: LinearResampler,
    frame_samples: usize,
    gate_threshold: Option<f32>,
    pending: Vec<f32>,
    seq: u64,
    level_samples: usize,
    level_sum_sq: f64,
    level_count: usize,
    level: f32,
}

impl FramePipeline {
    pub fn new(format: CaptureFormat, settings: &CaptureSettings) -> CaptureResult<Self> {
        if format.channels == 0 {
            return Err(CodecError::ZeroChannels.into());
        }
        let frame_samples = settings.frame_samples();
        if frame_samples == 0 {
            return Err(CaptureError::InvalidSettings(format!(
                "{} ms at {} Hz yields empty frames",
                settings.frame_ms, settings.sample_rate
            )));
        }
        Ok(Self {
            channels: format.channels as usize,
            resampler: LinearResampler::new(format.sample_rate, settings.sample_rate)?,
            frame_samples,
            gate_threshold: settings.gate_threshold,
            pending: Vec::with_capacity(frame_samples * 2),
            seq: 0,
            level_samples: settings.level_samples(),
            level_sum_sq: 0.0,
            level_count: 0,
            level: 0.0,
        })
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Samples waiting for a complete frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Feed one device callback's worth of interleaved samples.
    pub fn push(&mut self, interleaved: &[f32]) -> CaptureResult<PipelineOutput> {
        let mono = codec::mix_to_mono(interleaved, self.channels)?;
        let samples = self.resampler.process(&mono);
        let mut output = PipelineOutput::default();

        for &sample in &samples {
            self.level_sum_sq += f64::from(sample) * f64::from(sample);
            self.level_count += 1;
            if self.level_count == self.level_samples {
                let rms = (self.level_sum_sq / self.level_count as f64).sqrt() as f32;
                output.levels.push(self.update_level(rms));
                self.level_sum_sq = 0.0;
                self.level_count = 0;
            }
        }

        self.pending.extend_from_slice(&samples);
        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            let rms = codec::rms(&frame);
            if self.gate_threshold.is_some_and(|threshold| rms < threshold) {
                output.gated += 1;
                continue;
            }
            output.frames.push(AudioFrame {
                seq: self.seq,
                data: Bytes::from(codec::encode(&frame, PcmWidth::Pcm16)),
                rms,
            });
            self.seq += 1;
        }

        Ok(output)
    }

    /// Fast attack, slow release on a dBFS scale.
    fn update_level(&mut self, rms: f32) -> f32 {
        let db = if rms > 0.0 {
            20.0 * rms.log10()
        } else {
            LEVEL_FLOOR_DB
        };
        let target = ((db - LEVEL_FLOOR_DB) / -LEVEL_FLOOR_DB).clamp(0.0, 1.0) * 100.0;
        self.level = if target > self.level {
            target
        } else {
            self.level * 0.7 + target * 0.3
        };
        self.level
    }
}

// =============================================================================
// Encoder
// =============================================================================

/// Owns a capture source and turns its samples into encoded frames.
pub struct CaptureEncoder {
    source: Box<dyn CaptureSource>,
    settings: CaptureSettings,
    state: CaptureState,
    format: Option<CaptureFormat>,
    counters: Arc<CaptureCounters>,
    faulted: Arc<AtomicBool>,
    on_level: Option<LevelCallback>,
    on_error: Option<CaptureErrorCallback>,
}

impl CaptureEncoder {
    pub fn new(source: Box<dyn CaptureSource>, settings: CaptureSettings) -> Self {
        Self {
            source,
            settings,
            state: CaptureState::Uninitialized,
            format: None,
            counters: Arc::new(CaptureCounters::default()),
            faulted: Arc::new(AtomicBool::new(false)),
            on_level: None,
            on_error: None,
        }
    }

    pub fn on_level(&mut self, callback: LevelCallback) {
        self.on_level = Some(callback);
    }

    pub fn on_error(&mut self, callback: CaptureErrorCallback) {
        self.on_error = Some(callback);
    }

    /// Acquire the input device.
    pub fn initialize(&mut self) -> CaptureResult<CaptureFormat> {
        match self.state {
            CaptureState::Disposed => return Err(CaptureError::Disposed),
            CaptureState::Ready | CaptureState::Capturing => {
                if let Some(format) = self.format {
                    return Ok(format);
                }
            }
            CaptureState::Uninitialized => {}
        }

        let format = self.source.open()?;
        tracing::info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            "capture device ready"
        );
        self.format = Some(format);
        self.state = CaptureState::Ready;
        Ok(format)
    }

    /// Begin continuous capture. A no-op while already capturing.
    pub fn start(&mut self, on_frame: FrameCallback) -> CaptureResult<()> {
        match self.state() {
            CaptureState::Uninitialized => return Err(CaptureError::NotInitialized),
            CaptureState::Disposed => return Err(CaptureError::Disposed),
            CaptureState::Capturing => return Ok(()),
            CaptureState::Ready => {}
        }
        if self.state == CaptureState::Capturing {
            // Faulted run: release the dead stream before restarting
            self.source.stop();
        }

        let format = self.format.ok_or(CaptureError::NotInitialized)?;
        let mut pipeline = FramePipeline::new(format, &self.settings)?;
        self.faulted.store(false, Ordering::Release);

        let counters = self.counters.clone();
        let faulted = self.faulted.clone();
        let on_level = self.on_level.clone();
        let on_samples: SampleCallback = Box::new(move |data: &[f32]| {
            if faulted.load(Ordering::Acquire) {
                return;
            }
            counters
                .samples_captured
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            match pipeline.push(data) {
                Ok(output) => {
                    counters
                        .frames_gated
                        .fetch_add(output.gated, Ordering::Relaxed);
                    counters
                        .frames_emitted
                        .fetch_add(output.frames.len() as u64, Ordering::Relaxed);
                    for frame in output.frames {
                        tracing::trace!(seq = frame.seq, rms = frame.rms, "capture frame");
                        on_frame(frame);
                    }
                    if let Some(cb) = &on_level {
                        for level in output.levels {
                            cb(level);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dropping capture block"),
            }
        });

        let counters = self.counters.clone();
        let faulted = self.faulted.clone();
        let on_error = self.on_error.clone();
        let on_source_error: SourceErrorCallback = Box::new(move |err: CaptureError| {
            if faulted.swap(true, Ordering::AcqRel) {
                return;
            }
            counters.device_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %err, "capture device failed, capture stopped");
            if let Some(cb) = &on_error {
                cb(err);
            }
        });

        self.source.start(on_samples, on_source_error)?;
        self.state = CaptureState::Capturing;
        tracing::info!(
            frame_samples = self.settings.frame_samples(),
            gate = ?self.settings.gate_threshold,
            "capture started"
        );
        Ok(())
    }

    /// Halt capture; the device stays open for a fast restart.
    pub fn stop(&mut self) {
        if self.state == CaptureState::Capturing {
            self.source.stop();
            self.state = CaptureState::Ready;
            tracing::info!("capture stopped");
        }
    }

    /// Release the device. Further calls fail with `Disposed`.
    pub fn dispose(&mut self) {
        if self.state == CaptureState::Disposed {
            return;
        }
        self.stop();
        self.source.close();
        self.state = CaptureState::Disposed;
        self.format = None;
    }

    /// Current lifecycle state; a device failure reports `Ready`.
    pub fn state(&self) -> CaptureState {
        if self.state == CaptureState::Capturing && self.faulted.load(Ordering::Acquire) {
            CaptureState::Ready
        } else {
            self.state
        }
    }

    pub fn format(&self) -> Option<CaptureFormat> {
        self.format
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_emitted: self.counters.frames_emitted.load(Ordering::Relaxed),
            frames_gated: self.counters.frames_gated.load(Ordering::Relaxed),
            samples_captured: self.counters.samples_captured.load(Ordering::Relaxed),
            device_errors: self.counters.device_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CaptureEncoder {
    fn drop(&mut self) {
        self.dispose();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Slot<T> = Arc<Mutex<Option<T>>>;

    /// Source driven by the test through shared callback slots.
    struct ScriptedSource {
        format: CaptureFormat,
        fail_open: Option<CaptureError>,
        samples: Slot<SampleCallback>,
        errors: Slot<SourceErrorCallback>,
        closed: Arc<AtomicBool>,
    }

    struct Handles {
        samples: Slot<SampleCallback>,
        errors: Slot<SourceErrorCallback>,
        closed: Arc<AtomicBool>,
    }

    impl Handles {
        fn push(&self, data: &[f32]) {
            if let Some(cb) = self.samples.lock().as_mut() {
                cb(data);
            }
        }

        fn fail(&self, err: CaptureError) {
            if let Some(cb) = self.errors.lock().as_mut() {
                cb(err);
            }
        }
    }

    fn scripted(rate: u32, channels: u16) -> (ScriptedSource, Handles) {
        let samples: Slot<SampleCallback> = Arc::new(Mutex::new(None));
        let errors: Slot<SourceErrorCallback> = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));
        (
            ScriptedSource {
                format: CaptureFormat {
                    sample_rate: rate,
                    channels,
                },
                fail_open: None,
                samples: samples.clone(),
                errors: errors.clone(),
                closed: closed.clone(),
            },
            Handles {
                samples,
                errors,
                closed,
            },
        )
    }

    impl CaptureSource for ScriptedSource {
        fn open(&mut self) -> CaptureResult<CaptureFormat> {
            match self.fail_open.clone() {
                Some(err) => Err(err),
                None => Ok(self.format),
            }
        }

        fn start(
            &mut self,
            on_samples: SampleCallback,
            on_error: SourceErrorCallback,
        ) -> CaptureResult<()> {
            *self.samples.lock() = Some(on_samples);
            *self.errors.lock() = Some(on_error);
            Ok(())
        }

        fn stop(&mut self) {
            *self.samples.lock() = None;
            *self.errors.lock() = None;
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn collector() -> (FrameCallback, Arc<Mutex<Vec<AudioFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        (Arc::new(move |f: AudioFrame| sink.lock().push(f)), frames)
    }

    #[test]
    fn test_default_frame_is_320_samples() {
        assert_eq!(CaptureSettings::default().frame_samples(), 320);
    }

    #[test]
    fn test_zero_frame_encodes_to_640_zero_bytes() {
        let format = CaptureFormat {
            sample_rate: 16000,
            channels: 1,
        };
        let mut pipeline = FramePipeline::new(format, &CaptureSettings::default()).unwrap();
        let out = pipeline.push(&[0.0; 320]).unwrap();
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].data.len(), 640);
        assert!(out.frames[0].data.iter().all(|&b| b == 0));
        assert_eq!(out.frames[0].samples(), 320);
    }

    #[test]
    fn test_partial_frames_carry_over() {
        let format = CaptureFormat {
            sample_rate: 16000,
            channels: 1,
        };
        let mut pipeline = FramePipeline::new(format, &CaptureSettings::default()).unwrap();

        let out = pipeline.push(&[0.1; 200]).unwrap();
        assert!(out.frames.is_empty());
        assert_eq!(pipeline.pending_samples(), 200);

        let out = pipeline.push(&[0.1; 500]).unwrap();
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.frames[0].seq, 0);
        assert_eq!(out.frames[1].seq, 1);
        assert_eq!(pipeline.pending_samples(), 60);
    }

    #[test]
    fn test_stereo_device_is_mixed_and_resampled() {
        let format = CaptureFormat {
            sample_rate: 48000,
            channels: 2,
        };
        let mut pipeline = FramePipeline::new(format, &CaptureSettings::default()).unwrap();
        // 40 ms of stereo at 48 kHz -> 640 mono samples at 16 kHz, give or take
        let out = pipeline.push(&vec![0.25; 48 * 40 * 2]).unwrap();
        assert!(!out.frames.is_empty());
        assert!(out.frames.iter().all(|f| f.samples() == 320));
    }

    #[test]
    fn test_gate_drops_quiet_frames() {
        let format = CaptureFormat {
            sample_rate: 16000,
            channels: 1,
        };
        let settings = CaptureSettings {
            gate_threshold: Some(0.01),
            ..Default::default()
        };
        let mut pipeline = FramePipeline::new(format, &settings).unwrap();
        let mut block = vec![0.0; 320];
        block.extend(std::iter::repeat_n(0.5, 320));
        let out = pipeline.push(&block).unwrap();
        assert_eq!(out.gated, 1);
        assert_eq!(out.frames.len(), 1);
        // Gated frames do not consume sequence numbers
        assert_eq!(out.frames[0].seq, 0);
    }

    #[test]
    fn test_level_cadence_is_independent_of_frames() {
        let format = CaptureFormat {
            sample_rate: 16000,
            channels: 1,
        };
        let mut pipeline = FramePipeline::new(format, &CaptureSettings::default()).unwrap();
        // 100 ms: five frames, two level reports
        let out = pipeline.push(&[0.5; 1600]).unwrap();
        assert_eq!(out.frames.len(), 5);
        assert_eq!(out.levels.len(), 2);
        assert!(out.levels.iter().all(|&l| l > 0.0 && l <= 100.0));

        let out = pipeline.push(&[0.0; 800]).unwrap();
        assert_eq!(out.levels.len(), 1);
        assert!(out.levels[0] < 100.0);
    }

    #[test]
    fn test_start_requires_initialize() {
        let (source, _handles) = scripted(16000, 1);
        let mut encoder = CaptureEncoder::new(Box::new(source), CaptureSettings::default());
        let (cb, _) = collector();
        match encoder.start(cb) {
            Err(CaptureError::NotInitialized) => {}
            _ => panic!("Expected NotInitialized"),
        }
    }

    #[test]
    fn test_initialize_propagates_permission_error() {
        let (mut source, _handles) = scripted(16000, 1);
        source.fail_open = Some(CaptureError::PermissionDenied("blocked".to_string()));
        let mut encoder = CaptureEncoder::new(Box::new(source), CaptureSettings::default());
        match encoder.initialize() {
            Err(CaptureError::PermissionDenied(_)) => {}
            _ => panic!("Expected PermissionDenied"),
        }
        assert_eq!(encoder.state(), CaptureState::Uninitialized);
    }

    #[test]
    fn test_lifecycle_emits_frames_and_stops() {
        let (source, handles) = scripted(16000, 1);
        let mut encoder = CaptureEncoder::new(Box::new(source), CaptureSettings::default());
        encoder.initialize().unwrap();
        let (cb, frames) = collector();
        encoder.start(cb.clone()).unwrap();
        assert_eq!(encoder.state(), CaptureState::Capturing);

        // Second start is a no-op
        encoder.start(cb).unwrap();

        handles.push(&[0.2; 640]);
        assert_eq!(frames.lock().len(), 2);
        assert_eq!(encoder.stats().frames_emitted, 2);

        encoder.stop();
        assert_eq!(encoder.state(), CaptureState::Ready);
        handles.push(&[0.2; 640]);
        assert_eq!(frames.lock().len(), 2);

        encoder.dispose();
        assert_eq!(encoder.state(), CaptureState::Disposed);
        assert!(handles.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_device_error_reports_and_halts() {
        let (source, handles) = scripted(16000, 1);
        let mut encoder = CaptureEncoder::new(Box::new(source), CaptureSettings::default());
        let errors = Arc::new(AtomicU64::new(0));
        let counter = errors.clone();
        encoder.on_error(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        encoder.initialize().unwrap();
        let (cb, frames) = collector();
        encoder.start(cb.clone()).unwrap();

        handles.fail(CaptureError::Device("unplugged".to_string()));
        handles.fail(CaptureError::Device("unplugged".to_string()));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(encoder.state(), CaptureState::Ready);

        handles.push(&[0.2; 320]);
        assert!(frames.lock().is_empty());

        // Explicit restart resumes capture
        encoder.start(cb).unwrap();
        handles.push(&[0.2; 320]);
        assert_eq!(frames.lock().len(), 1);
    }
}
