//! cpal output sink.
//!
//! The audio thread mixes every scheduled source against a sample-accurate
//! clock (frames rendered so far). `cpal::Stream` is not `Send`, so the stream
//! lives in [`CpalOutput`] on the thread that opened it while the cloneable
//! [`CpalSinkHandle`] is shared with the scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{AudioSink, PlaybackError, PlaybackResult, SinkEvent, SourceId};
use crate::core::probe::{self, classify};

struct MixSource {
    id: SourceId,
    samples: Arc<[f32]>,
    start_frame: u64,
}

struct MixerShared {
    sample_rate: u32,
    sources: Mutex<Vec<MixSource>>,
    frames_rendered: AtomicU64,
    gain_bits: AtomicU32,
    failed: AtomicBool,
    events: mpsc::UnboundedSender<SinkEvent>,
}

impl MixerShared {
    /// Mix one block of mono output into `scratch` and advance the clock.
    fn render(&self, scratch: &mut [f32]) {
        scratch.fill(0.0);
        let frames = scratch.len() as u64;
        let block_start = self.frames_rendered.load(Ordering::Acquire);
        let block_end = block_start + frames;

        let mut finished: Vec<SourceId> = Vec::new();
        {
            let mut sources = self.sources.lock();
            sources.retain(|source| {
                let source_end = source.start_frame + source.samples.len() as u64;
                let from = source.start_frame.max(block_start);
                let to = source_end.min(block_end);
                for frame in from..to {
                    scratch[(frame - block_start) as usize] +=
                        source.samples[(frame - source.start_frame) as usize];
                }
                if source_end <= block_end {
                    finished.push(source.id);
                    false
                } else {
                    true
                }
            });
        }

        let gain = f32::from_bits(self.gain_bits.load(Ordering::Relaxed));
        if gain != 1.0 {
            for sample in scratch.iter_mut() {
                *sample *= gain;
            }
        }

        self.frames_rendered.fetch_add(frames, Ordering::Release);
        for id in finished {
            let _ = self.events.send(SinkEvent::Ended(id));
        }
    }

    /// Mark the stream dead and report it once.
    fn fail(&self, message: String) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sources.lock().clear();
        let _ = self
            .events
            .send(SinkEvent::Failed(PlaybackError::from(classify(message))));
    }
}

/// Shareable handle implementing [`AudioSink`] for a cpal output stream.
#[derive(Clone)]
pub struct CpalSinkHandle {
    shared: Arc<MixerShared>,
}

impl AudioSink for CpalSinkHandle {
    fn now(&self) -> f64 {
        self.shared.frames_rendered.load(Ordering::Acquire) as f64
            / self.shared.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn schedule(&self, id: SourceId, samples: Arc<[f32]>, start_time: f64) -> PlaybackResult<()> {
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(PlaybackError::Device("output stream failed".to_string()));
        }
        let start_frame = (start_time.max(0.0) * self.shared.sample_rate as f64).round() as u64;
        self.shared.sources.lock().push(MixSource {
            id,
            samples,
            start_frame,
        });
        Ok(())
    }

    fn stop_source(&self, id: SourceId) {
        self.shared.sources.lock().retain(|s| s.id != id);
    }

    fn set_gain(&self, gain: f32) {
        self.shared.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }
}

/// Owner of the running output stream.
pub struct CpalOutput {
    _stream: Stream,
    handle: CpalSinkHandle,
    device_name: String,
    channels: u16,
}

impl CpalOutput {
    /// Open the named (or default) output device at its default config.
    ///
    /// Returns the output together with the receiver on which the audio thread
    /// reports finished sources and stream failure.
    pub fn open(
        device_name: Option<&str>,
    ) -> PlaybackResult<(Self, mpsc::UnboundedReceiver<SinkEvent>)> {
        let device = probe::output_device(device_name)?;
        let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::from(classify(e.to_string())))?;
        let format = supported.sample_format();
        let config: StreamConfig = supported.config();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MixerShared {
            sample_rate: config.sample_rate.0,
            sources: Mutex::new(Vec::new()),
            frames_rendered: AtomicU64::new(0),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            failed: AtomicBool::new(false),
            events: events_tx,
        });

        let stream = match format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, shared.clone()),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, shared.clone()),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, shared.clone()),
            SampleFormat::I32 => build_stream::<i32>(&device, &config, shared.clone()),
            other => Err(PlaybackError::Device(format!(
                "unsupported output sample format {other:?}"
            ))),
        }?;
        stream
            .play()
            .map_err(|e| PlaybackError::from(classify(e.to_string())))?;

        tracing::info!(
            device = %name,
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio output opened"
        );

        Ok((
            Self {
                _stream: stream,
                handle: CpalSinkHandle { shared },
                device_name: name,
                channels: config.channels,
            },
            events_rx,
        ))
    }

    /// Sink handle for the scheduler.
    pub fn handle(&self) -> CpalSinkHandle {
        self.handle.clone()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<MixerShared>,
) -> PlaybackResult<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let error_shared = shared.clone();
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                scratch.resize(frames, 0.0);
                shared.render(&mut scratch);
                for (frame, &value) in data.chunks_mut(channels).zip(scratch.iter()) {
                    for out in frame.iter_mut() {
                        *out = T::from_sample(value);
                    }
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio output stream error");
                error_shared.fail(err.to_string());
            },
            None,
        )
        .map_err(|e| PlaybackError::from(classify(e.to_string())))
}
