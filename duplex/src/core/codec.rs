//! PCM frame codec.
//!
//! Pure conversions between floating-point sample buffers and the linear PCM
//! byte encodings used on the wire, plus the small DSP helpers the audio paths
//! need around them:
//!
//! - `encode` / `decode` for 16, 24 and 32-bit little-endian PCM
//! - `resample` (linear interpolation) and a streaming `LinearResampler`
//! - `mix_to_mono` for interleaved multi-channel device buffers
//! - base64 helpers for the JSON transport
//!
//! Samples are `f32` in `[-1.0, 1.0]`. Encoding clamps, decoding never
//! produces values outside the range.

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Errors produced by the codec. Fatal to the buffer being converted only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Byte length is not a multiple of the sample width
    #[error("buffer of {len} bytes is not a multiple of the {width}-byte sample width")]
    MisalignedBuffer { len: usize, width: usize },

    /// Interleaved sample count is not a multiple of the channel count
    #[error("{len} interleaved samples cannot be split into {channels} channels")]
    MisalignedChannels { len: usize, channels: usize },

    /// Channel count of zero
    #[error("channel count must be at least 1")]
    ZeroChannels,

    /// Sample rate of zero
    #[error("sample rate must be non-zero")]
    ZeroSampleRate,

    /// Unknown PCM width name
    #[error("unsupported PCM format: {0}")]
    UnsupportedFormat(String),

    /// Invalid base64 payload
    #[error("invalid base64 audio payload: {0}")]
    Base64(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

// =============================================================================
// PCM Width
// =============================================================================

/// Linear PCM sample width.
///
/// Selected once from configuration and used for every conversion afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcmWidth {
    /// 16-bit signed little-endian (default)
    #[default]
    Pcm16,
    /// 24-bit signed little-endian, packed in 3 bytes
    Pcm24,
    /// 32-bit signed little-endian
    Pcm32,
}

impl PcmWidth {
    /// Bytes per sample.
    #[inline]
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Pcm16 => 2,
            Self::Pcm24 => 3,
            Self::Pcm32 => 4,
        }
    }

    /// Bits per sample.
    #[inline]
    pub const fn bits(&self) -> u32 {
        match self {
            Self::Pcm16 => 16,
            Self::Pcm24 => 24,
            Self::Pcm32 => 32,
        }
    }

    /// Wire format name used in session configuration.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm16 => "pcm16",
            Self::Pcm24 => "pcm24",
            Self::Pcm32 => "pcm32",
        }
    }

    /// Parse from a config string (`pcm16`, `16`, `s16le`, ...).
    pub fn parse(s: &str) -> CodecResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "pcm16" | "16" | "s16le" | "linear16" => Ok(Self::Pcm16),
            "pcm24" | "24" | "s24le" => Ok(Self::Pcm24),
            "pcm32" | "32" | "s32le" => Ok(Self::Pcm32),
            other => Err(CodecError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Build from a bit count.
    pub fn from_bits(bits: u32) -> CodecResult<Self> {
        match bits {
            16 => Ok(Self::Pcm16),
            24 => Ok(Self::Pcm24),
            32 => Ok(Self::Pcm32),
            other => Err(CodecError::UnsupportedFormat(format!("{other}-bit"))),
        }
    }

    /// Largest positive integer value representable at this width.
    #[inline]
    fn full_scale(&self) -> f64 {
        match self {
            Self::Pcm16 => i16::MAX as f64,
            Self::Pcm24 => ((1i32 << 23) - 1) as f64,
            Self::Pcm32 => i32::MAX as f64,
        }
    }

    /// Normalization divisor used when decoding (2^(bits-1)).
    #[inline]
    fn divisor(&self) -> f64 {
        match self {
            Self::Pcm16 => 32768.0,
            Self::Pcm24 => 8_388_608.0,
            Self::Pcm32 => 2_147_483_648.0,
        }
    }
}

impl std::fmt::Display for PcmWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Encode / Decode
// =============================================================================

/// Encode float samples as little-endian PCM of the given width.
pub fn encode(samples: &[f32], width: PcmWidth) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * width.bytes());
    let scale = width.full_scale();

    for &sample in samples {
        // NaN clamps to NaN, so treat it as silence
        let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let value = (f64::from(s) * scale).round();
        match width {
            PcmWidth::Pcm16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            PcmWidth::Pcm24 => {
                let v = value as i32;
                out.extend_from_slice(&v.to_le_bytes()[..3]);
            }
            PcmWidth::Pcm32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
        }
    }

    out
}

/// Decode little-endian PCM of the given width into float samples.
///
/// A byte length that is not a multiple of the sample width is rejected
/// rather than truncated.
pub fn decode(bytes: &[u8], width: PcmWidth) -> CodecResult<Vec<f32>> {
    let step = width.bytes();
    if bytes.len() % step != 0 {
        return Err(CodecError::MisalignedBuffer {
            len: bytes.len(),
            width: step,
        });
    }

    let divisor = width.divisor();
    let samples = bytes
        .chunks_exact(step)
        .map(|c| {
            let value = match width {
                PcmWidth::Pcm16 => i16::from_le_bytes([c[0], c[1]]) as i32,
                // Sign-extend the 3-byte value by shifting through the top byte
                PcmWidth::Pcm24 => i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8,
                PcmWidth::Pcm32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]),
            };
            (value as f64 / divisor) as f32
        })
        .collect();

    Ok(samples)
}

// =============================================================================
// Channel Mixing
// =============================================================================

/// Average interleaved channels down to mono.
pub fn mix_to_mono(samples: &[f32], channels: usize) -> CodecResult<Vec<f32>> {
    match channels {
        0 => Err(CodecError::ZeroChannels),
        1 => Ok(samples.to_vec()),
        n => {
            if samples.len() % n != 0 {
                return Err(CodecError::MisalignedChannels {
                    len: samples.len(),
                    channels: n,
                });
            }
            let inv = 1.0 / n as f32;
            Ok(samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() * inv)
                .collect())
        }
    }
}

/// Duplicate mono samples across `channels` interleaved outputs.
pub fn expand_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .iter()
        .flat_map(|&s| std::iter::repeat_n(s, channels))
        .collect()
}

// =============================================================================
// Resampling
// =============================================================================

/// Streaming linear-interpolation resampler.
///
/// Keeps the fractional read position and the last input sample between
/// calls so that consecutive device blocks resample without a seam.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    src_rate: u32,
    dst_rate: u32,
    /// Source samples advanced per output sample
    step: f64,
    /// Read position relative to the start of the next input block.
    /// Negative values point into `last`.
    position: f64,
    /// Last sample of the previous block
    last: Option<f32>,
}

impl LinearResampler {
    /// Create a resampler from `src_rate` to `dst_rate`.
    pub fn new(src_rate: u32, dst_rate: u32) -> CodecResult<Self> {
        if src_rate == 0 || dst_rate == 0 {
            return Err(CodecError::ZeroSampleRate);
        }
        Ok(Self {
            src_rate,
            dst_rate,
            step: src_rate as f64 / dst_rate as f64,
            position: 0.0,
            last: None,
        })
    }

    /// Whether the rates are equal and samples pass through untouched.
    #[inline]
    pub fn is_passthrough(&self) -> bool {
        self.src_rate == self.dst_rate
    }

    /// Source rate in Hz.
    pub fn src_rate(&self) -> u32 {
        self.src_rate
    }

    /// Destination rate in Hz.
    pub fn dst_rate(&self) -> u32 {
        self.dst_rate
    }

    /// Resample the next block of a continuous stream.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        // Virtual stream: [last, input...] where `last` sits at index -1
        let last = self.last.unwrap_or(input[0]);
        let sample_at = |idx: isize| -> f32 {
            if idx < 0 { last } else { input[idx as usize] }
        };

        let estimated = ((input.len() as f64) / self.step).ceil() as usize + 1;
        let mut out = Vec::with_capacity(estimated);
        let last_index = (input.len() - 1) as f64;

        // Interpolation needs the sample after `position`; anything at or
        // beyond the final sample is produced from the next block.
        while self.position < last_index {
            let base = self.position.floor();
            let frac = (self.position - base) as f32;
            let i0 = base as isize;
            let a = sample_at(i0);
            let b = sample_at(i0 + 1);
            out.push(a + (b - a) * frac);
            self.position += self.step;
        }

        self.position -= input.len() as f64;
        self.last = input.last().copied();
        out
    }

    /// Forget stream history.
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.last = None;
    }
}

/// One-shot linear resample of a complete buffer.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> CodecResult<Vec<f32>> {
    if src_rate == 0 || dst_rate == 0 {
        return Err(CodecError::ZeroSampleRate);
    }
    if src_rate == dst_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let out_len = ((samples.len() as u64 * dst_rate as u64) / src_rate as u64).max(1) as usize;
    let step = src_rate as f64 / dst_rate as f64;
    let last = samples.len() - 1;

    Ok((0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let i0 = (pos.floor() as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let frac = (pos - i0 as f64) as f32;
            samples[i0] + (samples[i1] - samples[i0]) * frac
        })
        .collect())
}

// =============================================================================
// Analysis
// =============================================================================

/// Root-mean-square energy of a buffer (0.0 for empty input).
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

// =============================================================================
// Transport Helpers
// =============================================================================

/// Base64-encode raw PCM bytes for a JSON message.
pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

/// Decode a base64 PCM payload.
pub fn decode_base64(payload: &str) -> CodecResult<Vec<u8>> {
    BASE64_STANDARD
        .decode(payload)
        .map_err(|e| CodecError::Base64(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
