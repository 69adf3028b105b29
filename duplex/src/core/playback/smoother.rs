//! Click suppression for streamed output chunks.
//!
//! Each decoded chunk passes through three stages before it is scheduled:
//!
//! 1. DC-offset removal (skipped when the mean is negligible)
//! 2. A linear crossfade of the chunk head against the tail of the previous chunk
//! 3. Soft limiting to ±0.95
//!
//! The crossfade is only correct when chunks are applied in arrival order, and
//! the retained tail must be dropped with `reset()` whenever playback is
//! flushed so it cannot bleed into the next turn.

/// Mean magnitude below which DC removal is skipped.
pub const DC_EPSILON: f32 = 0.001;

/// Output ceiling applied after smoothing.
pub const LIMIT: f32 = 0.95;

/// Default crossfade duration in milliseconds.
pub const DEFAULT_CROSSFADE_MS: f32 = 5.0;

/// Stateful per-stream smoother.
#[derive(Debug, Clone)]
pub struct AudioSmoother {
    crossfade_samples: usize,
    dc_removal: bool,
    /// Previous chunk after smoothing
    previous: Option<Vec<f32>>,
    clamped: u64,
}

impl AudioSmoother {
    /// Create a smoother for the given output rate and crossfade duration.
    pub fn new(sample_rate: u32, crossfade_ms: f32) -> Self {
        let crossfade_samples = ((sample_rate as f32 * crossfade_ms.max(0.0)) / 1000.0).round();
        Self {
            crossfade_samples: crossfade_samples as usize,
            dc_removal: true,
            previous: None,
            clamped: 0,
        }
    }

    /// Enable or disable the DC removal stage.
    pub fn with_dc_removal(mut self, enabled: bool) -> Self {
        self.dc_removal = enabled;
        self
    }

    /// Crossfade length in samples.
    pub fn crossfade_samples(&self) -> usize {
        self.crossfade_samples
    }

    /// Total samples clamped by the limiter since creation.
    pub fn clamped_samples(&self) -> u64 {
        self.clamped
    }

    /// Run the full chain on one chunk.
    pub fn smooth(&mut self, chunk: Vec<f32>) -> Vec<f32> {
        if chunk.is_empty() {
            return chunk;
        }

        let chunk = if self.dc_removal {
            Self::remove_dc_offset(chunk)
        } else {
            chunk
        };
        let mut chunk = self.apply_crossfade(chunk);

        let mut clamped = 0u64;
        for sample in chunk.iter_mut() {
            if *sample > LIMIT {
                *sample = LIMIT;
                clamped += 1;
            } else if *sample < -LIMIT {
                *sample = -LIMIT;
                clamped += 1;
            }
        }
        if clamped > 0 {
            self.clamped += clamped;
            tracing::trace!(clamped, "limiter engaged");
        }

        self.previous = Some(chunk.clone());
        chunk
    }

    /// Subtract the buffer mean when it exceeds `DC_EPSILON`.
    ///
    /// The buffer is returned untouched otherwise.
    pub fn remove_dc_offset(mut chunk: Vec<f32>) -> Vec<f32> {
        if chunk.is_empty() {
            return chunk;
        }
        let mean = chunk.iter().map(|&s| f64::from(s)).sum::<f64>() / chunk.len() as f64;
        let mean = mean as f32;
        if mean.abs() <= DC_EPSILON {
            return chunk;
        }
        for sample in chunk.iter_mut() {
            *sample -= mean;
        }
        chunk
    }

    /// Blend the head of `chunk` with the tail of the previous chunk.
    ///
    /// Does not update the retained previous chunk; `smooth` does that after
    /// limiting.
    pub fn apply_crossfade(&self, mut chunk: Vec<f32>) -> Vec<f32> {
        let Some(previous) = self.previous.as_deref() else {
            return chunk;
        };
        let fade_len = self
            .crossfade_samples
            .min(chunk.len())
            .min(previous.len());
        if fade_len == 0 {
            return chunk;
        }

        let tail = &previous[previous.len() - fade_len..];
        for (i, sample) in chunk.iter_mut().take(fade_len).enumerate() {
            let fade_in = i as f32 / fade_len as f32;
            *sample = tail[i] * (1.0 - fade_in) + *sample * fade_in;
        }
        chunk
    }

    /// Drop the retained tail.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Whether a previous chunk is retained.
    pub fn has_history(&self) -> bool {
        self.previous.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crossfade_samples_from_duration() {
        assert_eq!(AudioSmoother::new(24000, 5.0).crossfade_samples(), 120);
        assert_eq!(AudioSmoother::new(16000, 5.0).crossfade_samples(), 80);
    }

    #[test]
    fn test_dc_removal_skips_small_offsets() {
        let chunk = vec![0.0005, -0.0001, 0.0002];
        assert_eq!(AudioSmoother::remove_dc_offset(chunk.clone()), chunk);
    }

    #[test]
    fn test_dc_removal_subtracts_mean() {
        let out = AudioSmoother::remove_dc_offset(vec![0.2, 0.4]);
        assert!((out[0] + 0.1).abs() < 1e-6);
        assert!((out[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_crossfade_midpoint_is_average() {
        let a = 0.2f32;
        let b = 0.6f32;
        let mut smoother = AudioSmoother::new(16000, 5.0).with_dc_removal(false);
        smoother.smooth(vec![a; 200]);

        let out = smoother.smooth(vec![b; 200]);
        let fade_len = smoother.crossfade_samples();
        assert!((out[fade_len / 2] - (a + b) / 2.0).abs() < 1e-6);
        // First sample is still the previous tail, past the fade is untouched
        assert!((out[0] - a).abs() < 1e-6);
        assert!((out[fade_len] - b).abs() < 1e-6);
    }

    #[test]
    fn test_crossfade_limited_by_short_chunks() {
        let mut smoother = AudioSmoother::new(16000, 5.0).with_dc_removal(false);
        smoother.smooth(vec![0.5; 10]);
        let out = smoother.apply_crossfade(vec![0.0; 4]);
        // fade_len = min(80, 4, 10) = 4
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[2] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_limiter_counts_clamped_samples() {
        let mut smoother = AudioSmoother::new(16000, 5.0).with_dc_removal(false);
        let out = smoother.smooth(vec![1.0, -1.0, 0.5]);
        assert_eq!(out, vec![LIMIT, -LIMIT, 0.5]);
        assert_eq!(smoother.clamped_samples(), 2);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut smoother = AudioSmoother::new(16000, 5.0).with_dc_removal(false);
        smoother.smooth(vec![0.9; 100]);
        assert!(smoother.has_history());

        smoother.reset();
        assert!(!smoother.has_history());
        let out = smoother.smooth(vec![0.1; 100]);
        assert!((out[0] - 0.1).abs() < 1e-6);
    }
}
