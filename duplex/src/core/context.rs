//! Engine-wide context.
//!
//! Configuration and shared counters are owned here and handed to each
//! component at construction.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::config::EngineConfig;

/// Counters updated by the session coordinator.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub frames_sent: AtomicU64,
    /// Capture frames produced while no transport was open
    pub frames_dropped: AtomicU64,
    pub chunks_received: AtomicU64,
    pub chunks_scheduled: AtomicU64,
    /// Chunks dropped because their response was cancelled or superseded
    pub chunks_suppressed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub playback_errors: AtomicU64,
    pub barge_ins: AtomicU64,
    pub reconnects: AtomicU64,
    pub protocol_errors: AtomicU64,
    /// Unexpected connection losses and failed reconnect attempts
    pub transport_errors: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_received: u64,
    pub chunks_scheduled: u64,
    pub chunks_suppressed: u64,
    pub decode_errors: u64,
    pub playback_errors: u64,
    pub barge_ins: u64,
    pub reconnects: u64,
    pub protocol_errors: u64,
    pub transport_errors: u64,
}

impl EngineStats {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            frames_sent: load(&self.frames_sent),
            frames_dropped: load(&self.frames_dropped),
            chunks_received: load(&self.chunks_received),
            chunks_scheduled: load(&self.chunks_scheduled),
            chunks_suppressed: load(&self.chunks_suppressed),
            decode_errors: load(&self.decode_errors),
            playback_errors: load(&self.playback_errors),
            barge_ins: load(&self.barge_ins),
            reconnects: load(&self.reconnects),
            protocol_errors: load(&self.protocol_errors),
            transport_errors: load(&self.transport_errors),
        }
    }
}

/// Configuration plus statistics, cheap to clone.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub stats: Arc<EngineStats>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            stats: Arc::new(EngineStats::default()),
        }
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let context = EngineContext::default();
        let clone = context.clone();
        EngineStats::incr(&clone.stats.barge_ins);
        EngineStats::incr(&clone.stats.barge_ins);
        assert_eq!(context.stats.snapshot().barge_ins, 2);
        assert_eq!(context.stats.snapshot().frames_sent, 0);
    }
}
