//! WaaV Duplex - full-duplex realtime voice streaming engine.
//!
//! Microphone audio is framed and streamed to a realtime speech model over a
//! persistent WebSocket; the model's streamed audio is decoded, smoothed and
//! scheduled for gapless playback. Server or local voice activity interrupts
//! the current response and silences playback immediately.

pub mod config;
pub mod core;
pub mod errors;

// Re-export commonly used items for convenience
pub use config::EngineConfig;
pub use core::*;
pub use errors::{EngineError, EngineResult};
